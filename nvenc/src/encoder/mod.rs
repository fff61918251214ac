mod buffer;
mod builder;
mod config;
mod device;
mod output;
mod timestamps;

pub use self::{
    builder::{create_session, SessionBuilder},
    config::{
        buffer_schedule, configure, select_preset, BufferSchedule, Degradation, PresetChoice,
        SessionConfig, DEFAULT_LOOKAHEAD_DEPTH, EXTRA_BUFFERS, MAX_BUFFERS, MIN_BUFFERS,
    },
    device::{
        BitstreamBuffer, Capabilities, Capability, CodecProfile, ConstQp, DeviceCall,
        DevicePreset, DeviceResult, EncodeConfig, EncodeDevice, H264Config, InitializeParams,
        InputSurface, LockedBitstream, MappedInput, PictureParams, PictureType, RateControlMode,
        RcParams, ReconfigureParams, RegisteredResource, TextureHandle, VuiParameters,
    },
    output::{CodecHeaders, Packet, PacketType},
};

use self::{
    buffer::SessionResources,
    device::DeviceResultExt,
    timestamps::TimestampQueue,
};
use crate::{avc, error::DeviceStatus, settings::VideoInfo, NvEncError, Result};
use bytes::Bytes;
use std::collections::BTreeSet;

/// Features an encoder advertises to the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncoderCap {
    /// Frames are passed as texture handles instead of CPU memory.
    PassTexture,
    DynamicBitrate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub codec: &'static str,
    pub caps: BTreeSet<EncoderCap>,
}

impl EncoderInfo {
    #[inline]
    pub fn has(&self, cap: EncoderCap) -> bool {
        self.caps.contains(&cap)
    }
}

pub fn encoder_info() -> EncoderInfo {
    EncoderInfo {
        id: "nvenc_texture_h264",
        name: "NVIDIA NVENC H.264 (texture)",
        codec: "h264",
        caps: [EncoderCap::PassTexture, EncoderCap::DynamicBitrate]
            .into_iter()
            .collect(),
    }
}

/// Stage of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing submitted yet.
    Idle,
    /// Frames are queued but none has come out.
    Submitting,
    /// Every submit drains the oldest frame.
    DrainingSteady,
    /// End of stream was signaled, only draining is possible.
    Finalizing,
    Closed,
}

/// An initialized encoder with its slot pool.
///
/// Frames go in through [`Session::submit`] and come out in submission order once
/// `output_delay` frames are queued. Dropping the session flushes and releases everything; use
/// [`Session::close`] to get the flushed packets.
pub struct Session<D: EncodeDevice> {
    device: D,
    resources: SessionResources,
    timestamps: TimestampQueue,
    config: SessionConfig,
    video: VideoInfo,
    name: String,
    encode_started: bool,
    end_of_stream: bool,
    closed: bool,
    headers: Option<CodecHeaders>,
}

impl<D: EncodeDevice> Drop for Session<D> {
    fn drop(&mut self) {
        let packets = self.close();
        if !packets.is_empty() {
            log::debug!("[{}] dropped {} flushed packets", self.name, packets.len());
        }
    }
}

impl<D: EncodeDevice> Session<D> {
    pub(crate) fn new(
        device: D,
        resources: SessionResources,
        config: SessionConfig,
        video: VideoInfo,
        name: String,
    ) -> Self {
        Session {
            device,
            timestamps: TimestampQueue::with_capacity(resources.pool.capacity()),
            resources,
            config,
            video,
            name,
            encode_started: false,
            end_of_stream: false,
            closed: false,
            headers: None,
        }
    }

    /// Encodes the frame in `texture`. Returns the oldest queued frame once more than
    /// `output_delay` frames are in flight.
    pub fn submit(&mut self, texture: TextureHandle, pts: i64) -> Result<Option<Packet>> {
        if !texture.is_valid() {
            log::error!("[{}] Encode failed: bad texture handle", self.name);
            return Err(NvEncError::InvalidTexture);
        }
        if self.end_of_stream {
            return Err(NvEncError::EndOfStream);
        }

        self.device.enter_graphics();
        let result = self.submit_frame(texture, pts);
        self.device.leave_graphics();
        result
    }

    fn submit_frame(&mut self, texture: TextureHandle, pts: i64) -> Result<Option<Packet>> {
        let (width, height) = (self.video.width, self.video.height);
        let device = &mut self.device;
        let mut slot = self
            .resources
            .pool
            .writer_slot()
            .ok_or(NvEncError::PipelineFull)?;
        let output = slot.output()?;
        let (surface, registered) = slot.input()?;

        // Left over from a failed submit
        if let Some(stale) = slot.mapped {
            device
                .unmap_input(stale)
                .check(DeviceCall::UnmapInputResource)?;
            slot.mapped = None;
        }

        device
            .copy_texture(texture, surface, width, height)
            .check(DeviceCall::CopyTexture)?;

        let mapped = device
            .map_input(registered)
            .check(DeviceCall::MapInputResource)?;
        slot.mapped = Some(mapped);

        let params = PictureParams::frame(mapped, output, width, height, pts);
        let encoded = match device.encode_picture(&params) {
            Err(DeviceStatus::NeedMoreInput) => Ok(()),
            other => other,
        };
        if let Err(err) = encoded.check(DeviceCall::EncodePicture) {
            if device.unmap_input(mapped).is_ok() {
                slot.mapped = None;
            }
            return Err(err);
        }

        slot.commit();
        let pushed = self.timestamps.push(pts);
        debug_assert!(pushed, "timestamp queue is sized like the pool");
        debug_assert_eq!(self.timestamps.len(), self.resources.pool.queued());
        self.encode_started = true;

        // `output_delay` frames stay buffered, the one beyond them is drained
        let mut packets = Vec::with_capacity(1);
        if self.resources.pool.queued() > self.config.output_delay as usize {
            self.drain_into(false, &mut packets)?;
        }
        Ok(packets.pop())
    }

    /// Drains queued frames. Without `finalize` at most one frame is drained, and only once
    /// `output_delay` frames are queued; with it every queued frame is drained.
    pub fn drain(&mut self, finalize: bool) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        self.drain_into(finalize, &mut packets)?;
        Ok(packets)
    }

    /// Like [`Session::drain`]. Packets drained before an error are kept in `packets`.
    pub fn drain_into(&mut self, finalize: bool, packets: &mut Vec<Packet>) -> Result<()> {
        let queued = self.resources.pool.queued();
        if self.closed || queued == 0 {
            return Ok(());
        }
        if !finalize && queued < self.config.output_delay as usize {
            return Ok(());
        }

        let count = if finalize { queued } else { 1 };
        packets.reserve(count);
        for _ in 0..count {
            match self.drain_slot()? {
                Some(packet) => packets.push(packet),
                None => break,
            }
        }
        Ok(())
    }

    fn drain_slot(&mut self) -> Result<Option<Packet>> {
        let frame_delay =
            i64::from(self.config.bframes).saturating_mul(self.video.frame_duration());
        let device = &mut self.device;
        let mut slot = match self.resources.pool.reader_slot() {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let output = slot.output()?;

        let locked = device
            .lock_bitstream(output)
            .check(DeviceCall::LockBitstream)?;
        let pts = locked.output_timestamp;
        let keyframe = locked.picture_type == PictureType::Idr;
        let (data, headers) = if self.headers.is_none() {
            let parts = avc::extract_headers(locked.data);
            let headers = CodecHeaders {
                header: parts.header,
                sei: parts.sei,
            };
            (parts.packet, Some(headers))
        } else {
            (Bytes::copy_from_slice(locked.data), None)
        };

        device
            .unlock_bitstream(output)
            .check(DeviceCall::UnlockBitstream)?;

        if let Some(mapped) = slot.mapped {
            device
                .unmap_input(mapped)
                .check(DeviceCall::UnmapInputResource)?;
            slot.mapped = None;
        }
        slot.release();

        let queued_pts = self.timestamps.pop().unwrap_or(pts);
        if headers.is_some() {
            self.headers = headers;
        }

        Ok(Some(Packet {
            data,
            pts,
            dts: queued_pts.saturating_sub(frame_delay),
            keyframe,
            kind: PacketType::Video,
        }))
    }

    /// Signals end of stream and drains every queued frame. No frame can be submitted after.
    pub fn finish(&mut self) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        self.finish_into(&mut packets)?;
        Ok(packets)
    }

    /// Like [`Session::finish`]. Packets drained before an error are kept in `packets`.
    pub fn finish_into(&mut self, packets: &mut Vec<Packet>) -> Result<()> {
        if self.end_of_stream {
            return Err(NvEncError::EndOfStream);
        }
        self.end_of_stream = true;
        if !self.encode_started {
            return Ok(());
        }

        self.device.enter_graphics();
        let result = self
            .send_end_of_stream()
            .and_then(|()| self.drain_into(true, packets));
        self.device.leave_graphics();
        result
    }

    fn send_end_of_stream(&mut self) -> Result<()> {
        let sent = match self.device.encode_picture(&PictureParams::end_of_stream()) {
            Err(DeviceStatus::NeedMoreInput) => Ok(()),
            other => other,
        };
        sent.check(DeviceCall::EncodePicture)
    }

    /// Flushes the encoder and releases every device resource. Failures are logged and the
    /// teardown carries on. Returns the flushed packets.
    pub fn close(&mut self) -> Vec<Packet> {
        if self.closed {
            return Vec::new();
        }

        let mut packets = Vec::new();
        if self.encode_started {
            self.device.enter_graphics();
            if !self.end_of_stream {
                self.end_of_stream = true;
                if let Err(err) = self.send_end_of_stream() {
                    log::warn!("[{}] failed to signal end of stream: {err}", self.name);
                }
            }
            if let Err(err) = self.drain_into(true, &mut packets) {
                log::warn!("[{}] failed to flush the encoder: {err}", self.name);
            }
            self.device.leave_graphics();
        }

        self.resources.release(&mut self.device);
        self.end_of_stream = true;
        self.closed = true;
        log::debug!("[{}] session closed", self.name);
        packets
    }

    /// Changes the target bitrate (kbps) without restarting the session. Forces an IDR.
    pub fn reconfigure(&mut self, bitrate: u32) -> Result<()> {
        if self.end_of_stream {
            return Err(NvEncError::EndOfStream);
        }
        if !self.config.can_change_bitrate {
            log::warn!(
                "[{}] cannot change bitrate to {bitrate} kbps, keeping {} kbps",
                self.name,
                self.config.bitrate
            );
            return Err(NvEncError::BitrateChangeUnsupported);
        }

        let rc = &mut self.config.params.config.rc;
        let previous = (rc.average_bitrate, rc.max_bitrate);
        let bits = bitrate.saturating_mul(1000);
        rc.average_bitrate = bits;
        rc.max_bitrate = bits;

        let params = ReconfigureParams {
            init: self.config.params.clone(),
            reset_encoder: true,
            force_idr: true,
        };
        if let Err(err) = self
            .device
            .reconfigure(&params)
            .check(DeviceCall::ReconfigureEncoder)
        {
            let rc = &mut self.config.params.config.rc;
            (rc.average_bitrate, rc.max_bitrate) = previous;
            return Err(err);
        }

        log::info!("[{}] bitrate changed to {bitrate} kbps", self.name);
        self.config.bitrate = bitrate;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.end_of_stream {
            SessionState::Finalizing
        } else if !self.encode_started {
            SessionState::Idle
        } else if self.headers.is_some() {
            SessionState::DrainingSteady
        } else {
            SessionState::Submitting
        }
    }

    /// Number of submitted frames not drained yet.
    #[inline]
    pub fn buffers_queued(&self) -> usize {
        self.resources.pool.queued()
    }

    /// Slot the next frame is submitted into.
    #[inline]
    pub fn next_bitstream(&self) -> usize {
        self.resources.pool.next_index()
    }

    /// Slot the next frame is drained from.
    #[inline]
    pub fn cur_bitstream(&self) -> usize {
        self.resources.pool.current_index()
    }

    #[inline]
    pub fn buf_count(&self) -> usize {
        self.resources.pool.capacity()
    }

    #[inline]
    pub fn output_delay(&self) -> usize {
        self.config.output_delay as usize
    }

    /// SPS and PPS of the stream. `None` until the first frame is drained.
    pub fn extra_data(&self) -> Option<&Bytes> {
        self.headers.as_ref().map(|headers| &headers.header)
    }

    /// SEI of the first frame. `None` until the first frame is drained.
    pub fn sei_data(&self) -> Option<&Bytes> {
        self.headers.as_ref().map(|headers| &headers.sei)
    }

    #[inline]
    pub fn can_change_bitrate(&self) -> bool {
        self.config.can_change_bitrate
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[inline]
    pub fn degradations(&self) -> &[Degradation] {
        &self.config.degradations
    }

    #[inline]
    pub fn video(&self) -> &VideoInfo {
        &self.video
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_capabilities() {
        let info = encoder_info();
        assert_eq!(info.codec, "h264");
        assert!(info.has(EncoderCap::PassTexture));
        assert!(info.has(EncoderCap::DynamicBitrate));
    }
}
