//! In-memory [`EncodeDevice`] that behaves like the hardware encoder closely enough to drive a
//! [`Session`](crate::Session) without a GPU.
//!
//! Frames come out in submission order. The first `bf` pictures after a flush are held for
//! reordering and reported with [`DeviceStatus::NeedMoreInput`]. Every output is an Annex-B
//! stream; the first one carries SPS, PPS and SEI.

use crate::{
    encoder::{
        BitstreamBuffer, Capability, CodecProfile, DeviceCall, DevicePreset, DeviceResult,
        EncodeConfig, EncodeDevice, InitializeParams, InputSurface, LockedBitstream, MappedInput,
        PictureParams, PictureType, RateControlMode, ReconfigureParams, RegisteredResource,
        TextureHandle,
    },
    error::DeviceStatus,
};
use std::{
    cell::{RefCell, RefMut},
    collections::{BTreeMap, BTreeSet, VecDeque},
    num::NonZeroU64,
    rc::Rc,
};

pub const MOCK_SPS: &[u8] = &[0x67, 0x64, 0x00, 0x28, 0xac];
pub const MOCK_PPS: &[u8] = &[0x68, 0xee, 0x3c, 0x80];
pub const MOCK_SEI: &[u8] = &[0x06, 0x05, 0x10, 0xb9, 0xed];
const AUD: &[u8] = &[0x09, 0xf0];
const START_CODE: &[u8] = &[0, 0, 0, 1];

#[derive(Debug, Clone)]
struct Output {
    data: Vec<u8>,
    timestamp: i64,
    picture_type: PictureType,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    call: DeviceCall,
    nth: usize,
    status: DeviceStatus,
}

#[derive(Debug, Default)]
struct MockState {
    capabilities: BTreeMap<Capability, i32>,
    preset_lookahead: Option<u32>,

    failures: Vec<Failure>,
    journal: Vec<DeviceCall>,
    call_counts: BTreeMap<DeviceCall, usize>,

    next_handle: u64,
    session_open: bool,
    destroyed: bool,
    params: Option<InitializeParams>,
    reconfigurations: Vec<ReconfigureParams>,

    bitstreams: BTreeMap<BitstreamBuffer, Option<Output>>,
    locked: BTreeSet<BitstreamBuffer>,
    surfaces: BTreeSet<InputSurface>,
    registered: BTreeMap<RegisteredResource, InputSurface>,
    mapped: BTreeMap<MappedInput, RegisteredResource>,

    /// Pictures accepted but not encoded yet, oldest first.
    held: VecDeque<(BitstreamBuffer, i64)>,
    frames_encoded: u64,
    force_idr: bool,
    eos_received: bool,

    graphics_depth: usize,
    graphics_violations: usize,
}

impl MockState {
    fn next_handle(&mut self) -> DeviceResult<NonZeroU64> {
        self.next_handle = self
            .next_handle
            .checked_add(1)
            .ok_or(DeviceStatus::OutOfMemory)?;
        NonZeroU64::new(self.next_handle).ok_or(DeviceStatus::OutOfMemory)
    }

    fn params(&self) -> DeviceResult<&InitializeParams> {
        self.params
            .as_ref()
            .ok_or(DeviceStatus::EncoderNotInitialized)
    }

    fn require_session(&self) -> DeviceResult<()> {
        if self.session_open {
            Ok(())
        } else {
            Err(DeviceStatus::InvalidCall)
        }
    }

    fn touch_graphics(&mut self) {
        if self.graphics_depth == 0 {
            self.graphics_violations += 1;
        }
    }

    fn reorder_depth(&self) -> usize {
        self.params
            .as_ref()
            .map_or(0, |p| p.config.frame_interval_p.saturating_sub(1) as usize)
    }

    /// Encodes the oldest held picture into its buffer.
    fn encode_next(&mut self) -> DeviceResult<()> {
        let Some((buffer, timestamp)) = self.held.pop_front() else {
            return Ok(());
        };
        let (gop, repeat_headers, aud) = {
            let config = &self.params()?.config;
            (
                u64::from(config.gop_length),
                config.h264.repeat_sps_pps,
                config.h264.output_aud,
            )
        };

        let index = self.frames_encoded;
        let forced = std::mem::take(&mut self.force_idr);
        let idr = index == 0 || forced || (gop > 0 && index % gop == 0);
        let picture_type = if idr { PictureType::Idr } else { PictureType::P };

        let mut data = Vec::new();
        if aud {
            push_nal(&mut data, AUD);
        }
        if index == 0 || (idr && repeat_headers) {
            push_nal(&mut data, MOCK_SPS);
            push_nal(&mut data, MOCK_PPS);
        }
        if index == 0 {
            push_nal(&mut data, MOCK_SEI);
        }
        let mut slice = vec![if idr { 0x65 } else { 0x41 }];
        slice.extend_from_slice(format!("frame{index}").as_bytes());
        push_nal(&mut data, &slice);

        self.frames_encoded += 1;
        self.bitstreams.insert(
            buffer,
            Some(Output {
                data,
                timestamp,
                picture_type,
            }),
        );
        Ok(())
    }

    fn flush(&mut self) -> DeviceResult<()> {
        while !self.held.is_empty() {
            self.encode_next()?;
        }
        Ok(())
    }

    fn lock(&mut self, buffer: BitstreamBuffer) -> DeviceResult<Output> {
        let pending = match self.bitstreams.get(&buffer) {
            None => return Err(DeviceStatus::InvalidParam),
            Some(output) => output.is_none(),
        };
        if pending {
            // Locking waits for the picture, which completes everything queued before it
            let position = self
                .held
                .iter()
                .position(|&(held, _)| held == buffer)
                .ok_or(DeviceStatus::LockBusy)?;
            for _ in 0..=position {
                self.encode_next()?;
            }
        }

        let output = self
            .bitstreams
            .get(&buffer)
            .cloned()
            .flatten()
            .ok_or(DeviceStatus::LockBusy)?;
        self.locked.insert(buffer);
        Ok(output)
    }
}

fn push_nal(data: &mut Vec<u8>, nal: &[u8]) {
    data.extend_from_slice(START_CODE);
    data.extend_from_slice(nal);
}

/// Cloning shares the device, so a clone kept by a test observes what a session does with it.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Rc<RefCell<MockState>>,
    locked_data: Vec<u8>,
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice::new()
    }
}

impl MockDevice {
    /// A device that supports every [`Capability`].
    pub fn new() -> Self {
        let state = MockState {
            capabilities: Capability::ALL.into_iter().map(|cap| (cap, 1)).collect(),
            ..Default::default()
        };
        MockDevice {
            state: Rc::new(RefCell::new(state)),
            locked_data: Vec::new(),
        }
    }

    pub fn with_capability(self, cap: Capability, value: i32) -> Self {
        self.state.borrow_mut().capabilities.insert(cap, value);
        self
    }

    pub fn without_capability(self, cap: Capability) -> Self {
        self.state.borrow_mut().capabilities.remove(&cap);
        self
    }

    /// Presets enable look-ahead with `depth` by default.
    pub fn with_preset_lookahead(self, depth: u32) -> Self {
        self.state.borrow_mut().preset_lookahead = Some(depth);
        self
    }

    /// Makes the `nth` call (counting from 0 since creation) to `call` fail with `status`.
    pub fn fail(&self, call: DeviceCall, nth: usize, status: DeviceStatus) {
        self.state
            .borrow_mut()
            .failures
            .push(Failure { call, nth, status });
    }

    /// Makes the next call to `call` fail with `status`.
    pub fn fail_next(&self, call: DeviceCall, status: DeviceStatus) {
        let nth = self.calls(call);
        self.fail(call, nth, status);
    }

    /// Every call made so far, in order.
    pub fn journal(&self) -> Vec<DeviceCall> {
        self.state.borrow().journal.clone()
    }

    pub fn calls(&self, call: DeviceCall) -> usize {
        self.state
            .borrow()
            .call_counts
            .get(&call)
            .copied()
            .unwrap_or(0)
    }

    /// Buffers, surfaces, registrations and mappings not released yet.
    pub fn live_resources(&self) -> usize {
        let state = self.state.borrow();
        state.bitstreams.len() + state.surfaces.len() + state.registered.len() + state.mapped.len()
    }

    pub fn mapped_inputs(&self) -> usize {
        self.state.borrow().mapped.len()
    }

    pub fn session_open(&self) -> bool {
        self.state.borrow().session_open
    }

    pub fn destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    pub fn eos_received(&self) -> bool {
        self.state.borrow().eos_received
    }

    pub fn frames_encoded(&self) -> u64 {
        self.state.borrow().frames_encoded
    }

    /// Parameters the encoder was last initialized or reconfigured with.
    pub fn initialize_params(&self) -> Option<InitializeParams> {
        self.state.borrow().params.clone()
    }

    pub fn reconfigurations(&self) -> Vec<ReconfigureParams> {
        self.state.borrow().reconfigurations.clone()
    }

    pub fn graphics_depth(&self) -> usize {
        self.state.borrow().graphics_depth
    }

    /// Number of graphics calls made without holding the graphics context.
    pub fn graphics_violations(&self) -> usize {
        self.state.borrow().graphics_violations
    }

    /// Records `call` and applies any failure injected for it.
    fn begin(&self, call: DeviceCall) -> DeviceResult<RefMut<'_, MockState>> {
        let mut state = self.state.borrow_mut();
        state.journal.push(call);
        let count = state.call_counts.entry(call).or_insert(0);
        let nth = *count;
        *count += 1;

        let injected = state
            .failures
            .iter()
            .position(|failure| failure.call == call && failure.nth == nth);
        if let Some(index) = injected {
            return Err(state.failures.remove(index).status);
        }
        Ok(state)
    }
}

impl EncodeDevice for MockDevice {
    fn open_session(&mut self) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::OpenSession)?;
        if state.session_open {
            return Err(DeviceStatus::InvalidCall);
        }
        state.session_open = true;
        Ok(())
    }

    fn capability(&mut self, cap: Capability) -> DeviceResult<i32> {
        let state = self.begin(DeviceCall::GetCapability)?;
        state.require_session()?;
        Ok(state.capabilities.get(&cap).copied().unwrap_or(0))
    }

    fn preset_config(&mut self, preset: DevicePreset) -> DeviceResult<EncodeConfig> {
        let state = self.begin(DeviceCall::GetPresetConfig)?;
        state.require_session()?;

        let lossless = preset.is_lossless();
        if lossless && state.capabilities.get(&Capability::Lossless).copied().unwrap_or(0) <= 0 {
            return Err(DeviceStatus::UnsupportedParam);
        }

        let mut config = EncodeConfig {
            profile: if lossless {
                CodecProfile::High444
            } else {
                CodecProfile::High
            },
            gop_length: 30,
            frame_interval_p: 1,
            ..Default::default()
        };
        config.rc.mode = if lossless {
            RateControlMode::ConstQp
        } else {
            RateControlMode::Cbr
        };
        if let Some(depth) = state.preset_lookahead {
            config.rc.enable_lookahead = true;
            config.rc.lookahead_depth = depth;
        }
        Ok(config)
    }

    fn initialize(&mut self, params: &InitializeParams) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::InitializeEncoder)?;
        state.require_session()?;
        if params.width == 0 || params.height == 0 {
            return Err(DeviceStatus::InvalidParam);
        }
        state.params = Some(params.clone());
        Ok(())
    }

    fn reconfigure(&mut self, params: &ReconfigureParams) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::ReconfigureEncoder)?;
        state.params()?;
        state.params = Some(params.init.clone());
        state.force_idr |= params.force_idr;
        state.reconfigurations.push(params.clone());
        Ok(())
    }

    fn create_bitstream_buffer(&mut self) -> DeviceResult<BitstreamBuffer> {
        let mut state = self.begin(DeviceCall::CreateBitstreamBuffer)?;
        state.params()?;
        let buffer = BitstreamBuffer::from_raw(state.next_handle()?);
        state.bitstreams.insert(buffer, None);
        Ok(buffer)
    }

    fn destroy_bitstream_buffer(&mut self, buffer: BitstreamBuffer) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::DestroyBitstreamBuffer)?;
        state.locked.remove(&buffer);
        state.held.retain(|&(held, _)| held != buffer);
        state
            .bitstreams
            .remove(&buffer)
            .map(drop)
            .ok_or(DeviceStatus::InvalidParam)
    }

    fn create_input_surface(&mut self, width: u32, height: u32) -> DeviceResult<InputSurface> {
        let mut state = self.begin(DeviceCall::CreateInputSurface)?;
        state.touch_graphics();
        if width == 0 || height == 0 {
            return Err(DeviceStatus::Graphics);
        }
        let surface = InputSurface::from_raw(state.next_handle()?);
        state.surfaces.insert(surface);
        Ok(surface)
    }

    fn destroy_input_surface(&mut self, surface: InputSurface) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::DestroyInputSurface)?;
        state.touch_graphics();
        if state.surfaces.remove(&surface) {
            Ok(())
        } else {
            Err(DeviceStatus::Graphics)
        }
    }

    fn register_resource(&mut self, surface: InputSurface) -> DeviceResult<RegisteredResource> {
        let mut state = self.begin(DeviceCall::RegisterResource)?;
        if !state.surfaces.contains(&surface) {
            return Err(DeviceStatus::ResourceRegisterFailed);
        }
        let resource = RegisteredResource::from_raw(state.next_handle()?);
        state.registered.insert(resource, surface);
        Ok(resource)
    }

    fn unregister_resource(&mut self, resource: RegisteredResource) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::UnregisterResource)?;
        state
            .registered
            .remove(&resource)
            .map(drop)
            .ok_or(DeviceStatus::ResourceNotRegistered)
    }

    fn map_input(&mut self, resource: RegisteredResource) -> DeviceResult<MappedInput> {
        let mut state = self.begin(DeviceCall::MapInputResource)?;
        if !state.registered.contains_key(&resource) {
            return Err(DeviceStatus::ResourceNotRegistered);
        }
        let mapped = MappedInput::from_raw(state.next_handle()?);
        state.mapped.insert(mapped, resource);
        Ok(mapped)
    }

    fn unmap_input(&mut self, input: MappedInput) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::UnmapInputResource)?;
        state
            .mapped
            .remove(&input)
            .map(drop)
            .ok_or(DeviceStatus::ResourceNotMapped)
    }

    fn copy_texture(
        &mut self,
        src: TextureHandle,
        dst: InputSurface,
        width: u32,
        height: u32,
    ) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::CopyTexture)?;
        state.touch_graphics();
        if !src.is_valid() || !state.surfaces.contains(&dst) || width == 0 || height == 0 {
            return Err(DeviceStatus::Graphics);
        }
        Ok(())
    }

    fn encode_picture(&mut self, params: &PictureParams) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::EncodePicture)?;
        state.params()?;

        if params.end_of_stream {
            state.eos_received = true;
            return state.flush();
        }

        let (Some(input), Some(output)) = (params.input, params.output) else {
            return Err(DeviceStatus::InvalidPtr);
        };
        if !state.mapped.contains_key(&input) {
            return Err(DeviceStatus::ResourceNotMapped);
        }
        match state.bitstreams.get_mut(&output) {
            Some(slot) => *slot = None,
            None => return Err(DeviceStatus::InvalidParam),
        }

        state.held.push_back((output, params.input_timestamp));
        if state.held.len() > state.reorder_depth() {
            state.encode_next()?;
            Ok(())
        } else {
            Err(DeviceStatus::NeedMoreInput)
        }
    }

    fn lock_bitstream(&mut self, buffer: BitstreamBuffer) -> DeviceResult<LockedBitstream<'_>> {
        let mut state = self.begin(DeviceCall::LockBitstream)?;
        let output = state.lock(buffer)?;
        drop(state);

        self.locked_data = output.data;
        Ok(LockedBitstream {
            data: &self.locked_data,
            output_timestamp: output.timestamp,
            picture_type: output.picture_type,
        })
    }

    fn unlock_bitstream(&mut self, buffer: BitstreamBuffer) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::UnlockBitstream)?;
        if !state.locked.remove(&buffer) {
            return Err(DeviceStatus::InvalidCall);
        }
        if let Some(output) = state.bitstreams.get_mut(&buffer) {
            *output = None;
        }
        Ok(())
    }

    fn destroy_encoder(&mut self) -> DeviceResult<()> {
        let mut state = self.begin(DeviceCall::DestroyEncoder)?;
        state.require_session()?;
        state.session_open = false;
        state.destroyed = true;
        state.params = None;
        state.held.clear();
        Ok(())
    }

    fn enter_graphics(&mut self) {
        self.state.borrow_mut().graphics_depth += 1;
    }

    fn leave_graphics(&mut self) {
        let mut state = self.state.borrow_mut();
        state.graphics_depth = state.graphics_depth.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avc::nalu_chunks;

    fn initialized(bframes: u32) -> MockDevice {
        let mut device = MockDevice::new();
        device.open_session().unwrap();
        let mut config = device.preset_config(DevicePreset::Hq).unwrap();
        config.frame_interval_p = bframes + 1;
        config.gop_length = 4;
        device
            .initialize(&InitializeParams {
                preset: DevicePreset::Hq,
                width: 64,
                height: 64,
                dar_width: 1,
                dar_height: 1,
                frame_rate_num: 30,
                frame_rate_den: 1,
                enable_ptd: true,
                config,
            })
            .unwrap();
        device
    }

    fn submit(device: &mut MockDevice, pts: i64) -> (BitstreamBuffer, DeviceResult<()>) {
        let buffer = device.create_bitstream_buffer().unwrap();
        device.enter_graphics();
        let surface = device.create_input_surface(64, 64).unwrap();
        device.leave_graphics();
        let resource = device.register_resource(surface).unwrap();
        let mapped = device.map_input(resource).unwrap();
        let result = device.encode_picture(&PictureParams::frame(mapped, buffer, 64, 64, pts));
        (buffer, result)
    }

    #[test]
    fn holds_pictures_for_reordering() {
        let mut device = initialized(2);
        let (first, result) = submit(&mut device, 0);
        assert_eq!(result, Err(DeviceStatus::NeedMoreInput));
        assert_eq!(submit(&mut device, 1).1, Err(DeviceStatus::NeedMoreInput));
        assert_eq!(submit(&mut device, 2).1, Ok(()));
        assert_eq!(device.frames_encoded(), 1);

        let locked = device.lock_bitstream(first).unwrap();
        assert_eq!(locked.output_timestamp, 0);
        assert_eq!(locked.picture_type, PictureType::Idr);
        let nalus: Vec<u8> = nalu_chunks(locked.data).map(|nalu| nalu[0] & 0x1f).collect();
        assert_eq!(nalus, vec![7, 8, 6, 5]);
        device.unlock_bitstream(first).unwrap();
    }

    #[test]
    fn lock_completes_held_pictures() {
        let mut device = initialized(2);
        let (first, _) = submit(&mut device, 0);
        let (second, _) = submit(&mut device, 1);

        let locked = device.lock_bitstream(second).unwrap();
        assert_eq!(locked.output_timestamp, 1);
        assert_eq!(locked.picture_type, PictureType::P);
        assert_eq!(device.frames_encoded(), 2);
        device.unlock_bitstream(second).unwrap();
        assert!(device.lock_bitstream(first).is_ok());
    }

    #[test]
    fn end_of_stream_flushes() {
        let mut device = initialized(3);
        for pts in 0..3 {
            let (_, result) = submit(&mut device, pts);
            assert_eq!(result, Err(DeviceStatus::NeedMoreInput));
        }
        assert_eq!(device.frames_encoded(), 0);
        device.encode_picture(&PictureParams::end_of_stream()).unwrap();
        assert!(device.eos_received());
        assert_eq!(device.frames_encoded(), 3);
    }

    #[test]
    fn injected_failures_hit_the_nth_call() {
        let mut device = MockDevice::new();
        device.fail(DeviceCall::GetCapability, 1, DeviceStatus::Generic);
        device.open_session().unwrap();

        assert_eq!(device.capability(Capability::Lossless), Ok(1));
        assert_eq!(
            device.capability(Capability::Lookahead),
            Err(DeviceStatus::Generic)
        );
        assert_eq!(device.capability(Capability::Lookahead), Ok(1));
        assert_eq!(device.calls(DeviceCall::GetCapability), 3);
        assert_eq!(
            device.journal(),
            vec![
                DeviceCall::OpenSession,
                DeviceCall::GetCapability,
                DeviceCall::GetCapability,
                DeviceCall::GetCapability,
            ]
        );
    }

    #[test]
    fn graphics_calls_outside_the_context_are_counted() {
        let mut device = initialized(0);
        device.create_input_surface(64, 64).unwrap();
        assert_eq!(device.graphics_violations(), 1);

        device.enter_graphics();
        device.create_input_surface(64, 64).unwrap();
        device.leave_graphics();
        assert_eq!(device.graphics_violations(), 1);
        assert_eq!(device.graphics_depth(), 0);
    }

    #[test]
    fn resources_require_an_initialized_encoder() {
        let mut device = MockDevice::new();
        assert_eq!(
            device.create_bitstream_buffer(),
            Err(DeviceStatus::EncoderNotInitialized)
        );
        assert_eq!(device.live_resources(), 0);
    }
}
