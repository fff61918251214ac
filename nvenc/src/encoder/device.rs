use crate::{error::DeviceStatus, NvEncError, Result};
use std::{collections::BTreeMap, fmt, num::NonZeroU64};

/// Result of a single device call.
pub type DeviceResult<T> = std::result::Result<T, DeviceStatus>;

macro_rules! device_handle {
    ($($(#[$meta:meta])* $name:ident;)+) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(NonZeroU64);

            impl $name {
                #[inline]
                pub fn from_raw(raw: NonZeroU64) -> Self {
                    $name(raw)
                }

                #[inline]
                pub fn as_raw(self) -> NonZeroU64 {
                    self.0
                }
            }
        )+
    };
}

device_handle! {
    /// Device-side buffer the encoded bitstream is written to.
    BitstreamBuffer;
    /// Texture owned by the session that caller frames are copied into.
    InputSurface;
    /// An [`InputSurface`] registered with the encoder.
    RegisteredResource;
    /// A [`RegisteredResource`] mapped for one encode call.
    MappedInput;
}

/// Texture handle passed in by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

impl TextureHandle {
    /// Marker the frame source uses when it has no texture to give.
    pub const INVALID: TextureHandle = TextureHandle(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != TextureHandle::INVALID
    }
}

/// Names the device entry point a status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceCall {
    OpenSession,
    GetCapability,
    GetPresetConfig,
    InitializeEncoder,
    ReconfigureEncoder,
    CreateBitstreamBuffer,
    DestroyBitstreamBuffer,
    CreateInputSurface,
    DestroyInputSurface,
    RegisterResource,
    UnregisterResource,
    MapInputResource,
    UnmapInputResource,
    CopyTexture,
    EncodePicture,
    LockBitstream,
    UnlockBitstream,
    DestroyEncoder,
}

impl DeviceCall {
    pub fn name(self) -> &'static str {
        match self {
            DeviceCall::OpenSession => "nvEncOpenEncodeSessionEx",
            DeviceCall::GetCapability => "nvEncGetEncodeCaps",
            DeviceCall::GetPresetConfig => "nvEncGetEncodePresetConfig",
            DeviceCall::InitializeEncoder => "nvEncInitializeEncoder",
            DeviceCall::ReconfigureEncoder => "nvEncReconfigureEncoder",
            DeviceCall::CreateBitstreamBuffer => "nvEncCreateBitstreamBuffer",
            DeviceCall::DestroyBitstreamBuffer => "nvEncDestroyBitstreamBuffer",
            DeviceCall::CreateInputSurface => "create_input_surface",
            DeviceCall::DestroyInputSurface => "destroy_input_surface",
            DeviceCall::RegisterResource => "nvEncRegisterResource",
            DeviceCall::UnregisterResource => "nvEncUnregisterResource",
            DeviceCall::MapInputResource => "nvEncMapInputResource",
            DeviceCall::UnmapInputResource => "nvEncUnmapInputResource",
            DeviceCall::CopyTexture => "copy_texture",
            DeviceCall::EncodePicture => "nvEncEncodePicture",
            DeviceCall::LockBitstream => "nvEncLockBitstream",
            DeviceCall::UnlockBitstream => "nvEncUnlockBitstream",
            DeviceCall::DestroyEncoder => "nvEncDestroyEncoder",
        }
    }
}

impl fmt::Display for DeviceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Converts a device status into the crate error, logging the failed call.
pub(crate) trait DeviceResultExt<T> {
    fn check(self, call: DeviceCall) -> Result<T>;
}

impl<T> DeviceResultExt<T> for DeviceResult<T> {
    #[inline]
    fn check(self, call: DeviceCall) -> Result<T> {
        self.map_err(|status| {
            log::error!("{call} failed: {status} ({})", status.code());
            NvEncError::Device { call, status }
        })
    }
}

/// Device features that change how a session is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Lossless,
    Lookahead,
    TemporalAq,
    DynamicBitrateChange,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Lossless,
        Capability::Lookahead,
        Capability::TemporalAq,
        Capability::DynamicBitrateChange,
    ];
}

/// Capability values reported by a device. A capability is supported if it is present with a
/// positive value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeMap<Capability, i32>);

impl Capabilities {
    /// Queries every [`Capability`]. A failed query counts as unsupported.
    pub fn query<D: EncodeDevice + ?Sized>(device: &mut D) -> Self {
        let mut caps = BTreeMap::new();
        for cap in Capability::ALL {
            match device.capability(cap) {
                Ok(value) => {
                    caps.insert(cap, value);
                }
                Err(status) => {
                    log::debug!("capability {cap:?} unavailable: {status}");
                }
            }
        }
        Capabilities(caps)
    }

    #[inline]
    pub fn supports(&self, cap: Capability) -> bool {
        self.value(cap) > 0
    }

    #[inline]
    pub fn value(&self, cap: Capability) -> i32 {
        self.0.get(&cap).copied().unwrap_or(0)
    }
}

impl FromIterator<(Capability, i32)> for Capabilities {
    fn from_iter<I: IntoIterator<Item = (Capability, i32)>>(iter: I) -> Self {
        Capabilities(iter.into_iter().collect())
    }
}

/// Preset configurations a device provides defaults for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevicePreset {
    Default,
    Hq,
    Hp,
    LowLatencyDefault,
    LowLatencyHq,
    LowLatencyHp,
    LosslessDefault,
    LosslessHp,
}

impl DevicePreset {
    #[inline]
    pub fn is_lossless(self) -> bool {
        matches!(self, DevicePreset::LosslessDefault | DevicePreset::LosslessHp)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CodecProfile {
    Baseline,
    Main,
    #[default]
    High,
    High444,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RateControlMode {
    ConstQp,
    Vbr,
    VbrHq,
    #[default]
    Cbr,
    TwoPassQuality,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstQp {
    pub inter_p: u32,
    pub inter_b: u32,
    pub intra: u32,
}

impl ConstQp {
    #[inline]
    pub fn uniform(qp: u32) -> Self {
        ConstQp {
            inter_p: qp,
            inter_b: qp,
            intra: qp,
        }
    }
}

/// Rate control parameters. Bitrates are in bits per second.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcParams {
    pub mode: RateControlMode,
    pub average_bitrate: u32,
    pub max_bitrate: u32,
    pub vbv_buffer_size: u32,
    pub const_qp: ConstQp,
    pub enable_lookahead: bool,
    pub lookahead_depth: u32,
    pub disable_i_adapt: bool,
    pub disable_b_adapt: bool,
    pub enable_aq: bool,
    pub aq_strength: u32,
    pub enable_temporal_aq: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VuiParameters {
    pub video_signal_type_present: bool,
    pub video_full_range: bool,
    pub colour_description_present: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub colour_matrix: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct H264Config {
    pub idr_period: u32,
    pub repeat_sps_pps: bool,
    pub disable_sps_pps: bool,
    pub output_aud: bool,
    pub slice_mode: u32,
    pub slice_mode_data: u32,
    pub use_bframes_as_ref: bool,
    pub output_buffering_period_sei: bool,
    pub output_picture_timing_sei: bool,
    pub qp_prime_y_zero_transform_bypass: bool,
    pub vui: VuiParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeConfig {
    pub profile: CodecProfile,
    pub gop_length: u32,
    /// Distance between P-frames, `1 + number of B-frames`.
    pub frame_interval_p: u32,
    pub rc: RcParams,
    pub h264: H264Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeParams {
    pub preset: DevicePreset,
    pub width: u32,
    pub height: u32,
    pub dar_width: u32,
    pub dar_height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    /// Let the encoder decide picture types.
    pub enable_ptd: bool,
    pub config: EncodeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigureParams {
    pub init: InitializeParams,
    pub reset_encoder: bool,
    pub force_idr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureParams {
    pub input: Option<MappedInput>,
    pub output: Option<BitstreamBuffer>,
    pub width: u32,
    pub height: u32,
    pub input_timestamp: i64,
    pub end_of_stream: bool,
}

impl PictureParams {
    pub fn frame(
        input: MappedInput,
        output: BitstreamBuffer,
        width: u32,
        height: u32,
        input_timestamp: i64,
    ) -> Self {
        PictureParams {
            input: Some(input),
            output: Some(output),
            width,
            height,
            input_timestamp,
            end_of_stream: false,
        }
    }

    /// Tells the encoder no more frames follow so it flushes every held picture.
    pub fn end_of_stream() -> Self {
        PictureParams {
            input: None,
            output: None,
            width: 0,
            height: 0,
            input_timestamp: 0,
            end_of_stream: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PictureType {
    Idr,
    I,
    P,
    B,
}

/// Output of an encode call, valid until the buffer is unlocked.
#[derive(Debug)]
pub struct LockedBitstream<'a> {
    pub data: &'a [u8],
    pub output_timestamp: i64,
    pub picture_type: PictureType,
}

/// Hardware encoder as seen by a session.
///
/// Every call reports failures as a [`DeviceStatus`]. Calls that touch input surfaces run while
/// the graphics context is held, see [`EncodeDevice::enter_graphics`].
pub trait EncodeDevice {
    fn open_session(&mut self) -> DeviceResult<()>;

    fn capability(&mut self, cap: Capability) -> DeviceResult<i32>;

    /// Default configuration of `preset`.
    fn preset_config(&mut self, preset: DevicePreset) -> DeviceResult<EncodeConfig>;

    fn initialize(&mut self, params: &InitializeParams) -> DeviceResult<()>;

    fn reconfigure(&mut self, params: &ReconfigureParams) -> DeviceResult<()>;

    fn create_bitstream_buffer(&mut self) -> DeviceResult<BitstreamBuffer>;

    fn destroy_bitstream_buffer(&mut self, buffer: BitstreamBuffer) -> DeviceResult<()>;

    fn create_input_surface(&mut self, width: u32, height: u32) -> DeviceResult<InputSurface>;

    fn destroy_input_surface(&mut self, surface: InputSurface) -> DeviceResult<()>;

    fn register_resource(&mut self, surface: InputSurface) -> DeviceResult<RegisteredResource>;

    fn unregister_resource(&mut self, resource: RegisteredResource) -> DeviceResult<()>;

    fn map_input(&mut self, resource: RegisteredResource) -> DeviceResult<MappedInput>;

    fn unmap_input(&mut self, input: MappedInput) -> DeviceResult<()>;

    /// Copies `width` x `height` texels of the caller texture into `dst`.
    fn copy_texture(
        &mut self,
        src: TextureHandle,
        dst: InputSurface,
        width: u32,
        height: u32,
    ) -> DeviceResult<()>;

    /// Queues a picture. [`DeviceStatus::NeedMoreInput`] means the picture was accepted but its
    /// output only becomes available after more input.
    fn encode_picture(&mut self, params: &PictureParams) -> DeviceResult<()>;

    /// Blocks until the output in `buffer` is ready.
    fn lock_bitstream(&mut self, buffer: BitstreamBuffer) -> DeviceResult<LockedBitstream<'_>>;

    fn unlock_bitstream(&mut self, buffer: BitstreamBuffer) -> DeviceResult<()>;

    fn destroy_encoder(&mut self) -> DeviceResult<()>;

    /// Acquires the graphics context shared with the caller.
    fn enter_graphics(&mut self) {}

    fn leave_graphics(&mut self) {}
}
