mod status;

pub use status::DeviceStatus;

use crate::encoder::DeviceCall;

/// Id of the encoder callers should reroute to when a session is [`Unavailable`].
pub const FALLBACK_ENCODER_ID: &str = "ffmpeg_nvenc";

#[derive(thiserror::Error, Debug)]
pub enum NvEncError {
    #[error("`{call}` failed: {status} ({})", .status.code())]
    Device {
        call: DeviceCall,
        status: DeviceStatus,
    },

    #[error("Encode failed: bad texture handle")]
    InvalidTexture,
    #[error("Every buffer slot is in flight; drain before submitting more frames")]
    PipelineFull,
    #[error("The session cannot change its bitrate without a restart")]
    BitrateChangeUnsupported,
    #[error("End of stream has already been signaled to the encoder")]
    EndOfStream,

    #[error("Invalid encoder settings: {0}")]
    Settings(#[from] serde_json::Error),
}

impl NvEncError {
    /// The device status if this error came from a device call.
    #[inline]
    pub fn status(&self) -> Option<DeviceStatus> {
        match self {
            NvEncError::Device { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a session could not be created.
#[derive(thiserror::Error, Debug)]
pub enum UnavailableReason {
    #[error("a different GPU was selected")]
    DifferentGpu,
    #[error("scaling is enabled")]
    ScalingEnabled,
    #[error("the NV12 texture path is active")]
    Nv12TextureActive,
    #[error("session initialization failed: {0}")]
    InitializationFailed(#[source] NvEncError),
}

/// The hardware session cannot be used. This is not fatal: the caller is expected to reroute to
/// [`Unavailable::fallback_encoder`].
#[derive(thiserror::Error, Debug)]
#[error("hardware encoder unavailable, {reason}")]
pub struct Unavailable {
    #[source]
    pub reason: UnavailableReason,
}

impl Unavailable {
    pub(crate) fn new(reason: UnavailableReason) -> Self {
        Unavailable { reason }
    }

    /// Id of the encoder to reroute to.
    #[inline]
    pub fn fallback_encoder(&self) -> &'static str {
        FALLBACK_ENCODER_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_names_the_call() {
        let err = NvEncError::Device {
            call: DeviceCall::LockBitstream,
            status: DeviceStatus::InvalidParam,
        };
        let msg = err.to_string();
        assert!(msg.contains("nvEncLockBitstream"), "{msg}");
        assert!(msg.contains("(8)"), "{msg}");
        assert_eq!(err.status(), Some(DeviceStatus::InvalidParam));
        assert_eq!(NvEncError::InvalidTexture.status(), None);
    }

    #[test]
    fn unavailable_points_to_fallback() {
        let err = Unavailable::new(UnavailableReason::ScalingEnabled);
        assert_eq!(err.fallback_encoder(), "ffmpeg_nvenc");
        assert!(err.to_string().contains("scaling"));
    }
}
