//! Session manager for a hardware H.264 encoder fed with GPU textures.
//!
//! A [`Session`] owns an initialized encoder and a ring of buffer slots. Frames are submitted as
//! texture handles, encoded asynchronously and drained in submission order once the pipeline is
//! deep enough to cover B-frame reordering and look-ahead. The device itself sits behind the
//! [`EncodeDevice`] trait; with the `mock` feature, `mock::MockDevice` implements it in memory.

mod encoder;
mod error;
mod settings;
mod util;

pub mod avc;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub type Result<T> = std::result::Result<T, NvEncError>;

pub use encoder::*;
pub use error::{DeviceStatus, NvEncError, Unavailable, UnavailableReason, FALLBACK_ENCODER_ID};
pub use settings::{
    ColorDescription, ColorRange, ColorSpace, EncoderContext, EncoderSettings, Preset, Profile,
    RateControl, VideoInfo,
};
