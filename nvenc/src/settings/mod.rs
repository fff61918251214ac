mod video;

pub use video::{ColorDescription, ColorRange, ColorSpace, VideoInfo};

use crate::Result;
use serde::{Deserialize, Serialize};

/// Declares a user-facing option that is stored as a string. Parsing is case-insensitive and
/// unknown values map to the default variant.
macro_rules! string_option {
    (
        $(#[$meta:meta])*
        $name:ident, default = $default:ident, { $($variant:ident => $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant),+
        }

        impl Default for $name {
            #[inline]
            fn default() -> Self {
                $name::$default
            }
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }

            pub fn parse(value: &str) -> Self {
                $(
                    if value.eq_ignore_ascii_case($value) {
                        return $name::$variant;
                    }
                )+
                $name::$default
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_owned()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_option! {
    /// Rate control requested by the user. CBR unless stated otherwise.
    RateControl, default = Cbr, {
        Cbr => "cbr",
        Vbr => "vbr",
        Cqp => "cqp",
        Lossless => "lossless",
    }
}

string_option! {
    /// Named preset tier.
    ///
    /// `mq` is the high quality preset with two-pass rate control, `hp`/`llhp` favor speed and
    /// the `ll*` presets are tuned for low latency.
    Preset, default = Default, {
        Default => "default",
        Hq => "hq",
        Mq => "mq",
        Hp => "hp",
        Ll => "ll",
        Llhq => "llhq",
        Llhp => "llhp",
    }
}

string_option! {
    Profile, default = High, {
        Baseline => "baseline",
        Main => "main",
        High => "high",
    }
}

/// User options of an encoder session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub rate_control: RateControl,
    /// Target bitrate in kbps.
    pub bitrate: u32,
    /// Peak bitrate in kbps. Only used by VBR.
    pub max_bitrate: u32,
    /// Quantizer for constant-quality rate control.
    pub cqp: u32,
    /// Keyframe interval in seconds. `0` selects a GOP of 250 frames.
    pub keyint_sec: u32,
    pub preset: Preset,
    pub profile: Profile,
    pub lookahead: bool,
    /// Maximum number of consecutive B-frames.
    pub bf: u32,
    /// Psycho-visual tuning (spatial and temporal adaptive quantization).
    pub psycho_aq: bool,
    /// Repeat SPS/PPS in-band before every IDR.
    pub repeat_headers: bool,
    /// GPU the session should run on. Textures are shared, so only the GPU the caller renders
    /// on (`0`) can be used.
    pub gpu: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings {
            rate_control: RateControl::Cbr,
            bitrate: 2500,
            max_bitrate: 5000,
            cqp: 20,
            keyint_sec: 0,
            preset: Preset::Hq,
            profile: Profile::High,
            lookahead: false,
            bf: 2,
            psycho_aq: true,
            repeat_headers: false,
            gpu: 0,
        }
    }
}

impl EncoderSettings {
    /// Reads settings from JSON. Missing keys take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// State of the surrounding video pipeline at session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderContext {
    /// Name used to tag log lines.
    pub name: String,
    /// The output is rescaled before encoding, which needs a CPU-side frame.
    pub scaling_enabled: bool,
    /// Frames are delivered as NV12 textures, which conflicts with the RGBA surfaces used here.
    pub nv12_active: bool,
}

impl Default for EncoderContext {
    fn default() -> Self {
        EncoderContext {
            name: "nvenc".to_owned(),
            scaling_enabled: false,
            nv12_active: false,
        }
    }
}

impl EncoderContext {
    pub fn named(name: impl Into<String>) -> Self {
        EncoderContext {
            name: name.into(),
            ..Default::default()
        }
    }
}
