use serde::{Deserialize, Serialize};

/// GOP length used when no keyframe interval is set.
const DEFAULT_GOP_SIZE: u32 = 250;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRange {
    #[default]
    Partial,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    /// Treated as BT.709.
    #[default]
    Default,
    Bt601,
    Bt709,
    Srgb,
}

/// Colour description signaled in the VUI: (primaries, transfer characteristics, matrix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorDescription {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
}

impl ColorSpace {
    pub fn description(self) -> ColorDescription {
        let (primaries, transfer, matrix) = match self {
            ColorSpace::Bt601 => (6, 6, 6),
            ColorSpace::Default | ColorSpace::Bt709 => (1, 1, 1),
            ColorSpace::Srgb => (1, 13, 1),
        };
        ColorDescription {
            primaries,
            transfer,
            matrix,
        }
    }
}

/// Format of the frames the caller submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps_num: u32,
    pub fps_den: u32,
    #[serde(default)]
    pub range: ColorRange,
    #[serde(default)]
    pub colorspace: ColorSpace,
}

impl VideoInfo {
    pub fn new(width: u32, height: u32, fps_num: u32, fps_den: u32) -> Self {
        VideoInfo {
            width,
            height,
            fps_num,
            fps_den,
            range: ColorRange::default(),
            colorspace: ColorSpace::default(),
        }
    }

    pub fn with_color(mut self, range: ColorRange, colorspace: ColorSpace) -> Self {
        self.range = range;
        self.colorspace = colorspace;
        self
    }

    /// Duration of one frame in timebase units. Timestamps count in `1 / fps_num` seconds.
    #[inline]
    pub fn frame_duration(&self) -> i64 {
        i64::from(self.fps_den)
    }

    /// Number of frames between keyframes.
    pub fn gop_size(&self, keyint_sec: u32) -> u32 {
        if keyint_sec == 0 || self.fps_den == 0 {
            return DEFAULT_GOP_SIZE;
        }
        let frames = u64::from(keyint_sec) * u64::from(self.fps_num) / u64::from(self.fps_den);
        u32::try_from(frames).unwrap_or(u32::MAX)
    }
}
