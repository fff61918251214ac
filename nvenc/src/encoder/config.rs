use super::device::{
    Capabilities, Capability, CodecProfile, ConstQp, DeviceCall, DevicePreset, DeviceResultExt,
    EncodeConfig, EncodeDevice, InitializeParams, RateControlMode, VuiParameters,
};
use crate::{
    settings::{ColorRange, EncoderSettings, Preset, Profile, RateControl, VideoInfo},
    util::gcd,
    Result,
};
use std::fmt::{self, Write};

/// Lower bound of the number of in-flight slots.
pub const MIN_BUFFERS: u32 = 4;
/// Upper bound of the number of in-flight slots.
pub const MAX_BUFFERS: u32 = 64;
/// Slots reserved on top of the reordering and look-ahead windows.
pub const EXTRA_BUFFERS: u32 = 5;
pub const DEFAULT_LOOKAHEAD_DEPTH: u32 = 8;

const AQ_STRENGTH: u32 = 8;

/// Device preset picked for a [`Preset`] and the tuning flags that come with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetChoice {
    pub preset: DevicePreset,
    pub two_pass: bool,
    pub high_performance: bool,
    pub low_latency: bool,
}

impl PresetChoice {
    /// Lossless variant of the choice.
    #[inline]
    pub fn lossless(self) -> DevicePreset {
        if self.high_performance {
            DevicePreset::LosslessHp
        } else {
            DevicePreset::LosslessDefault
        }
    }
}

pub fn select_preset(preset: Preset) -> PresetChoice {
    let (device_preset, two_pass, high_performance, low_latency) = match preset {
        Preset::Default => (DevicePreset::Default, false, false, false),
        Preset::Hq => (DevicePreset::Hq, false, false, false),
        Preset::Mq => (DevicePreset::Hq, true, false, false),
        Preset::Hp => (DevicePreset::Hp, false, true, false),
        Preset::Ll => (DevicePreset::LowLatencyDefault, false, false, true),
        Preset::Llhq => (DevicePreset::LowLatencyHq, false, false, true),
        Preset::Llhp => (DevicePreset::LowLatencyHp, false, true, true),
    };
    PresetChoice {
        preset: device_preset,
        two_pass,
        high_performance,
        low_latency,
    }
}

/// Slot count and output latency of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSchedule {
    pub buf_count: u32,
    /// Number of queued slots before the oldest one is drained.
    pub output_delay: u32,
    /// Look-ahead depth to configure, `None` if look-ahead is off.
    pub lookahead_depth: Option<u32>,
}

/// Sizes the slot pool. `lookahead_depth` is the requested depth if look-ahead is on.
///
/// Look-ahead is dropped when the pool leaves no room for it next to the reordering window.
pub fn buffer_schedule(frame_interval_p: u32, lookahead_depth: Option<u32>) -> BufferSchedule {
    let mut buf_count = MIN_BUFFERS.max(frame_interval_p.saturating_mul(4));
    if let Some(depth) = lookahead_depth {
        let needed = frame_interval_p
            .saturating_add(depth)
            .saturating_add(EXTRA_BUFFERS);
        buf_count = buf_count.max(needed);
    }
    let buf_count = buf_count.min(MAX_BUFFERS);
    let output_delay = buf_count - 1;

    let lookahead_depth = lookahead_depth.and_then(|depth| {
        let bound = output_delay.checked_sub(frame_interval_p)?.checked_sub(4)?;
        Some(depth.max(bound))
    });

    BufferSchedule {
        buf_count,
        output_delay,
        lookahead_depth,
    }
}

/// Requested feature the session runs without.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Degradation {
    /// Lossless was requested but the device cannot do it. The session uses the standard preset
    /// with CBR.
    LosslessUnsupported,
    /// Psycho-visual tuning was requested but the device has no temporal AQ.
    PsychoAqUnsupported,
    /// Session creation with psycho-visual tuning failed and succeeded without it.
    PsychoAqDisabled,
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Degradation::LosslessUnsupported => "lossless encode is not supported, ignoring",
            Degradation::PsychoAqUnsupported => {
                "Ignoring Psycho Visual Tuning request since GPU is not capable"
            }
            Degradation::PsychoAqDisabled => "created without Psycho Visual Tuning",
        })
    }
}

/// Everything negotiated for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub params: InitializeParams,
    /// Rate control in effect, after degradations.
    pub rate_control: RateControl,
    pub preset: Preset,
    pub profile: Profile,
    /// Target bitrate in kbps, `0` for constant-quality modes.
    pub bitrate: u32,
    pub cqp: u32,
    pub bframes: u32,
    pub two_pass: bool,
    pub lookahead: bool,
    pub psycho_aq: bool,
    pub buf_count: u32,
    pub output_delay: u32,
    pub can_change_bitrate: bool,
    pub degradations: Vec<Degradation>,
}

impl SessionConfig {
    /// Multi-line description of the negotiated settings.
    pub fn summary(&self) -> String {
        let yes_no = |b: bool| if b { "true" } else { "false" };
        let mut s = String::new();
        let _ = writeln!(s, "\trate_control: {}", self.rate_control);
        let _ = writeln!(s, "\tbitrate:      {}", self.bitrate);
        let _ = writeln!(s, "\tcqp:          {}", self.cqp);
        let _ = writeln!(s, "\tkeyint:       {}", self.params.config.gop_length);
        let _ = writeln!(s, "\tpreset:       {}", self.preset);
        let _ = writeln!(s, "\tprofile:      {}", self.profile);
        let _ = writeln!(s, "\twidth:        {}", self.params.width);
        let _ = writeln!(s, "\theight:       {}", self.params.height);
        let _ = writeln!(s, "\t2-pass:       {}", yes_no(self.two_pass));
        let _ = writeln!(s, "\tb-frames:     {}", self.bframes);
        let _ = writeln!(s, "\tlookahead:    {}", yes_no(self.lookahead));
        let _ = write!(s, "\tpsycho_aq:    {}", yes_no(self.psycho_aq));
        s
    }
}

/// Queries the device capabilities and builds the session configuration on top of the preset defaults.
pub(crate) fn negotiate<D: EncodeDevice + ?Sized>(
    device: &mut D,
    settings: &EncoderSettings,
    video: &VideoInfo,
    psycho_aq: bool,
) -> Result<SessionConfig> {
    let caps = Capabilities::query(device);
    let (choice, _) = resolve_preset(settings, &caps);
    let base = device
        .preset_config(choice.preset)
        .check(DeviceCall::GetPresetConfig)?;
    Ok(configure(settings, video, &caps, psycho_aq, base))
}

fn resolve_preset(settings: &EncoderSettings, caps: &Capabilities) -> (PresetChoice, bool) {
    let mut choice = select_preset(settings.preset);
    let lossless =
        settings.rate_control == RateControl::Lossless && caps.supports(Capability::Lossless);
    if lossless {
        choice.preset = choice.lossless();
    }
    (choice, lossless)
}

#[inline]
fn bits_per_second(kbps: u32) -> u32 {
    kbps.saturating_mul(1000)
}

/// Applies the user settings to `base`, the device defaults of the chosen preset.
pub fn configure(
    settings: &EncoderSettings,
    video: &VideoInfo,
    caps: &Capabilities,
    psycho_aq: bool,
    base: EncodeConfig,
) -> SessionConfig {
    let (choice, lossless) = resolve_preset(settings, caps);
    let mut degradations = Vec::new();

    let mut rate_control = settings.rate_control;
    if rate_control == RateControl::Lossless && !lossless {
        log::warn!("{}", Degradation::LosslessUnsupported);
        degradations.push(Degradation::LosslessUnsupported);
        rate_control = RateControl::Cbr;
    }

    let gop_size = video.gop_size(settings.keyint_sec);
    let bframes = settings.bf;

    let mut config = base;
    config.gop_length = gop_size;
    config.frame_interval_p = bframes.saturating_add(1);

    config.h264.idr_period = gop_size;
    if settings.repeat_headers {
        config.h264.repeat_sps_pps = true;
        config.h264.disable_sps_pps = false;
        config.h264.output_aud = true;
    }
    config.h264.slice_mode = 3;
    config.h264.slice_mode_data = 1;
    config.h264.use_bframes_as_ref = false;

    let color = video.colorspace.description();
    config.h264.vui = VuiParameters {
        video_signal_type_present: true,
        video_full_range: video.range == ColorRange::Full,
        colour_description_present: true,
        colour_primaries: color.primaries,
        transfer_characteristics: color.transfer,
        colour_matrix: color.matrix,
    };

    // Look-ahead
    let preset_lookahead = config.rc.enable_lookahead;
    let wants_lookahead =
        caps.supports(Capability::Lookahead) && (settings.lookahead || preset_lookahead);
    let requested_depth = wants_lookahead.then(|| {
        if preset_lookahead {
            config.rc.lookahead_depth
        } else {
            DEFAULT_LOOKAHEAD_DEPTH
        }
    });

    let schedule = buffer_schedule(config.frame_interval_p, requested_depth);
    match schedule.lookahead_depth {
        Some(depth) => {
            config.rc.enable_lookahead = true;
            config.rc.lookahead_depth = depth;
            config.rc.disable_i_adapt = false;
            config.rc.disable_b_adapt = false;
        }
        None => {
            if wants_lookahead {
                log::debug!(
                    "look-ahead disabled, {} buffers leave no room next to {} b-frames",
                    schedule.buf_count,
                    bframes
                );
            }
            config.rc.enable_lookahead = false;
        }
    }
    let lookahead = schedule.lookahead_depth.is_some();

    // Psycho-visual tuning
    let mut psycho_aq_active = false;
    if caps.supports(Capability::TemporalAq) {
        config.rc.enable_aq = psycho_aq;
        config.rc.aq_strength = AQ_STRENGTH;
        config.rc.enable_temporal_aq = psycho_aq;
        psycho_aq_active = psycho_aq;
    } else if psycho_aq {
        log::warn!("{}", Degradation::PsychoAqUnsupported);
        degradations.push(Degradation::PsychoAqUnsupported);
    }

    // Rate control
    let mut can_change_bitrate = caps.supports(Capability::DynamicBitrateChange) && !lookahead;
    let mut bitrate = settings.bitrate;
    let mut max_bitrate = settings.max_bitrate;
    let mut cqp = settings.cqp;

    config.rc.mode = if choice.two_pass {
        RateControlMode::VbrHq
    } else {
        RateControlMode::Vbr
    };

    match rate_control {
        RateControl::Cqp | RateControl::Lossless => {
            if lossless {
                config.h264.qp_prime_y_zero_transform_bypass = true;
                cqp = 0;
            }
            config.rc.mode = RateControlMode::ConstQp;
            config.rc.const_qp = ConstQp::uniform(cqp);
            can_change_bitrate = false;
            bitrate = 0;
            max_bitrate = 0;
        }
        RateControl::Vbr => {}
        RateControl::Cbr => {
            config.h264.output_buffering_period_sei = true;
            config.rc.mode = if choice.two_pass {
                RateControlMode::TwoPassQuality
            } else {
                RateControlMode::Cbr
            };
        }
    }

    config.h264.output_picture_timing_sei = true;
    config.rc.average_bitrate = bits_per_second(bitrate);
    config.rc.max_bitrate = if rate_control == RateControl::Vbr {
        bits_per_second(max_bitrate)
    } else {
        bits_per_second(bitrate)
    };
    config.rc.vbv_buffer_size = bits_per_second(bitrate);

    config.profile = if lossless {
        CodecProfile::High444
    } else {
        match settings.profile {
            Profile::Baseline => CodecProfile::Baseline,
            Profile::Main => CodecProfile::Main,
            Profile::High => CodecProfile::High,
        }
    };

    let divisor = gcd(video.width, video.height).max(1);
    let params = InitializeParams {
        preset: choice.preset,
        width: video.width,
        height: video.height,
        dar_width: video.width / divisor,
        dar_height: video.height / divisor,
        frame_rate_num: video.fps_num,
        frame_rate_den: video.fps_den,
        enable_ptd: true,
        config,
    };

    SessionConfig {
        params,
        rate_control,
        preset: settings.preset,
        profile: settings.profile,
        bitrate,
        cqp,
        bframes,
        two_pass: choice.two_pass,
        lookahead,
        psycho_aq: psycho_aq_active,
        buf_count: schedule.buf_count,
        output_delay: schedule.output_delay,
        can_change_bitrate,
        degradations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ColorSpace;

    fn all_caps() -> Capabilities {
        Capability::ALL.into_iter().map(|cap| (cap, 1)).collect()
    }

    fn caps_without(missing: Capability) -> Capabilities {
        Capability::ALL
            .into_iter()
            .filter(|&cap| cap != missing)
            .map(|cap| (cap, 1))
            .collect()
    }

    fn video() -> VideoInfo {
        VideoInfo::new(1920, 1080, 60, 1)
    }

    fn configure_with(settings: &EncoderSettings, caps: &Capabilities) -> SessionConfig {
        configure(
            settings,
            &video(),
            caps,
            settings.psycho_aq,
            EncodeConfig::default(),
        )
    }

    #[test]
    fn preset_table() {
        let hq = select_preset(Preset::Hq);
        assert_eq!(hq.preset, DevicePreset::Hq);
        assert!(!hq.two_pass);

        let mq = select_preset(Preset::Mq);
        assert_eq!(mq.preset, DevicePreset::Hq);
        assert!(mq.two_pass);

        let llhp = select_preset(Preset::Llhp);
        assert_eq!(llhp.preset, DevicePreset::LowLatencyHp);
        assert!(llhp.high_performance && llhp.low_latency);
        assert_eq!(llhp.lossless(), DevicePreset::LosslessHp);

        assert_eq!(select_preset(Preset::Ll).preset, DevicePreset::LowLatencyDefault);
        assert_eq!(select_preset(Preset::Default).preset, DevicePreset::Default);
        assert_eq!(
            select_preset(Preset::Llhq).lossless(),
            DevicePreset::LosslessDefault
        );
    }

    #[test]
    fn schedule_without_lookahead() {
        let schedule = buffer_schedule(3, None);
        assert_eq!(schedule.buf_count, 12);
        assert_eq!(schedule.output_delay, 11);
        assert_eq!(schedule.lookahead_depth, None);

        let schedule = buffer_schedule(1, None);
        assert_eq!(schedule.buf_count, 4);
        assert_eq!(schedule.output_delay, 3);
    }

    #[test]
    fn schedule_with_lookahead() {
        let schedule = buffer_schedule(3, Some(8));
        assert_eq!(schedule.buf_count, 16);
        assert_eq!(schedule.output_delay, 15);
        assert_eq!(schedule.lookahead_depth, Some(8));

        // The depth grows into the available room
        let schedule = buffer_schedule(17, Some(8));
        assert_eq!(schedule.buf_count, 64);
        assert_eq!(schedule.lookahead_depth, Some(42));
    }

    #[test]
    fn lookahead_dropped_without_room() {
        let schedule = buffer_schedule(60, Some(8));
        assert_eq!(schedule.buf_count, 64);
        assert_eq!(schedule.output_delay, 63);
        assert_eq!(schedule.lookahead_depth, None);

        let schedule = buffer_schedule(u32::MAX, Some(u32::MAX));
        assert_eq!(schedule.buf_count, 64);
        assert_eq!(schedule.lookahead_depth, None);
    }

    #[test]
    fn buf_count_stays_in_bounds() {
        for fip in 1..80 {
            for depth in [None, Some(0), Some(8), Some(32)] {
                let schedule = buffer_schedule(fip, depth);
                assert!((MIN_BUFFERS..=MAX_BUFFERS).contains(&schedule.buf_count));
                assert_eq!(schedule.output_delay, schedule.buf_count - 1);
                if schedule.lookahead_depth.is_some() {
                    assert!(schedule.output_delay >= fip + 4);
                }
            }
        }
    }

    #[test]
    fn default_settings() {
        let config = configure_with(&EncoderSettings::default(), &all_caps());
        let c = &config.params.config;

        assert_eq!(config.params.preset, DevicePreset::Hq);
        assert_eq!(config.buf_count, 12);
        assert_eq!(config.output_delay, 11);
        assert_eq!(c.frame_interval_p, 3);
        assert_eq!(c.gop_length, 250);
        assert_eq!(c.h264.idr_period, 250);
        assert_eq!(c.profile, CodecProfile::High);
        assert_eq!(c.rc.mode, RateControlMode::Cbr);
        assert_eq!(c.rc.average_bitrate, 2_500_000);
        assert_eq!(c.rc.max_bitrate, 2_500_000);
        assert_eq!(c.rc.vbv_buffer_size, 2_500_000);
        assert!(c.h264.output_buffering_period_sei);
        assert!(c.h264.output_picture_timing_sei);
        assert!(c.rc.enable_aq && c.rc.enable_temporal_aq);
        assert_eq!(c.rc.aq_strength, 8);
        assert!(!c.rc.enable_lookahead);
        assert!(config.can_change_bitrate);
        assert!(config.degradations.is_empty());

        assert!(config.params.enable_ptd);
        assert_eq!((config.params.dar_width, config.params.dar_height), (16, 9));
        assert_eq!((c.h264.slice_mode, c.h264.slice_mode_data), (3, 1));
        assert!(!c.h264.use_bframes_as_ref);
    }

    #[test]
    fn two_pass_rate_control() {
        let vbr = EncoderSettings {
            rate_control: RateControl::Vbr,
            preset: Preset::Mq,
            ..Default::default()
        };
        let config = configure_with(&vbr, &all_caps());
        assert_eq!(config.params.config.rc.mode, RateControlMode::VbrHq);
        assert_eq!(config.params.config.rc.max_bitrate, 5_000_000);
        assert!(!config.params.config.h264.output_buffering_period_sei);

        let cbr = EncoderSettings {
            preset: Preset::Mq,
            ..Default::default()
        };
        let config = configure_with(&cbr, &all_caps());
        assert_eq!(config.params.config.rc.mode, RateControlMode::TwoPassQuality);
        assert!(config.two_pass);
    }

    #[test]
    fn constant_quality() {
        let settings = EncoderSettings {
            rate_control: RateControl::Cqp,
            cqp: 23,
            ..Default::default()
        };
        let config = configure_with(&settings, &all_caps());
        let rc = &config.params.config.rc;

        assert_eq!(rc.mode, RateControlMode::ConstQp);
        assert_eq!(rc.const_qp, ConstQp::uniform(23));
        assert_eq!(rc.average_bitrate, 0);
        assert_eq!(rc.max_bitrate, 0);
        assert_eq!(config.bitrate, 0);
        assert!(!config.can_change_bitrate);
    }

    #[test]
    fn lossless_when_supported() {
        let settings = EncoderSettings {
            rate_control: RateControl::Lossless,
            preset: Preset::Hp,
            profile: Profile::Main,
            ..Default::default()
        };
        let config = configure_with(&settings, &all_caps());
        let c = &config.params.config;

        assert_eq!(config.params.preset, DevicePreset::LosslessHp);
        assert_eq!(c.rc.mode, RateControlMode::ConstQp);
        assert_eq!(c.rc.const_qp, ConstQp::uniform(0));
        assert!(c.h264.qp_prime_y_zero_transform_bypass);
        assert_eq!(c.profile, CodecProfile::High444);
        assert_eq!(config.rate_control, RateControl::Lossless);
    }

    #[test]
    fn lossless_unsupported_degrades() {
        let settings = EncoderSettings {
            rate_control: RateControl::Lossless,
            cqp: 12,
            ..Default::default()
        };
        let config = configure_with(&settings, &caps_without(Capability::Lossless));
        let c = &config.params.config;

        assert_eq!(config.params.preset, DevicePreset::Hq);
        assert_eq!(config.rate_control, RateControl::Cbr);
        assert_eq!(c.rc.mode, RateControlMode::Cbr);
        assert_eq!(c.rc.average_bitrate, 2_500_000);
        assert_eq!(c.rc.const_qp, ConstQp::default());
        assert!(!c.h264.qp_prime_y_zero_transform_bypass);
        assert_eq!(c.profile, CodecProfile::High);
        assert_eq!(config.degradations, vec![Degradation::LosslessUnsupported]);
    }

    #[test]
    fn lookahead_policy() {
        let settings = EncoderSettings {
            lookahead: true,
            ..Default::default()
        };

        let config = configure_with(&settings, &all_caps());
        assert!(config.lookahead);
        assert_eq!(config.buf_count, 16);
        assert_eq!(config.params.config.rc.lookahead_depth, 8);
        assert!(config.params.config.rc.enable_lookahead);
        assert!(!config.can_change_bitrate);

        let config = configure_with(&settings, &caps_without(Capability::Lookahead));
        assert!(!config.lookahead);
        assert_eq!(config.buf_count, 12);
        assert!(!config.params.config.rc.enable_lookahead);
        assert!(config.can_change_bitrate);
    }

    #[test]
    fn preset_lookahead_depth_is_kept() {
        let mut base = EncodeConfig::default();
        base.rc.enable_lookahead = true;
        base.rc.lookahead_depth = 20;

        let config = configure(
            &EncoderSettings::default(),
            &video(),
            &all_caps(),
            true,
            base,
        );
        assert!(config.lookahead);
        assert_eq!(config.buf_count, 3 + 20 + EXTRA_BUFFERS);
        assert_eq!(config.params.config.rc.lookahead_depth, 20);
    }

    #[test]
    fn lookahead_silently_disabled_for_deep_reordering() {
        let settings = EncoderSettings {
            lookahead: true,
            bf: 60,
            ..Default::default()
        };
        let config = configure_with(&settings, &all_caps());
        assert!(!config.lookahead);
        assert!(!config.params.config.rc.enable_lookahead);
        assert_eq!(config.buf_count, 64);
        assert!(config.degradations.is_empty());
    }

    #[test]
    fn psycho_aq_without_temporal_aq() {
        let config = configure_with(
            &EncoderSettings::default(),
            &caps_without(Capability::TemporalAq),
        );
        assert!(!config.params.config.rc.enable_aq);
        assert!(!config.psycho_aq);
        assert_eq!(config.degradations, vec![Degradation::PsychoAqUnsupported]);
    }

    #[test]
    fn vui_and_headers() {
        let settings = EncoderSettings {
            repeat_headers: true,
            keyint_sec: 2,
            ..Default::default()
        };
        let video = video().with_color(ColorRange::Full, ColorSpace::Srgb);
        let config = configure(&settings, &video, &all_caps(), true, EncodeConfig::default());
        let h264 = &config.params.config.h264;

        assert!(h264.repeat_sps_pps && !h264.disable_sps_pps && h264.output_aud);
        assert_eq!(h264.idr_period, 120);
        assert!(h264.vui.video_signal_type_present);
        assert!(h264.vui.video_full_range);
        assert!(h264.vui.colour_description_present);
        assert_eq!(
            (
                h264.vui.colour_primaries,
                h264.vui.transfer_characteristics,
                h264.vui.colour_matrix
            ),
            (1, 13, 1)
        );
    }

    #[test]
    fn summary_lists_settings() {
        let config = configure_with(&EncoderSettings::default(), &all_caps());
        let summary = config.summary();
        assert!(summary.contains("rate_control: cbr"), "{summary}");
        assert!(summary.contains("b-frames:     2"), "{summary}");
        assert!(summary.contains("keyint:       250"), "{summary}");
    }
}
