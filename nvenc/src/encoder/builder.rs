use super::{
    buffer::{ResourcePool, SessionResources},
    config::{self, Degradation, SessionConfig},
    device::{DeviceCall, DeviceResultExt, EncodeDevice},
    Session,
};
use crate::{
    error::{DeviceStatus, Unavailable, UnavailableReason, FALLBACK_ENCODER_ID},
    settings::{EncoderContext, EncoderSettings, VideoInfo},
    NvEncError, Result,
};

/// Acquires the parts of a [`Session`] one step at a time.
///
/// Every acquired resource is tracked in one place so a failed step can be unwound with
/// [`SessionBuilder::abandon`], which also hands the device back.
pub struct SessionBuilder<D: EncodeDevice> {
    device: D,
    resources: SessionResources,
    config: Option<SessionConfig>,
    video: VideoInfo,
    name: String,
}

impl<D: EncodeDevice> SessionBuilder<D> {
    pub fn new(device: D, video: VideoInfo, name: impl Into<String>) -> Self {
        SessionBuilder {
            device,
            resources: SessionResources::new(),
            config: None,
            video,
            name: name.into(),
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.device
            .open_session()
            .check(DeviceCall::OpenSession)?;
        self.resources.session_open = true;
        Ok(())
    }

    /// Negotiates the configuration and initializes the encoder with it.
    pub fn configure(
        &mut self,
        settings: &EncoderSettings,
        psycho_aq: bool,
    ) -> Result<&SessionConfig> {
        let config = config::negotiate(&mut self.device, settings, &self.video, psycho_aq)?;
        self.device
            .initialize(&config.params)
            .check(DeviceCall::InitializeEncoder)?;
        log::info!("[{}] settings:\n{}", self.name, config.summary());
        Ok(self.config.insert(config))
    }

    /// Allocates one slot per buffer of the negotiated schedule.
    pub fn allocate(&mut self) -> Result<()> {
        let buf_count = match &self.config {
            Some(config) => config.buf_count as usize,
            None => return Err(not_initialized()),
        };

        let mut pool = ResourcePool::new(buf_count);
        self.device.enter_graphics();
        let result = pool.allocate(&mut self.device, self.video.width, self.video.height);
        self.device.leave_graphics();

        // Kept even on failure so the allocated slots are released with the rest
        self.resources.pool = pool;
        result
    }

    /// Runs every step and hands over the session. On failure the device comes back with the
    /// error, with everything acquired so far released.
    pub fn build(
        mut self,
        settings: &EncoderSettings,
        psycho_aq: bool,
    ) -> std::result::Result<Session<D>, (NvEncError, D)> {
        match self.run(settings, psycho_aq) {
            Ok(()) => self.finish(),
            Err(err) => Err((err, self.abandon())),
        }
    }

    fn run(&mut self, settings: &EncoderSettings, psycho_aq: bool) -> Result<()> {
        self.open()?;
        self.configure(settings, psycho_aq)?;
        self.allocate()
    }

    pub fn finish(self) -> std::result::Result<Session<D>, (NvEncError, D)> {
        let SessionBuilder {
            mut device,
            mut resources,
            config,
            video,
            name,
        } = self;

        match config {
            Some(config) if resources.pool.allocated_slots() == config.buf_count as usize => {
                Ok(Session::new(device, resources, config, video, name))
            }
            _ => {
                resources.release(&mut device);
                Err((not_initialized(), device))
            }
        }
    }

    /// Releases everything acquired so far.
    pub fn abandon(self) -> D {
        let SessionBuilder {
            mut device,
            mut resources,
            ..
        } = self;
        resources.release(&mut device);
        device
    }
}

fn not_initialized() -> NvEncError {
    NvEncError::Device {
        call: DeviceCall::InitializeEncoder,
        status: DeviceStatus::EncoderNotInitialized,
    }
}

/// Checks what must hold before any device resource is acquired.
fn check_prerequisites(
    settings: &EncoderSettings,
    context: &EncoderContext,
) -> Option<UnavailableReason> {
    if settings.gpu != 0 {
        Some(UnavailableReason::DifferentGpu)
    } else if context.scaling_enabled {
        Some(UnavailableReason::ScalingEnabled)
    } else if context.nv12_active {
        Some(UnavailableReason::Nv12TextureActive)
    } else {
        None
    }
}

/// Creates a session on `device`.
///
/// If psycho-visual tuning was requested and creation fails, it is retried once without it. An
/// [`Unavailable`] error tells the caller to reroute to the fallback encoder.
pub fn create_session<D: EncodeDevice>(
    device: D,
    settings: &EncoderSettings,
    video: VideoInfo,
    context: &EncoderContext,
) -> std::result::Result<Session<D>, Unavailable> {
    let reroute = |reason: UnavailableReason| {
        log::info!(
            "[{}] {reason}, falling back to {FALLBACK_ENCODER_ID}",
            context.name
        );
        Unavailable::new(reason)
    };

    if let Some(reason) = check_prerequisites(settings, context) {
        return Err(reroute(reason));
    }

    let (err, device) =
        match SessionBuilder::new(device, video, &context.name).build(settings, settings.psycho_aq)
        {
            Ok(session) => return Ok(session),
            Err(failure) => failure,
        };

    if !settings.psycho_aq {
        return Err(reroute(UnavailableReason::InitializationFailed(err)));
    }

    log::warn!(
        "[{}] session creation failed, trying again without Psycho Visual Tuning",
        context.name
    );
    match SessionBuilder::new(device, video, &context.name).build(settings, false) {
        Ok(mut session) => {
            session.config.degradations.push(Degradation::PsychoAqDisabled);
            Ok(session)
        }
        Err((err, _)) => Err(reroute(UnavailableReason::InitializationFailed(err))),
    }
}
