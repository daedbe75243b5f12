//! The capture device: typed command dispatch and the control loop tick.
//!
//! All operator requests arrive through [`CcdDevice::handle_command`] and
//! are applied immediately without blocking. [`CcdDevice::poll`] is called
//! periodically by the hosting loop; it applies external updates, collects
//! finished deliveries, advances exposures and runs the temperature ramp.
//! Completed frames are handed to the chip's delivery worker.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::camera_interface::{
    Binning, Chip, ChipKind, ExposureLimits, ExposureProgress, FrameKind, PropertyState, Roi,
    SensorDriver,
};
use crate::config_storage::{ActiveDevices, ConfigSink, DeviceSettings};
use crate::delivery::{BlobChannel, ClientSink, UploadMode, UploadSettings};
use crate::encode::EncodeFormat;
use crate::error::{CaptureError, CaptureResult};
use crate::exposure::{self, PollPeriod};
use crate::external::{EventInbox, EventSender, ExternalEvent, ExternalSnapshot};
use crate::fast_exposure::{FastDecision, FastExposure, LatencyPolicy};
use crate::formats::FormatRegistry;
use crate::metadata::{HeaderSettings, TelescopeType};
use crate::stream::{StreamBroadcaster, WsStreamer};
use crate::temperature::{RampController, RampTick, TemperatureRamp};
use crate::worker::{DeliveryJob, DeliveryOutcome, DeliveryWorker};

/// Operator request, one variant per control.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartExposure { chip: ChipKind, duration: f64 },
    AbortExposure { chip: ChipKind },
    SetFrame { chip: ChipKind, roi: Roi },
    ResetFrame { chip: ChipKind },
    SetBinning { chip: ChipKind, binning: Binning },
    SetFrameKind { chip: ChipKind, kind: FrameKind },
    SetCompression { chip: ChipKind, enabled: bool },
    SetTemperature(f64),
    SetTemperatureRamp { slope: f64, threshold: f64 },
    SetCaptureFormat(String),
    SetEncodeFormat(EncodeFormat),
    SetUploadMode(UploadMode),
    SetUploadTarget { directory: PathBuf, prefix: String },
    SetFastExposure { enabled: bool },
    SetFastExposureCount(u32),
    SetLatencyPolicy(LatencyPolicy),
    SetTelescopeType(TelescopeType),
    SetActiveDevices(ActiveDevices),
    SetWcs { enabled: bool },
    /// Sensor rotation in degrees, clockwise
    SetCcdRotation(f64),
    SetFitsIdentity { observer: String, object: String },
    SetWebSocket { enabled: bool },
    SetWebSocketPort(u16),
    SaveConfig,
}

/// Completed frames a chip may hold while its worker is busy. A frame that
/// would exceed this is rejected instead of displacing an earlier one.
pub const MAX_PENDING_FRAMES: usize = 4;

struct ChipSlot {
    chip: Chip,
    worker: DeliveryWorker,
    in_flight: bool,
    /// Frames that completed while an earlier one was being delivered, oldest first
    pending: VecDeque<(DeliveryJob, Vec<u8>)>,
}

impl ChipSlot {
    fn new(kind: ChipKind, outcomes: Sender<DeliveryOutcome>) -> CaptureResult<Self> {
        Ok(Self {
            chip: Chip::new(kind),
            worker: DeliveryWorker::spawn(kind, outcomes)?,
            in_flight: false,
            pending: VecDeque::new(),
        })
    }
}

pub struct CcdDevice<D: SensorDriver> {
    name: String,
    driver: D,
    primary: ChipSlot,
    guide: ChipSlot,
    outcomes: Receiver<DeliveryOutcome>,
    poll: PollPeriod,
    temperature: RampController,
    fast: FastExposure,
    formats: FormatRegistry,
    header: HeaderSettings,
    encode_format: EncodeFormat,
    upload: UploadSettings,
    active_devices: ActiveDevices,
    external: ExternalSnapshot,
    inbox: EventInbox,
    events: EventSender,
    blobs: BlobChannel,
    stream: Arc<StreamBroadcaster>,
    streamer: Option<WsStreamer>,
    websocket_enabled: bool,
    websocket_port: u16,
    config: Option<Box<dyn ConfigSink>>,
    last_saved: Option<PathBuf>,
    last_error: Option<CaptureError>,
}

impl<D: SensorDriver> CcdDevice<D> {
    pub fn new(name: impl Into<String>, driver: D) -> CaptureResult<Self> {
        let name = name.into();
        let (outcome_tx, outcomes) = crossbeam_channel::unbounded();
        let (events, inbox) = EventInbox::channel();
        let defaults = DeviceSettings::default();
        let header = HeaderSettings {
            device_name: name.clone(),
            ..HeaderSettings::default()
        };

        Ok(Self {
            primary: ChipSlot::new(ChipKind::Primary, outcome_tx.clone())?,
            guide: ChipSlot::new(ChipKind::Guide, outcome_tx)?,
            name,
            driver,
            outcomes,
            poll: PollPeriod::default(),
            temperature: RampController::new(defaults.ramp),
            fast: FastExposure::new(defaults.latency_policy),
            formats: FormatRegistry::new(),
            header,
            encode_format: defaults.encode_format,
            upload: defaults.upload,
            active_devices: ActiveDevices::default(),
            external: ExternalSnapshot::default(),
            inbox,
            events,
            blobs: BlobChannel::new(),
            stream: Arc::new(StreamBroadcaster::default()),
            streamer: None,
            websocket_enabled: false,
            websocket_port: defaults.websocket_port,
            config: None,
            last_saved: None,
            last_error: None,
        })
    }

    /// Persist settings through `sink` after every operator change.
    pub fn with_config(mut self, sink: Box<dyn ConfigSink>) -> Self {
        self.config = Some(sink);
        self
    }

    /// Frames a websocket client may fall behind before it starts skipping.
    pub fn with_stream_backlog(mut self, frames: usize) -> Self {
        if self.streamer.is_some() {
            warn!("WebSocket server already running, keeping its backlog");
            return self;
        }
        self.stream = Arc::new(StreamBroadcaster::new(frames));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn chip(&self, kind: ChipKind) -> &Chip {
        &self.slot(kind).chip
    }

    /// Sensor geometry as reported by the driver.
    pub fn set_ccd_params(
        &mut self,
        kind: ChipKind,
        width: u32,
        height: u32,
        bits_per_pixel: u8,
        pitch_x: f64,
        pitch_y: f64,
    ) -> CaptureResult<()> {
        self.slot_mut(kind)
            .chip
            .set_params(width, height, bits_per_pixel, pitch_x, pitch_y)
    }

    pub fn set_exposure_limits(&mut self, kind: ChipKind, min: f64, max: f64) {
        self.slot_mut(kind).chip.set_limits(ExposureLimits { min, max });
    }

    /// Handle for external collaborators to push telescope, focuser, filter
    /// and sky updates.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// In-process client channel. Every subscriber receives every frame sent
    /// to clients while streaming is off.
    pub fn blob_channel(&self) -> &BlobChannel {
        &self.blobs
    }

    pub fn stream_broadcaster(&self) -> Arc<StreamBroadcaster> {
        self.stream.clone()
    }

    pub fn streaming_addr(&self) -> Option<std::net::SocketAddr> {
        self.streamer.as_ref().map(WsStreamer::local_addr)
    }

    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    pub fn formats_mut(&mut self) -> &mut FormatRegistry {
        &mut self.formats
    }

    pub fn fast_exposure(&self) -> &FastExposure {
        &self.fast
    }

    pub fn temperature(&self) -> &RampController {
        &self.temperature
    }

    pub fn header_settings(&self) -> &HeaderSettings {
        &self.header
    }

    pub fn external(&self) -> &ExternalSnapshot {
        &self.external
    }

    pub fn poll_period(&self) -> Duration {
        self.poll.current()
    }

    /// Path of the most recent local save.
    pub fn last_saved(&self) -> Option<&PathBuf> {
        self.last_saved.as_ref()
    }

    /// Most recent frame-scoped failure, cleared when read.
    pub fn take_last_error(&mut self) -> Option<CaptureError> {
        self.last_error.take()
    }

    /// True while a frame of either chip is queued or being delivered.
    pub fn deliveries_in_flight(&self) -> bool {
        [&self.primary, &self.guide]
            .iter()
            .any(|slot| slot.in_flight || !slot.pending.is_empty())
    }

    fn slot(&self, kind: ChipKind) -> &ChipSlot {
        match kind {
            ChipKind::Primary => &self.primary,
            ChipKind::Guide => &self.guide,
        }
    }

    fn slot_mut(&mut self, kind: ChipKind) -> &mut ChipSlot {
        match kind {
            ChipKind::Primary => &mut self.primary,
            ChipKind::Guide => &mut self.guide,
        }
    }

    /// Apply one operator request.
    pub fn handle_command(&mut self, command: Command, now: Instant) -> CaptureResult<()> {
        debug!("Handling {:?}", command);
        let result = self.dispatch_command(command, now);
        if let Err(e) = &result {
            warn!("{}", e);
        }
        result
    }

    fn dispatch_command(&mut self, command: Command, now: Instant) -> CaptureResult<()> {
        match command {
            Command::StartExposure { chip, duration } => self.start_exposure(chip, duration, now),
            Command::AbortExposure { chip } => self.abort_exposure(chip),
            Command::SetFrame { chip, roi } => {
                let slot = self.slot_mut(chip);
                let previous = slot.chip.frame();
                slot.chip.set_frame(roi)?;
                if let Err(e) = self.driver.update_frame(chip, roi) {
                    self.slot_mut(chip).chip.set_frame(previous)?;
                    return Err(CaptureError::rejected(format!("driver refused frame: {e}")));
                }
                if chip == ChipKind::Primary {
                    self.save_config();
                }
                Ok(())
            }
            Command::ResetFrame { chip } => {
                let slot = self.slot_mut(chip);
                slot.chip.reset_frame();
                let (roi, binning) = (slot.chip.frame(), slot.chip.binning());
                self.driver
                    .update_binning(chip, binning)
                    .and_then(|()| self.driver.update_frame(chip, roi))
                    .map_err(|e| CaptureError::rejected(format!("driver refused reset: {e}")))
            }
            Command::SetBinning { chip, binning } => {
                let slot = self.slot_mut(chip);
                let previous = slot.chip.binning();
                slot.chip.set_binning(binning)?;
                if let Err(e) = self.driver.update_binning(chip, binning) {
                    self.slot_mut(chip).chip.set_binning(previous)?;
                    return Err(CaptureError::rejected(format!("driver refused binning: {e}")));
                }
                if chip == ChipKind::Guide {
                    self.save_config();
                }
                Ok(())
            }
            Command::SetFrameKind { chip, kind } => {
                self.driver.update_frame_kind(chip, kind).map_err(|e| {
                    CaptureError::rejected(format!("driver refused frame type: {e}"))
                })?;
                self.slot_mut(chip).chip.set_frame_kind(kind);
                Ok(())
            }
            Command::SetCompression { chip, enabled } => {
                self.slot_mut(chip).chip.set_compressed(enabled);
                self.save_config();
                Ok(())
            }
            Command::SetTemperature(target) => {
                if !self.driver.capabilities().has_cooler {
                    return Err(CaptureError::rejected("sensor has no cooler"));
                }
                let state = self.temperature.request(target, &mut self.driver, now)?;
                if state == PropertyState::Alert {
                    return Err(CaptureError::rejected(format!(
                        "driver failed to apply temperature {target:.2} C"
                    )));
                }
                Ok(())
            }
            Command::SetTemperatureRamp { slope, threshold } => {
                self.temperature
                    .set_ramp(TemperatureRamp::new(slope, threshold)?);
                self.save_config();
                Ok(())
            }
            Command::SetCaptureFormat(name) => {
                let format = self.formats.find(&name)?.clone();
                self.driver.set_capture_format(&format).map_err(|e| {
                    CaptureError::rejected(format!("sensor refused capture format {name}: {e}"))
                })?;
                self.formats.select(&name)?;
                self.save_config();
                Ok(())
            }
            Command::SetEncodeFormat(format) => {
                self.encode_format = format;
                self.save_config();
                Ok(())
            }
            Command::SetUploadMode(mode) => {
                self.upload.mode = mode;
                info!("Upload mode set to {:?}", mode);
                self.save_config();
                Ok(())
            }
            Command::SetUploadTarget { directory, prefix } => {
                if prefix.is_empty() {
                    return Err(CaptureError::rejected("upload prefix is empty"));
                }
                self.upload.directory = directory;
                self.upload.prefix = prefix;
                self.save_config();
                Ok(())
            }
            Command::SetFastExposure { enabled } => {
                let was_running = self.fast.set_enabled(enabled);
                if !enabled && (was_running || self.primary.chip.status() == PropertyState::Busy)
                {
                    self.abort_exposure(ChipKind::Primary)?;
                }
                self.save_config();
                Ok(())
            }
            Command::SetFastExposureCount(count) => {
                self.fast.set_count(count);
                Ok(())
            }
            Command::SetLatencyPolicy(policy) => {
                self.fast.set_policy(policy);
                self.save_config();
                Ok(())
            }
            Command::SetTelescopeType(kind) => {
                self.header.telescope_type = kind;
                self.save_config();
                Ok(())
            }
            Command::SetActiveDevices(devices) => {
                self.set_active_devices(devices);
                self.save_config();
                Ok(())
            }
            Command::SetWcs { enabled } => {
                self.header.wcs_enabled = enabled;
                if enabled {
                    // A rotation must be reported again before WCS keywords are written
                    self.header.ccd_rotation = None;
                }
                self.save_config();
                Ok(())
            }
            Command::SetCcdRotation(degrees) => {
                self.header.ccd_rotation = Some(degrees);
                Ok(())
            }
            Command::SetFitsIdentity { observer, object } => {
                self.header.observer = observer;
                self.header.object = object;
                self.save_config();
                Ok(())
            }
            Command::SetWebSocket { enabled } => {
                self.set_websocket(enabled)?;
                self.save_config();
                Ok(())
            }
            Command::SetWebSocketPort(port) => {
                self.websocket_port = port;
                self.save_config();
                Ok(())
            }
            Command::SaveConfig => {
                if let Some(sink) = &self.config {
                    sink.save(&self.name, &self.settings())?;
                }
                Ok(())
            }
        }
    }

    fn start_exposure(&mut self, kind: ChipKind, duration: f64, now: Instant) -> CaptureResult<()> {
        if kind == ChipKind::Guide && !self.driver.capabilities().has_guide_head {
            return Err(CaptureError::rejected("sensor has no guide head"));
        }
        let slot = match kind {
            ChipKind::Primary => &mut self.primary,
            ChipKind::Guide => &mut self.guide,
        };
        let duration = exposure::start_exposure(
            &mut slot.chip,
            &mut self.driver,
            duration,
            &mut self.poll,
            now,
        )?;
        info!("Starting {:.3}s {} exposure", duration, kind);
        Ok(())
    }

    fn abort_exposure(&mut self, kind: ChipKind) -> CaptureResult<()> {
        let slot = match kind {
            ChipKind::Primary => &mut self.primary,
            ChipKind::Guide => &mut self.guide,
        };
        let result = exposure::abort_exposure(&mut slot.chip, &mut self.driver);
        self.poll.restore();
        if kind == ChipKind::Primary {
            self.fast.reset();
        }
        result
    }

    fn set_active_devices(&mut self, devices: ActiveDevices) {
        if devices.telescope.is_none() && self.active_devices.telescope.is_some() {
            self.external.apply(ExternalEvent::TelescopeCleared);
        }
        self.header.telescope_name = devices.telescope.clone();
        self.active_devices = devices;
    }

    fn set_websocket(&mut self, enabled: bool) -> CaptureResult<()> {
        if enabled && self.streamer.is_none() {
            self.streamer = Some(WsStreamer::start(self.websocket_port, self.stream.clone())?);
        } else if !enabled {
            if let Some(mut streamer) = self.streamer.take() {
                streamer.stop();
            }
        }
        self.websocket_enabled = enabled;
        Ok(())
    }

    /// Snapshot of every persisted value.
    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            ramp: self.temperature.ramp(),
            primary_compressed: self.primary.chip.is_compressed(),
            guide_compressed: self.guide.chip.is_compressed(),
            capture_format: self.formats.selected_label().map(str::to_string),
            encode_format: self.encode_format,
            upload: self.upload.clone(),
            fast_exposure_enabled: self.fast.is_enabled(),
            latency_policy: self.fast.policy(),
            telescope_type: self.header.telescope_type,
            active_devices: self.active_devices.clone(),
            guide_binning: self.guide.chip.binning(),
            primary_frame: Some(self.primary.chip.frame()),
            bayer: self.header.bayer.clone(),
            websocket_enabled: self.websocket_enabled,
            websocket_port: self.websocket_port,
            wcs_enabled: self.header.wcs_enabled,
            observer: self.header.observer.clone(),
            object: self.header.object.clone(),
        }
    }

    /// Restore persisted settings. Values that no longer fit the sensor are
    /// skipped with a warning.
    pub fn apply_settings(&mut self, settings: DeviceSettings) -> CaptureResult<()> {
        self.temperature.set_ramp(settings.ramp);
        self.primary.chip.set_compressed(settings.primary_compressed);
        self.guide.chip.set_compressed(settings.guide_compressed);
        self.formats = std::mem::take(&mut self.formats).with_configured(settings.capture_format);
        self.encode_format = settings.encode_format;
        self.upload = settings.upload;
        self.fast.set_enabled(settings.fast_exposure_enabled);
        self.fast.set_policy(settings.latency_policy);
        self.header.telescope_type = settings.telescope_type;
        self.set_active_devices(settings.active_devices);
        if let Err(e) = self.guide.chip.set_binning(settings.guide_binning) {
            warn!("Ignoring saved guide binning: {}", e);
        }
        if let Some(roi) = settings.primary_frame {
            if let Err(e) = self.primary.chip.set_frame(roi) {
                warn!("Ignoring saved frame {}: {}", roi, e);
            }
        }
        self.header.bayer = settings.bayer;
        self.header.wcs_enabled = settings.wcs_enabled;
        self.header.observer = settings.observer;
        self.header.object = settings.object;
        self.websocket_port = settings.websocket_port;
        self.set_websocket(settings.websocket_enabled)
    }

    fn save_config(&self) {
        if let Some(sink) = &self.config {
            if let Err(e) = sink.save(&self.name, &self.settings()) {
                warn!("Failed to save configuration: {}", e);
            }
        }
    }

    /// One control loop tick. Returns the period until the next one.
    pub fn poll(&mut self, now: Instant) -> Duration {
        self.inbox.drain_into(&mut self.external);
        self.drain_outcomes();

        for kind in [ChipKind::Primary, ChipKind::Guide] {
            if self.slot(kind).chip.status() != PropertyState::Busy {
                continue;
            }
            match self.driver.poll_exposure(kind) {
                ExposureProgress::Idle => {}
                ExposureProgress::Exposing { remaining } => {
                    self.slot_mut(kind).chip.set_exposure_left(remaining);
                }
                ExposureProgress::Complete(data) => self.exposure_complete(kind, data, now),
                ExposureProgress::Failed(reason) => {
                    error!("{} exposure failed: {}", kind, reason);
                    self.slot_mut(kind).chip.mark_exposure_failed();
                    self.poll.restore();
                    if kind == ChipKind::Primary {
                        self.fast.reset();
                    }
                }
            }
        }

        if let RampTick::Stepped(setpoint) = self.temperature.tick(&mut self.driver, now) {
            debug!("Temperature ramp issued {:.2} C", setpoint);
        }

        self.poll.current()
    }

    fn exposure_complete(&mut self, kind: ChipKind, data: Vec<u8>, now: Instant) {
        let expected = self.slot(kind).chip.frame_buffer_size();
        if data.len() != expected {
            warn!(
                "{} readout is {} bytes, expected {} for the current frame",
                kind,
                data.len(),
                expected
            );
        }
        self.slot_mut(kind).chip.mark_exposure_complete();
        self.poll.restore();
        info!("{} exposure done, downloading image", kind);

        let job = self.build_job(kind);
        if let Err(e) = self.dispatch(kind, job, data) {
            self.reject_frame(kind, e);
            if kind == ChipKind::Primary {
                self.fast.reset();
            }
            return;
        }

        if kind == ChipKind::Primary {
            self.continue_fast_exposure(now);
        }
    }

    fn continue_fast_exposure(&mut self, now: Instant) {
        let duration = self.primary.chip.exposure_duration();
        let local_only = self.upload.mode == UploadMode::Local;
        let decision = self.fast.on_frame_complete(duration, local_only, now);
        match decision {
            FastDecision::Inactive | FastDecision::Finished => {}
            FastDecision::Restart { duration } => {
                if let Err(e) = exposure::start_exposure(
                    &mut self.primary.chip,
                    &mut self.driver,
                    duration,
                    &mut self.poll,
                    now,
                ) {
                    warn!("Fast exposure restart failed: {}", e);
                    self.primary.chip.mark_exposure_failed();
                    self.last_error = Some(e);
                }
            }
            FastDecision::Halted { .. } => {
                self.primary.chip.mark_exposure_failed();
                self.last_error = decision.error();
            }
        }
    }

    fn build_job(&mut self, kind: ChipKind) -> DeliveryJob {
        let capabilities = self.driver.capabilities();
        let ccd_temperature = capabilities.has_cooler.then(|| self.driver.temperature());
        let external = self.external.take_for_frame();
        let sink: Arc<dyn ClientSink> = if self.streamer.is_some() {
            self.stream.clone()
        } else {
            Arc::new(self.blobs.clone())
        };
        let mut header = self.header.clone();
        if !capabilities.has_bayer {
            header.bayer = None;
        }
        let chip = &self.slot(kind).chip;

        DeliveryJob {
            frame: chip.frame_info(),
            header,
            external,
            ccd_temperature,
            encode_format: self.encode_format,
            upload: self.upload.clone(),
            buffer: chip.buffer().clone(),
            sink,
            jd: ephemeris::julian_day(Utc::now()),
        }
    }

    fn dispatch(&mut self, kind: ChipKind, job: DeliveryJob, data: Vec<u8>) -> CaptureResult<()> {
        let slot = self.slot_mut(kind);
        if slot.in_flight {
            if slot.pending.len() >= MAX_PENDING_FRAMES {
                return Err(CaptureError::QueueFull(kind.name()));
            }
            slot.pending.push_back((job, data));
            debug!("{} frame queued behind {} others", kind, slot.pending.len() - 1);
            return Ok(());
        }

        // The worker is idle, so nothing holds the buffer lock
        job.buffer.replace(data);
        slot.worker.submit(job)?;
        slot.in_flight = true;
        Ok(())
    }

    fn reject_frame(&mut self, kind: ChipKind, e: CaptureError) {
        error!("Could not queue {} frame: {}", kind, e);
        let chip = &mut self.slot_mut(kind).chip;
        if chip.status() != PropertyState::Busy {
            chip.mark_exposure_failed();
        }
        self.last_error = Some(e);
    }

    fn drain_outcomes(&mut self) {
        while let Ok(outcome) = self.outcomes.try_recv() {
            let kind = outcome.chip;
            self.slot_mut(kind).in_flight = false;
            match outcome.result {
                Ok(report) => {
                    debug!(
                        "{} delivery finished in {:.3}s",
                        kind,
                        outcome.elapsed.as_secs_f64()
                    );
                    if let Some(path) = report.saved_path {
                        self.last_saved = Some(path);
                    }
                }
                Err(e) => {
                    error!("{} frame delivery failed: {}", kind, e);
                    let chip = &mut self.slot_mut(kind).chip;
                    // A fast exposure may already have re-armed the chip
                    if chip.status() != PropertyState::Busy {
                        chip.mark_exposure_failed();
                    }
                    self.last_error = Some(e);
                }
            }
            if let Some((job, data)) = self.slot_mut(kind).pending.pop_front() {
                if let Err(e) = self.dispatch(kind, job, data) {
                    self.reject_frame(kind, e);
                }
            }
        }
    }
}
