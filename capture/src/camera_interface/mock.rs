use super::{
    CameraError, CameraResult, Chip, ChipKind, DriverCapabilities, ExposureProgress,
    ImageGeometry, SensorDriver, TemperatureResponse,
};
use crate::formats::CaptureFormat;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Cooler movement per poll in Celsius
const COOLER_STEP: f64 = 0.5;

#[derive(Debug, Clone)]
struct PendingExposure {
    ready_at: Instant,
    geometry: ImageGeometry,
}

/// Simulated sensor producing gradient frames.
///
/// Exposures complete once their wall-clock duration has elapsed. In manual
/// mode they only complete through [`MockSensor::finish_exposure`], which
/// lets tests step the pipeline deterministically.
pub struct MockSensor {
    capabilities: DriverCapabilities,
    pending: HashMap<ChipKind, PendingExposure>,
    finished: HashMap<ChipKind, Vec<u8>>,
    manual: bool,
    temperature: f64,
    setpoint: f64,
    fail_abort: bool,
    rejected_format: Option<String>,
    capture_format: Option<String>,
    frame_count: u64,
    setpoints: Vec<f64>,
    exposures_started: u64,
}

impl MockSensor {
    pub fn new(capabilities: DriverCapabilities) -> Self {
        Self {
            capabilities,
            pending: HashMap::new(),
            finished: HashMap::new(),
            manual: false,
            temperature: 20.0,
            setpoint: 20.0,
            fail_abort: false,
            rejected_format: None,
            capture_format: None,
            frame_count: 0,
            setpoints: Vec::new(),
            exposures_started: 0,
        }
    }

    /// Only complete exposures when told to.
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn with_failing_abort(mut self) -> Self {
        self.fail_abort = true;
        self
    }

    /// Refuse to switch to the capture format called `name`.
    pub fn with_rejected_format(mut self, name: &str) -> Self {
        self.rejected_format = Some(name.to_string());
        self
    }

    /// Name of the last capture format the sensor accepted.
    pub fn capture_format(&self) -> Option<&str> {
        self.capture_format.as_deref()
    }

    /// Force the sensor temperature reading.
    pub fn set_sensor_temperature(&mut self, celsius: f64) {
        self.temperature = celsius;
    }

    /// Every setpoint the pipeline has issued, oldest first.
    pub fn setpoints(&self) -> &[f64] {
        &self.setpoints
    }

    pub fn exposures_started(&self) -> u64 {
        self.exposures_started
    }

    pub fn is_exposing(&self, kind: ChipKind) -> bool {
        self.pending.contains_key(&kind)
    }

    /// Complete the running exposure with a generated frame.
    pub fn finish_exposure(&mut self, kind: ChipKind) -> bool {
        match self.pending.remove(&kind) {
            Some(pending) => {
                let frame = self.generate_frame(&pending.geometry);
                self.finished.insert(kind, frame);
                true
            }
            None => false,
        }
    }

    /// Complete the running exposure with caller-provided bytes.
    pub fn finish_exposure_with(&mut self, kind: ChipKind, data: Vec<u8>) -> bool {
        if self.pending.remove(&kind).is_some() {
            self.finished.insert(kind, data);
            true
        } else {
            false
        }
    }

    fn generate_frame(&mut self, geometry: &ImageGeometry) -> Vec<u8> {
        self.frame_count += 1;
        let bytes = geometry.bytes_per_sample();
        let mut data = Vec::with_capacity(geometry.byte_len());
        for i in 0..geometry.sample_count() {
            let value = (i as u64).wrapping_add(self.frame_count * 7);
            data.extend_from_slice(&value.to_le_bytes()[..bytes]);
        }
        data
    }

    fn advance_cooler(&mut self) {
        let delta = self.setpoint - self.temperature;
        self.temperature += delta.clamp(-COOLER_STEP, COOLER_STEP);
    }
}

impl SensorDriver for MockSensor {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn start_exposure(&mut self, chip: &Chip, duration: f64) -> CameraResult<()> {
        if chip.kind() == ChipKind::Guide && !self.capabilities.has_guide_head {
            return Err(CameraError::NotSupported("guide head".to_string()));
        }
        self.finished.remove(&chip.kind());
        self.pending.insert(
            chip.kind(),
            PendingExposure {
                ready_at: Instant::now() + Duration::from_secs_f64(duration),
                geometry: chip.geometry(),
            },
        );
        self.exposures_started += 1;
        Ok(())
    }

    fn abort_exposure(&mut self, kind: ChipKind) -> CameraResult<()> {
        if self.fail_abort {
            return Err(CameraError::HardwareError("abort refused".to_string()));
        }
        self.pending.remove(&kind);
        Ok(())
    }

    fn poll_exposure(&mut self, kind: ChipKind) -> ExposureProgress {
        self.advance_cooler();

        if let Some(frame) = self.finished.remove(&kind) {
            return ExposureProgress::Complete(frame);
        }
        let Some(pending) = self.pending.get(&kind) else {
            return ExposureProgress::Idle;
        };
        let now = Instant::now();
        if self.manual || now < pending.ready_at {
            let remaining = pending.ready_at.saturating_duration_since(now);
            return ExposureProgress::Exposing {
                remaining: remaining.as_secs_f64(),
            };
        }
        self.finish_exposure(kind);
        match self.finished.remove(&kind) {
            Some(frame) => ExposureProgress::Complete(frame),
            None => ExposureProgress::Idle,
        }
    }

    fn set_temperature(&mut self, celsius: f64) -> TemperatureResponse {
        self.setpoints.push(celsius);
        self.setpoint = celsius;
        if (self.temperature - celsius).abs() < f64::EPSILON {
            TemperatureResponse::Reached
        } else {
            TemperatureResponse::Ramping
        }
    }

    fn temperature(&self) -> f64 {
        self.temperature
    }

    fn set_capture_format(&mut self, format: &CaptureFormat) -> CameraResult<()> {
        if self.rejected_format.as_deref() == Some(format.name.as_str()) {
            return Err(CameraError::NotSupported(format!("capture format {}", format.name)));
        }
        self.capture_format = Some(format.name.clone());
        Ok(())
    }
}
