//! Sensor driver abstraction for the capture pipeline
//!
//! The pipeline never touches hardware directly. A driver starts and stops
//! exposures, reports readout progress and owns the cooler. Completed frames
//! come back as raw little-endian sample buffers which the pipeline then
//! copies into the chip's [`FrameBuffer`].

pub mod chip;
pub mod mock;

pub use chip::{
    Binning, Chip, ChipKind, ExposureLimits, FrameBuffer, FrameInfo, FrameKind, ImageGeometry,
    PropertyState, Roi,
};

use std::error::Error;
use std::fmt;

use crate::formats::CaptureFormat;

/// Error type for driver operations
#[derive(Debug, Clone, PartialEq)]
pub enum CameraError {
    /// Hardware communication error
    HardwareError(String),
    /// Operation the sensor cannot perform
    NotSupported(String),
    /// Invalid region of interest or binning
    InvalidRoi(String),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CameraError::HardwareError(msg) => write!(f, "Hardware error: {msg}"),
            CameraError::NotSupported(msg) => write!(f, "Not supported: {msg}"),
            CameraError::InvalidRoi(msg) => write!(f, "Invalid ROI: {msg}"),
        }
    }
}

impl Error for CameraError {}

/// Result type for driver operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Optional features a driver may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverCapabilities {
    pub can_abort: bool,
    pub can_bin: bool,
    pub can_subframe: bool,
    pub has_cooler: bool,
    pub has_guide_head: bool,
    pub has_shutter: bool,
    pub has_bayer: bool,
    pub has_streaming: bool,
    pub has_websocket: bool,
}

/// Driver answer to a temperature setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureResponse {
    /// Setpoint accepted, sensor is moving towards it
    Ramping,
    /// Sensor is already at the setpoint
    Reached,
    /// Setpoint could not be applied
    Failed,
}

/// Progress of an exposure as observed on one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureProgress {
    /// No exposure is running on this chip
    Idle,
    /// Still integrating or reading out
    Exposing { remaining: f64 },
    /// Readout finished with the given little-endian sample buffer
    Complete(Vec<u8>),
    /// Hardware reported a failure
    Failed(String),
}

/// Trait implemented by sensor drivers
///
/// Implementations must be `Send` so the device can be moved onto the
/// thread that runs the control loop.
pub trait SensorDriver: Send {
    /// Static description of what this sensor can do
    fn capabilities(&self) -> DriverCapabilities;

    /// Begin an exposure on `chip` using its current geometry.
    ///
    /// # Arguments
    /// * `chip` - Chip whose frame, binning and depth describe the readout
    /// * `duration` - Exposure time in seconds, already validated
    fn start_exposure(&mut self, chip: &Chip, duration: f64) -> CameraResult<()>;

    /// Abort the running exposure on `kind`
    fn abort_exposure(&mut self, kind: ChipKind) -> CameraResult<()>;

    /// Non-blocking progress check, called once per control loop tick
    fn poll_exposure(&mut self, kind: ChipKind) -> ExposureProgress;

    /// Apply a cooler setpoint in Celsius
    fn set_temperature(&mut self, celsius: f64) -> TemperatureResponse;

    /// Current sensor temperature in Celsius
    fn temperature(&self) -> f64;

    /// Called after the ROI changes so hardware can reprogram readout windows
    fn update_frame(&mut self, _kind: ChipKind, _roi: Roi) -> CameraResult<()> {
        Ok(())
    }

    /// Called after binning changes
    fn update_binning(&mut self, _kind: ChipKind, _binning: Binning) -> CameraResult<()> {
        Ok(())
    }

    /// Called after the frame kind changes (e.g. to close a shutter for darks)
    fn update_frame_kind(&mut self, _kind: ChipKind, _frame: FrameKind) -> CameraResult<()> {
        Ok(())
    }

    /// Switch the readout format. An error leaves the previous selection active.
    fn set_capture_format(&mut self, _format: &CaptureFormat) -> CameraResult<()> {
        Ok(())
    }
}

impl<T: SensorDriver + ?Sized> SensorDriver for Box<T> {
    fn capabilities(&self) -> DriverCapabilities {
        (**self).capabilities()
    }

    fn start_exposure(&mut self, chip: &Chip, duration: f64) -> CameraResult<()> {
        (**self).start_exposure(chip, duration)
    }

    fn abort_exposure(&mut self, kind: ChipKind) -> CameraResult<()> {
        (**self).abort_exposure(kind)
    }

    fn poll_exposure(&mut self, kind: ChipKind) -> ExposureProgress {
        (**self).poll_exposure(kind)
    }

    fn set_temperature(&mut self, celsius: f64) -> TemperatureResponse {
        (**self).set_temperature(celsius)
    }

    fn temperature(&self) -> f64 {
        (**self).temperature()
    }

    fn update_frame(&mut self, kind: ChipKind, roi: Roi) -> CameraResult<()> {
        (**self).update_frame(kind, roi)
    }

    fn update_binning(&mut self, kind: ChipKind, binning: Binning) -> CameraResult<()> {
        (**self).update_binning(kind, binning)
    }

    fn update_frame_kind(&mut self, kind: ChipKind, frame: FrameKind) -> CameraResult<()> {
        (**self).update_frame_kind(kind, frame)
    }

    fn set_capture_format(&mut self, format: &CaptureFormat) -> CameraResult<()> {
        (**self).set_capture_format(format)
    }
}
