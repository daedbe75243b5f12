//! Sensor chip geometry, exposure bookkeeping and frame buffer ownership.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CaptureResult};

/// Which readout region of the camera a chip represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChipKind {
    Primary,
    Guide,
}

impl ChipKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChipKind::Primary => "primary",
            ChipKind::Guide => "guide",
        }
    }
}

impl fmt::Display for ChipKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame type recorded in image metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameKind {
    #[default]
    Light,
    Bias,
    Dark,
    Flat,
}

impl FrameKind {
    /// Short label used for the FRAME keyword.
    pub fn label(&self) -> &'static str {
        match self {
            FrameKind::Light => "Light",
            FrameKind::Bias => "Bias",
            FrameKind::Dark => "Dark",
            FrameKind::Flat => "Flat",
        }
    }

    /// Long label used for the IMAGETYP keyword.
    pub fn image_type(&self) -> &'static str {
        match self {
            FrameKind::Light => "Light Frame",
            FrameKind::Bias => "Bias Frame",
            FrameKind::Dark => "Dark Frame",
            FrameKind::Flat => "Flat Frame",
        }
    }
}

/// Status reported for exposures and temperature regulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropertyState {
    #[default]
    Idle,
    Busy,
    Ok,
    Alert,
}

/// Region of interest in unbinned sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

/// Exposure duration bounds in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureLimits {
    pub min: f64,
    pub max: f64,
}

impl ExposureLimits {
    pub fn contains(&self, duration: f64) -> bool {
        duration >= self.min && duration <= self.max
    }
}

impl Default for ExposureLimits {
    fn default() -> Self {
        Self {
            min: 0.001,
            max: 3600.0,
        }
    }
}

/// Dimensions of the image actually read out: ROI divided by binning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGeometry {
    /// Binned width in pixels
    pub width: usize,
    /// Binned height in pixels
    pub height: usize,
    /// 1 for mono, 3 for color planes
    pub planes: usize,
    /// Bits per sample: 8, 16 or 32
    pub bits_per_pixel: u8,
}

impl ImageGeometry {
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_pixel / 8)
    }

    pub fn sample_count(&self) -> usize {
        self.width * self.height * self.planes
    }

    pub fn byte_len(&self) -> usize {
        self.sample_count() * self.bytes_per_sample()
    }

    pub fn n_axis(&self) -> usize {
        if self.planes == 3 {
            3
        } else {
            2
        }
    }
}

/// Everything about a finished exposure the delivery worker needs, copied
/// out of the chip at completion so later commands cannot change it.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub kind: ChipKind,
    pub roi: Roi,
    pub binning: Binning,
    pub geometry: ImageGeometry,
    /// Unbinned pixel pitch in microns
    pub pixel_size: (f64, f64),
    pub frame_kind: FrameKind,
    pub exposure_duration: f64,
    pub exposure_start: Option<String>,
    pub image_extension: String,
    pub compressed: bool,
}

/// Pixel buffer shared between a chip and its delivery worker.
///
/// The mutex doubles as the delivery lock: the worker holds it for the whole
/// encode and deliver pass, and a new exposure replaces the contents under it.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl FrameBuffer {
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panicked holder cannot leave the bytes half-written, so keep going
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the contents wholesale with a freshly read out frame.
    pub fn replace(&self, data: Vec<u8>) {
        *self.lock() = data;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One sensor readout region and everything needed to describe its frames.
#[derive(Debug)]
pub struct Chip {
    kind: ChipKind,
    max_width: u32,
    max_height: u32,
    roi: Roi,
    binning: Binning,
    max_binning: u32,
    bits_per_pixel: u8,
    pixel_size_x: f64,
    pixel_size_y: f64,
    frame_kind: FrameKind,
    n_axis: u8,
    image_extension: String,
    compressed: bool,
    limits: ExposureLimits,
    exposure_duration: f64,
    exposure_left: f64,
    exposure_start: Option<DateTime<Utc>>,
    exposure_started_at: Option<Instant>,
    status: PropertyState,
    buffer: FrameBuffer,
}

impl Chip {
    pub fn new(kind: ChipKind) -> Self {
        Self {
            kind,
            max_width: 0,
            max_height: 0,
            roi: Roi::full(0, 0),
            binning: Binning::default(),
            max_binning: 4,
            bits_per_pixel: 16,
            pixel_size_x: 0.0,
            pixel_size_y: 0.0,
            frame_kind: FrameKind::Light,
            n_axis: 2,
            image_extension: "fits".to_string(),
            compressed: false,
            limits: ExposureLimits::default(),
            exposure_duration: 0.0,
            exposure_left: 0.0,
            exposure_start: None,
            exposure_started_at: None,
            status: PropertyState::Idle,
            buffer: FrameBuffer::default(),
        }
    }

    /// Sensor parameters reported by the driver: resolution, depth and pixel pitch.
    pub fn set_params(
        &mut self,
        width: u32,
        height: u32,
        bits_per_pixel: u8,
        pitch_x: f64,
        pitch_y: f64,
    ) -> CaptureResult<()> {
        self.set_bits_per_pixel(bits_per_pixel)?;
        self.set_resolution(width, height);
        self.set_pixel_size(pitch_x, pitch_y);
        Ok(())
    }

    pub fn kind(&self) -> ChipKind {
        self.kind
    }

    /// Set the full sensor size. The ROI is reset to cover it.
    pub fn set_resolution(&mut self, width: u32, height: u32) {
        self.max_width = width;
        self.max_height = height;
        self.roi = Roi::full(width, height);
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.max_width, self.max_height)
    }

    pub fn frame(&self) -> Roi {
        self.roi
    }

    /// Validate and store a new region of interest.
    pub fn set_frame(&mut self, roi: Roi) -> CaptureResult<()> {
        if roi.width == 0 || roi.height == 0 {
            return Err(CaptureError::rejected(format!(
                "frame {roi} must have positive width and height"
            )));
        }
        let fits_x = roi.x.checked_add(roi.width).is_some_and(|end| end <= self.max_width);
        let fits_y = roi.y.checked_add(roi.height).is_some_and(|end| end <= self.max_height);
        if !fits_x || !fits_y {
            return Err(CaptureError::rejected(format!(
                "frame {roi} exceeds sensor {}x{}",
                self.max_width, self.max_height
            )));
        }
        self.roi = roi;
        Ok(())
    }

    /// Binning back to 1x1 and the ROI back to the full sensor.
    pub fn reset_frame(&mut self) {
        self.binning = Binning::default();
        self.roi = Roi::full(self.max_width, self.max_height);
    }

    pub fn binning(&self) -> Binning {
        self.binning
    }

    pub fn set_max_binning(&mut self, max: u32) {
        self.max_binning = max.max(1);
    }

    pub fn set_binning(&mut self, binning: Binning) -> CaptureResult<()> {
        let range = 1..=self.max_binning;
        if !range.contains(&binning.x) || !range.contains(&binning.y) {
            return Err(CaptureError::rejected(format!(
                "binning {}x{} outside 1..={}",
                binning.x, binning.y, self.max_binning
            )));
        }
        self.binning = binning;
        Ok(())
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.bits_per_pixel
    }

    pub fn set_bits_per_pixel(&mut self, bpp: u8) -> CaptureResult<()> {
        match bpp {
            8 | 16 | 32 => {
                self.bits_per_pixel = bpp;
                Ok(())
            }
            other => Err(CaptureError::UnsupportedBitDepth(other)),
        }
    }

    /// Pixel pitch in microns.
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.pixel_size_x, self.pixel_size_y)
    }

    pub fn set_pixel_size(&mut self, x: f64, y: f64) {
        self.pixel_size_x = x;
        self.pixel_size_y = y;
    }

    pub fn frame_kind(&self) -> FrameKind {
        self.frame_kind
    }

    pub fn set_frame_kind(&mut self, kind: FrameKind) {
        self.frame_kind = kind;
    }

    pub fn n_axis(&self) -> u8 {
        self.n_axis
    }

    /// 2 for mono frames, 3 for color frames.
    pub fn set_n_axis(&mut self, n_axis: u8) -> CaptureResult<()> {
        if n_axis != 2 && n_axis != 3 {
            return Err(CaptureError::rejected(format!("unsupported axis count {n_axis}")));
        }
        self.n_axis = n_axis;
        Ok(())
    }

    pub fn image_extension(&self) -> &str {
        &self.image_extension
    }

    pub fn set_image_extension(&mut self, ext: impl Into<String>) {
        self.image_extension = ext.into();
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn set_compressed(&mut self, enabled: bool) {
        self.compressed = enabled;
    }

    pub fn limits(&self) -> ExposureLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: ExposureLimits) {
        self.limits = limits;
    }

    pub fn geometry(&self) -> ImageGeometry {
        ImageGeometry {
            width: (self.roi.width / self.binning.x) as usize,
            height: (self.roi.height / self.binning.y) as usize,
            planes: if self.n_axis == 3 { 3 } else { 1 },
            bits_per_pixel: self.bits_per_pixel,
        }
    }

    /// Snapshot of the geometry and exposure facts describing the current frame.
    pub fn frame_info(&self) -> FrameInfo {
        FrameInfo {
            kind: self.kind,
            roi: self.roi,
            binning: self.binning,
            geometry: self.geometry(),
            pixel_size: self.pixel_size(),
            frame_kind: self.frame_kind,
            exposure_duration: self.exposure_duration,
            exposure_start: self.exposure_start_time(),
            image_extension: self.image_extension.clone(),
            compressed: self.compressed,
        }
    }

    /// Expected byte length of a readout with the current geometry.
    pub fn frame_buffer_size(&self) -> usize {
        self.geometry().byte_len()
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn status(&self) -> PropertyState {
        self.status
    }

    pub fn set_status(&mut self, status: PropertyState) {
        self.status = status;
    }

    pub fn exposure_duration(&self) -> f64 {
        self.exposure_duration
    }

    /// Seconds remaining in the running exposure as last reported by the driver.
    pub fn exposure_left(&self) -> f64 {
        self.exposure_left
    }

    pub fn set_exposure_left(&mut self, seconds: f64) {
        self.exposure_left = seconds.max(0.0);
    }

    pub fn exposure_start(&self) -> Option<DateTime<Utc>> {
        self.exposure_start
    }

    /// DATE-OBS formatted start of the last exposure.
    pub fn exposure_start_time(&self) -> Option<String> {
        self.exposure_start
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
    }

    pub fn exposure_started_at(&self) -> Option<Instant> {
        self.exposure_started_at
    }

    pub(crate) fn mark_exposure_started(&mut self, duration: f64, now: Instant) {
        self.exposure_duration = duration;
        self.exposure_left = duration;
        self.exposure_start = Some(Utc::now());
        self.exposure_started_at = Some(now);
        self.status = PropertyState::Busy;
    }

    pub(crate) fn mark_exposure_aborted(&mut self, succeeded: bool) {
        self.exposure_duration = 0.0;
        self.exposure_left = 0.0;
        self.status = if succeeded {
            PropertyState::Idle
        } else {
            PropertyState::Alert
        };
    }

    pub(crate) fn mark_exposure_complete(&mut self) {
        self.exposure_left = 0.0;
        self.status = PropertyState::Ok;
    }

    pub(crate) fn mark_exposure_failed(&mut self) {
        self.status = PropertyState::Alert;
    }
}
