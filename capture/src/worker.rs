//! Per-chip delivery worker.
//!
//! Each chip owns one worker thread fed through a single-slot queue. The
//! worker takes the chip's buffer lock, synthesizes the header, encodes and
//! delivers, then reports the outcome on a channel the control thread drains
//! during its poll. The control thread never blocks on any of it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::camera_interface::{ChipKind, FrameBuffer, FrameInfo};
use crate::delivery::{self, ClientSink, DeliveryReport, UploadSettings};
use crate::encode::{EncodeFormat, EncodeRequest};
use crate::error::{CaptureError, CaptureResult};
use crate::external::ExternalSnapshot;
use crate::fits::FitsHeader;
use crate::metadata::{self, HeaderSettings, SynthesisInput};

/// Everything the worker needs for one frame, captured at completion time.
pub struct DeliveryJob {
    pub frame: FrameInfo,
    pub header: HeaderSettings,
    pub external: ExternalSnapshot,
    pub ccd_temperature: Option<f64>,
    pub encode_format: EncodeFormat,
    pub upload: UploadSettings,
    pub buffer: FrameBuffer,
    pub sink: Arc<dyn ClientSink>,
    /// Julian day used for every coordinate transform of this frame
    pub jd: f64,
}

/// Result of one delivery, sent back to the control thread.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub chip: ChipKind,
    pub result: CaptureResult<DeliveryReport>,
    pub elapsed: Duration,
}

/// Run the synthesize, encode and deliver pass with the buffer lock held.
pub fn process(job: &DeliveryJob) -> CaptureResult<DeliveryReport> {
    let pixels = job.buffer.lock();

    let header = match job.encode_format {
        EncodeFormat::Fits => {
            let input = SynthesisInput {
                frame: &job.frame,
                settings: &job.header,
                external: &job.external,
                ccd_temperature: job.ccd_temperature,
                pixels: &pixels,
            };
            metadata::synthesize(&input, job.jd)
        }
        EncodeFormat::Native => FitsHeader::new(),
    };

    let request = EncodeRequest {
        format: job.encode_format,
        header: &header,
        geometry: &job.frame.geometry,
        extension: &job.frame.image_extension,
        pixels: &pixels,
    };
    delivery::deliver(
        job.frame.kind,
        &request,
        job.frame.compressed,
        &job.upload,
        job.sink.as_ref(),
    )
}

pub struct DeliveryWorker {
    chip: ChipKind,
    sender: Option<Sender<DeliveryJob>>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    /// Spawn the worker thread. Outcomes are sent on `outcomes`.
    pub fn spawn(chip: ChipKind, outcomes: Sender<DeliveryOutcome>) -> CaptureResult<Self> {
        let (sender, receiver) = bounded::<DeliveryJob>(1);
        let handle = std::thread::Builder::new()
            .name(format!("{}-delivery", chip.name()))
            .spawn(move || run(chip, receiver, outcomes))
            .map_err(|e| CaptureError::io("spawning delivery worker", e))?;

        Ok(Self {
            chip,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue a job without blocking.
    pub fn submit(&self, job: DeliveryJob) -> CaptureResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or(CaptureError::WorkerDisconnected(self.chip.name()))?;
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CaptureError::QueueFull(self.chip.name())),
            Err(TrySendError::Disconnected(_)) => {
                Err(CaptureError::WorkerDisconnected(self.chip.name()))
            }
        }
    }

    /// Finish the queued job, then stop the thread.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} delivery worker panicked", self.chip);
            }
        }
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(chip: ChipKind, jobs: Receiver<DeliveryJob>, outcomes: Sender<DeliveryOutcome>) {
    debug!("{} delivery worker started", chip);
    while let Ok(job) = jobs.recv() {
        let started = Instant::now();
        let result = process(&job);
        let outcome = DeliveryOutcome {
            chip,
            result,
            elapsed: started.elapsed(),
        };
        if outcomes.send(outcome).is_err() {
            info!("{} delivery worker lost its device", chip);
            break;
        }
    }
    debug!("{} delivery worker shutting down", chip);
}
