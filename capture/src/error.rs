//! Error types for the capture pipeline.
//!
//! Every failure is scoped to a single request or frame. None of these
//! terminate the hosting process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The request was refused and device state was left unchanged.
    #[error("request rejected: {0}")]
    RequestRejected(String),

    #[error("IO error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("FITS I/O error: {0}")]
    Fits(#[from] fitsio::compat::errors::Error),

    #[error("unsupported bits per pixel value {0}")]
    UnsupportedBitDepth(u8),

    #[error(
        "rapid exposure not possible since upload time is {upload_secs:.2} seconds \
         while exposure time is {exposure_secs:.2} seconds"
    )]
    ThroughputInfeasible { upload_secs: f64, exposure_secs: f64 },

    #[error("delivery queue for {0} chip is full")]
    QueueFull(&'static str),

    #[error("delivery worker for {0} chip has stopped")]
    WorkerDisconnected(&'static str),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl CaptureError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::RequestRejected(reason.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for failures that mark the current exposure as failed.
    pub fn fails_frame(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Fits(_) | Self::Encoding(_) | Self::UnsupportedBitDepth(_)
        )
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
