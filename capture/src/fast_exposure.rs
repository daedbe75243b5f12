//! Back-to-back exposure sequencing for the primary chip.
//!
//! Each completed frame either re-arms the chip immediately or ends the
//! sequence. Delivery latency is estimated from the wall-clock spacing of
//! completions minus the exposure time; when it no longer fits inside the
//! exposure the sequence halts rather than falling behind.

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::camera_interface::PropertyState;
use crate::error::CaptureError;

pub const MAX_FAST_COUNT: u32 = 100_000;

/// How latency samples are folded into the estimate compared against the
/// exposure duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LatencyPolicy {
    /// Only the latest measured cycle counts
    #[default]
    MostRecent,
    /// Mean over the last `n` cycles
    WindowedMean(usize),
}

impl LatencyPolicy {
    fn window(&self) -> usize {
        match self {
            LatencyPolicy::MostRecent => 1,
            LatencyPolicy::WindowedMean(n) => (*n).max(1),
        }
    }
}

/// What the device should do after a primary frame completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FastDecision {
    /// Fast exposure does not apply to this frame
    Inactive,
    /// Start the next exposure with the same duration now
    Restart { duration: f64 },
    /// The last frame of the sequence just completed
    Finished,
    /// Latency exceeds the exposure time; the sequence was stopped
    Halted { upload_secs: f64, exposure_secs: f64 },
}

impl FastDecision {
    pub fn error(&self) -> Option<CaptureError> {
        match *self {
            FastDecision::Halted {
                upload_secs,
                exposure_secs,
            } => Some(CaptureError::ThroughputInfeasible {
                upload_secs,
                exposure_secs,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FastExposure {
    enabled: bool,
    count: u32,
    state: PropertyState,
    policy: LatencyPolicy,
    cycle_start: Option<Instant>,
    samples: VecDeque<f64>,
}

impl Default for FastExposure {
    fn default() -> Self {
        Self::new(LatencyPolicy::default())
    }
}

impl FastExposure {
    pub fn new(policy: LatencyPolicy) -> Self {
        Self {
            enabled: false,
            count: 1,
            state: PropertyState::Idle,
            policy,
            cycle_start: None,
            samples: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true when the mode was switched off while a sequence ran.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if enabled && !self.enabled {
            warn!(
                "Experimental feature: after a frame is downloaded the next capture starts \
                 immediately"
            );
        }
        self.enabled = enabled;
        if enabled {
            return false;
        }
        let was_running = self.state == PropertyState::Busy;
        self.state = PropertyState::Idle;
        self.clear_latency();
        was_running
    }

    /// Frames remaining in the sequence, including the one being exposed.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = count.min(MAX_FAST_COUNT);
    }

    pub fn state(&self) -> PropertyState {
        self.state
    }

    pub fn policy(&self) -> LatencyPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: LatencyPolicy) {
        self.policy = policy;
        self.trim_samples();
    }

    /// True when the next completed primary frame takes part in a sequence.
    pub fn is_active(&self) -> bool {
        self.enabled && (self.count > 1 || self.state == PropertyState::Busy)
    }

    /// Current latency estimate in seconds, 0 until a cycle was measured.
    pub fn upload_time(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Called when the primary exposure is aborted.
    pub fn reset(&mut self) {
        if self.state == PropertyState::Busy {
            self.count = 1;
        }
        self.state = PropertyState::Idle;
        self.clear_latency();
    }

    /// Decide what follows the frame that just completed.
    ///
    /// `duration` is the exposure time of that frame and `local_only` is set
    /// when frames are only saved to disk, in which case latency is not
    /// checked.
    pub fn on_frame_complete(
        &mut self,
        duration: f64,
        local_only: bool,
        now: Instant,
    ) -> FastDecision {
        if !self.is_active() {
            return FastDecision::Inactive;
        }

        if !local_only {
            match self.cycle_start {
                Some(start) if self.state == PropertyState::Busy => {
                    let sample = now.duration_since(start).as_secs_f64() - duration;
                    self.push_sample(sample);
                    debug!("Image download and upload/save took {:.3} seconds.", sample);
                }
                _ => {}
            }
            self.cycle_start = Some(now);
        }

        self.state = PropertyState::Busy;
        self.count = self.count.saturating_sub(1);

        if self.count == 0 {
            self.state = PropertyState::Idle;
            self.clear_latency();
            debug!("Fast exposure sequence finished");
            return FastDecision::Finished;
        }

        let upload_secs = self.upload_time();
        if local_only || upload_secs < duration {
            return FastDecision::Restart { duration };
        }

        error!(
            "Rapid exposure not possible since upload time is {:.2} seconds while exposure \
             time is {:.2} seconds.",
            upload_secs, duration
        );
        self.count = 1;
        self.state = PropertyState::Idle;
        self.clear_latency();
        FastDecision::Halted {
            upload_secs,
            exposure_secs: duration,
        }
    }

    fn push_sample(&mut self, sample: f64) {
        self.samples.push_back(sample);
        self.trim_samples();
    }

    fn trim_samples(&mut self) {
        let window = self.policy.window();
        while self.samples.len() > window {
            self.samples.pop_front();
        }
    }

    fn clear_latency(&mut self) {
        self.samples.clear();
        self.cycle_start = None;
    }
}
