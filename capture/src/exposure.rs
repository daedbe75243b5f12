//! Exposure state machine for a single chip.
//!
//! Idle -> Busy on start, Busy -> Ok/Alert on completion or failure,
//! Busy -> Idle (or Alert when the hardware refuses) on abort.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::camera_interface::{Chip, FrameKind, PropertyState, SensorDriver};
use crate::error::{CaptureError, CaptureResult};

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(1000);

/// Control loop period, shortened while a short exposure is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPeriod {
    default: Duration,
    current: Duration,
}

impl PollPeriod {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            current: default,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn default_period(&self) -> Duration {
        self.default
    }

    /// Poll at 95% of `duration` when the exposure is shorter than the current period.
    pub fn shorten_for(&mut self, duration: f64) {
        let exposure = Duration::from_secs_f64(duration.max(0.0));
        if exposure < self.current {
            self.current = exposure.mul_f64(0.95);
        }
    }

    pub fn restore(&mut self) {
        self.current = self.default;
    }
}

impl Default for PollPeriod {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_PERIOD)
    }
}

/// Duration to actually expose for: bias frames always use the chip minimum.
pub fn effective_duration(chip: &Chip, requested: f64) -> CaptureResult<f64> {
    let limits = chip.limits();
    if chip.frame_kind() == FrameKind::Bias {
        return Ok(limits.min);
    }
    if !requested.is_finite() || !limits.contains(requested) {
        return Err(CaptureError::rejected(format!(
            "exposure duration {requested} outside [{}, {}] seconds",
            limits.min, limits.max
        )));
    }
    Ok(requested)
}

/// Start an exposure, aborting a running one first when the driver can.
///
/// On rejection the chip keeps its previous duration and status.
pub fn start_exposure<D: SensorDriver + ?Sized>(
    chip: &mut Chip,
    driver: &mut D,
    requested: f64,
    poll: &mut PollPeriod,
    now: Instant,
) -> CaptureResult<f64> {
    let duration = effective_duration(chip, requested)?;

    if chip.status() == PropertyState::Busy && driver.capabilities().can_abort {
        if let Err(e) = driver.abort_exposure(chip.kind()) {
            warn!("Failed to abort running {} exposure: {}", chip.kind(), e);
            return Err(CaptureError::rejected(format!("abort of running exposure failed: {e}")));
        }
        debug!("Aborted running {} exposure before restart", chip.kind());
    }

    match driver.start_exposure(chip, duration) {
        Ok(()) => {
            chip.mark_exposure_started(duration, now);
            poll.shorten_for(duration);
            debug!(
                "Started {:.3}s {} exposure on {} chip",
                duration,
                chip.frame_kind().label(),
                chip.kind()
            );
            Ok(duration)
        }
        Err(e) => {
            chip.mark_exposure_failed();
            Err(CaptureError::rejected(format!("driver refused exposure: {e}")))
        }
    }
}

/// Abort the running exposure. The reported duration is zeroed either way.
pub fn abort_exposure<D: SensorDriver + ?Sized>(
    chip: &mut Chip,
    driver: &mut D,
) -> CaptureResult<()> {
    match driver.abort_exposure(chip.kind()) {
        Ok(()) => {
            chip.mark_exposure_aborted(true);
            info!("{} exposure aborted", chip.kind());
            Ok(())
        }
        Err(e) => {
            chip.mark_exposure_aborted(false);
            Err(CaptureError::rejected(format!("abort failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::mock::MockSensor;
    use crate::camera_interface::{ChipKind, DriverCapabilities, ExposureLimits};

    fn chip() -> Chip {
        let mut chip = Chip::new(ChipKind::Primary);
        chip.set_params(64, 64, 16, 4.0, 4.0).unwrap();
        chip.set_limits(ExposureLimits { min: 0.01, max: 100.0 });
        chip
    }

    fn sensor() -> MockSensor {
        MockSensor::new(DriverCapabilities {
            can_abort: true,
            ..Default::default()
        })
        .manual()
    }

    #[test]
    fn test_stores_duration_within_limits() {
        let mut chip = chip();
        let mut driver = sensor();
        let mut poll = PollPeriod::default();
        for d in [0.01, 0.5, 42.0, 100.0] {
            start_exposure(&mut chip, &mut driver, d, &mut poll, Instant::now()).unwrap();
            assert_eq!(chip.exposure_duration(), d);
            assert_eq!(chip.status(), PropertyState::Busy);
        }
    }

    #[test]
    fn test_bias_forces_minimum() {
        let mut chip = chip();
        chip.set_frame_kind(FrameKind::Bias);
        let mut driver = sensor();
        let mut poll = PollPeriod::default();
        for d in [0.0, 5.0, 1000.0] {
            start_exposure(&mut chip, &mut driver, d, &mut poll, Instant::now()).unwrap();
            assert_eq!(chip.exposure_duration(), 0.01);
        }
    }

    #[test]
    fn test_out_of_range_rejected_without_state_change() {
        let mut chip = chip();
        let mut driver = sensor();
        let mut poll = PollPeriod::default();
        start_exposure(&mut chip, &mut driver, 2.0, &mut poll, Instant::now()).unwrap();
        abort_exposure(&mut chip, &mut driver).unwrap();
        assert_eq!(chip.status(), PropertyState::Idle);

        let err = start_exposure(&mut chip, &mut driver, 101.0, &mut poll, Instant::now());
        assert!(matches!(err, Err(CaptureError::RequestRejected(_))));
        assert_eq!(chip.status(), PropertyState::Idle);
        assert_eq!(driver.exposures_started(), 1);
    }

    #[test]
    fn test_failed_abort_rejects_restart() {
        let mut chip = chip();
        let mut driver = MockSensor::new(DriverCapabilities {
            can_abort: true,
            ..Default::default()
        })
        .manual()
        .with_failing_abort();
        let mut poll = PollPeriod::default();
        start_exposure(&mut chip, &mut driver, 2.0, &mut poll, Instant::now()).unwrap();

        let err = start_exposure(&mut chip, &mut driver, 3.0, &mut poll, Instant::now());
        assert!(err.is_err());
        assert_eq!(chip.exposure_duration(), 2.0);
        assert_eq!(chip.status(), PropertyState::Busy);
    }

    #[test]
    fn test_abort_zeroes_duration() {
        let mut chip = chip();
        let mut driver = sensor();
        let mut poll = PollPeriod::default();
        start_exposure(&mut chip, &mut driver, 2.0, &mut poll, Instant::now()).unwrap();
        abort_exposure(&mut chip, &mut driver).unwrap();
        assert_eq!(chip.exposure_duration(), 0.0);
        assert!(!driver.is_exposing(ChipKind::Primary));
    }

    #[test]
    fn test_short_exposure_shortens_poll() {
        let mut chip = chip();
        let mut driver = sensor();
        let mut poll = PollPeriod::new(Duration::from_millis(1000));

        start_exposure(&mut chip, &mut driver, 5.0, &mut poll, Instant::now()).unwrap();
        assert_eq!(poll.current(), Duration::from_millis(1000));

        start_exposure(&mut chip, &mut driver, 0.2, &mut poll, Instant::now()).unwrap();
        assert!((poll.current().as_secs_f64() - 0.19).abs() < 1e-6);

        poll.restore();
        assert_eq!(poll.current(), Duration::from_millis(1000));
    }
}
