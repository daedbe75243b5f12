//! Cooler setpoint ramping.
//!
//! With a non-zero slope the controller walks the setpoint towards the
//! target by at most `slope` degrees per minute, re-evaluating every
//! [`CHECK_INTERVAL`]. With a zero slope the target goes straight to the
//! driver and the controller only watches for convergence.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera_interface::{PropertyState, SensorDriver, TemperatureResponse};
use crate::error::{CaptureError, CaptureResult};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const STEP_INTERVAL: Duration = Duration::from_secs(60);
pub const MIN_TEMPERATURE: f64 = -50.0;
pub const MAX_TEMPERATURE: f64 = 50.0;

/// Ramp limits in °C/minute and convergence band in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRamp {
    /// Maximum change per minute, 0 disables ramping
    pub slope: f64,
    pub threshold: f64,
}

impl TemperatureRamp {
    pub fn new(slope: f64, threshold: f64) -> CaptureResult<Self> {
        if !(0.0..=30.0).contains(&slope) {
            return Err(CaptureError::rejected(format!(
                "ramp slope {slope} outside [0, 30] C/min"
            )));
        }
        if !(0.1..=2.0).contains(&threshold) {
            return Err(CaptureError::rejected(format!(
                "ramp threshold {threshold} outside [0.1, 2] C"
            )));
        }
        Ok(Self { slope, threshold })
    }

    pub fn is_enabled(&self) -> bool {
        self.slope != 0.0
    }

    /// Next setpoint from `current` towards `target`, never overshooting.
    pub fn next_setpoint(&self, current: f64, target: f64) -> f64 {
        if !self.is_enabled() {
            return target;
        }
        if target < current {
            target.max(current - self.slope)
        } else {
            target.min(current + self.slope)
        }
    }
}

impl Default for TemperatureRamp {
    fn default() -> Self {
        Self {
            slope: 0.0,
            threshold: 0.2,
        }
    }
}

/// Result of one controller tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampTick {
    /// No ramp in progress
    Inactive,
    /// Ramping, nothing to do yet
    Waiting,
    /// Issued an intermediate setpoint
    Stepped(f64),
    /// Within threshold of the target
    Converged,
}

#[derive(Debug, Clone)]
pub struct RampController {
    ramp: TemperatureRamp,
    target: Option<f64>,
    state: PropertyState,
    last_step: Option<Instant>,
    next_check: Option<Instant>,
}

impl RampController {
    pub fn new(ramp: TemperatureRamp) -> Self {
        Self {
            ramp,
            target: None,
            state: PropertyState::Idle,
            last_step: None,
            next_check: None,
        }
    }

    pub fn ramp(&self) -> TemperatureRamp {
        self.ramp
    }

    pub fn set_ramp(&mut self, ramp: TemperatureRamp) {
        if ramp.slope == 0.0 {
            info!("Temperature ramp is disabled.");
        } else {
            info!("Temperature ramp is enabled. Max. dT is {:.0} C/min", ramp.slope);
        }
        self.ramp = ramp;
    }

    pub fn state(&self) -> PropertyState {
        self.state
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    /// Accept a new target and issue the first setpoint.
    pub fn request<D: SensorDriver + ?Sized>(
        &mut self,
        target: f64,
        driver: &mut D,
        now: Instant,
    ) -> CaptureResult<PropertyState> {
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&target) {
            self.state = PropertyState::Alert;
            return Err(CaptureError::rejected(format!(
                "bad temperature value {target}, range is [{:.1}, {:.1}] C",
                MIN_TEMPERATURE, MAX_TEMPERATURE
            )));
        }

        let setpoint = self.ramp.next_setpoint(driver.temperature(), target);
        self.state = match driver.set_temperature(setpoint) {
            TemperatureResponse::Ramping => {
                self.last_step = self.ramp.is_enabled().then_some(now);
                self.target = Some(target);
                self.next_check = Some(now + CHECK_INTERVAL);
                debug!("Cooler setpoint {:.2} C towards target {:.2} C", setpoint, target);
                PropertyState::Busy
            }
            TemperatureResponse::Reached => PropertyState::Ok,
            TemperatureResponse::Failed => PropertyState::Alert,
        };
        Ok(self.state)
    }

    /// Periodic check. Cheap to call on every poll; work happens at most
    /// once per [`CHECK_INTERVAL`].
    pub fn tick<D: SensorDriver + ?Sized>(&mut self, driver: &mut D, now: Instant) -> RampTick {
        if self.state != PropertyState::Busy {
            return RampTick::Inactive;
        }
        let Some(target) = self.target else {
            return RampTick::Inactive;
        };
        if self.next_check.is_some_and(|at| now < at) {
            return RampTick::Waiting;
        }
        self.next_check = Some(now + CHECK_INTERVAL);

        let current = driver.temperature();
        if (target - current).abs() <= self.ramp.threshold {
            self.state = PropertyState::Ok;
            self.next_check = None;
            self.last_step = None;
            info!("Temperature reached target {:.2} C", target);
            return RampTick::Converged;
        }

        match self.last_step {
            Some(at) if now.duration_since(at) >= STEP_INTERVAL => {
                let setpoint = self.ramp.next_setpoint(current, target);
                self.last_step = Some(now);
                if driver.set_temperature(setpoint) == TemperatureResponse::Failed {
                    warn!("Cooler rejected setpoint {:.2} C", setpoint);
                }
                debug!("Ramping cooler setpoint to {:.2} C", setpoint);
                RampTick::Stepped(setpoint)
            }
            _ => RampTick::Waiting,
        }
    }
}
