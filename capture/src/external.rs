//! Typed inbox for state supplied by peer devices.
//!
//! Mounts, focusers, filter wheels, rotators and sky quality meters push
//! [`ExternalEvent`]s through an [`EventSender`]. The device drains the
//! [`EventInbox`] into an [`ExternalSnapshot`] at the start of every
//! metadata synthesis pass, so the header always reflects the latest values
//! without any shared mutable state between the two sides.

use crossbeam_channel::{Receiver, Sender};
use ephemeris::{Equatorial, GeographicSite};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Side of the pier the mount is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PierSide {
    West,
    East,
}

/// Focal length and aperture in millimetres. Non-positive values mean unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Optics {
    pub focal_length: f64,
    pub aperture: f64,
}

impl Optics {
    pub fn new(focal_length: f64, aperture: f64) -> Self {
        Self {
            focal_length,
            aperture,
        }
    }
}

/// Update pushed by an external collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEvent {
    /// Mount position in the epoch of date
    TelescopeCoordinatesChanged { ra_hours: f64, dec_degrees: f64 },
    /// Mount position already expressed in J2000
    TelescopeJ2000CoordinatesChanged { ra_hours: f64, dec_degrees: f64 },
    PierSideChanged(PierSide),
    OpticsChanged { primary: Optics, guide: Optics },
    /// Geographic site; longitudes above 180 are folded to negative east
    SiteChanged { latitude: f64, longitude: f64 },
    RotatorAngleChanged(f64),
    FocuserPositionChanged(i64),
    FocuserTemperatureChanged(f64),
    /// 1-based filter wheel slot
    FilterSlotChanged(u32),
    FilterNamesChanged(Vec<String>),
    /// Sky brightness in magnitudes per square arcsecond
    SkyQualityChanged(f64),
    /// The active mount was cleared; its coordinates are no longer valid
    TelescopeCleared,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelescopeState {
    pub epoch: Option<Equatorial>,
    pub j2000: Option<Equatorial>,
    /// Set when `j2000` arrived since the last synthesis pass
    pub j2000_fresh: bool,
    pub pier_side: Option<PierSide>,
    pub primary: Optics,
    pub guide: Optics,
    pub site: Option<GeographicSite>,
    pub rotator_angle: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FocuserState {
    pub position: Option<i64>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterState {
    pub slot: Option<u32>,
    pub names: Vec<String>,
}

impl FilterState {
    /// Name of the current slot, if the wheel reported a name for it.
    pub fn current_name(&self) -> Option<&str> {
        let slot = self.slot?;
        let index = usize::try_from(slot).ok()?.checked_sub(1)?;
        self.names.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkyState {
    pub brightness: Option<f64>,
}

/// Read-only view of every externally supplied value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalSnapshot {
    pub telescope: TelescopeState,
    pub focuser: FocuserState,
    pub filter: FilterState,
    pub sky: SkyState,
}

impl ExternalSnapshot {
    pub fn apply(&mut self, event: ExternalEvent) {
        match event {
            ExternalEvent::TelescopeCoordinatesChanged {
                ra_hours,
                dec_degrees,
            } => match Equatorial::new(ra_hours, dec_degrees) {
                Ok(pos) => self.telescope.epoch = Some(pos),
                Err(e) => warn!("Ignoring telescope coordinates: {}", e),
            },
            ExternalEvent::TelescopeJ2000CoordinatesChanged {
                ra_hours,
                dec_degrees,
            } => match Equatorial::new(ra_hours, dec_degrees) {
                Ok(pos) => {
                    self.telescope.j2000 = Some(pos);
                    self.telescope.j2000_fresh = true;
                }
                Err(e) => warn!("Ignoring J2000 coordinates: {}", e),
            },
            ExternalEvent::PierSideChanged(side) => self.telescope.pier_side = Some(side),
            ExternalEvent::OpticsChanged { primary, guide } => {
                self.telescope.primary = primary;
                self.telescope.guide = guide;
            }
            ExternalEvent::SiteChanged {
                latitude,
                longitude,
            } => match GeographicSite::new(latitude, longitude) {
                Ok(site) => self.telescope.site = Some(site),
                Err(e) => warn!("Ignoring site location: {}", e),
            },
            ExternalEvent::RotatorAngleChanged(angle) => {
                self.telescope.rotator_angle = Some(angle)
            }
            ExternalEvent::FocuserPositionChanged(pos) => self.focuser.position = Some(pos),
            ExternalEvent::FocuserTemperatureChanged(t) => self.focuser.temperature = Some(t),
            ExternalEvent::FilterSlotChanged(slot) => self.filter.slot = Some(slot),
            ExternalEvent::FilterNamesChanged(names) => self.filter.names = names,
            ExternalEvent::SkyQualityChanged(mpsas) => self.sky.brightness = Some(mpsas),
            ExternalEvent::TelescopeCleared => {
                self.telescope.epoch = None;
                self.telescope.j2000 = None;
                self.telescope.j2000_fresh = false;
            }
        }
    }

    /// Copy for one frame. A J2000 position is only trusted for the frame
    /// immediately after it arrived; later frames recompute it from the
    /// epoch-of-date position.
    pub fn take_for_frame(&mut self) -> ExternalSnapshot {
        let snapshot = self.clone();
        self.telescope.j2000_fresh = false;
        snapshot
    }
}

/// Producer handle given to external collaborators.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<ExternalEvent>,
}

impl EventSender {
    /// Queue an event. Returns false once the device has gone away.
    pub fn send(&self, event: ExternalEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Consumer side of the external event channel.
#[derive(Debug)]
pub struct EventInbox {
    rx: Receiver<ExternalEvent>,
}

impl EventInbox {
    pub fn channel() -> (EventSender, EventInbox) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (EventSender { tx }, EventInbox { rx })
    }

    /// Apply every queued event in arrival order. Returns how many were applied.
    pub fn drain_into(&self, snapshot: &mut ExternalSnapshot) -> usize {
        let mut applied = 0;
        for event in self.rx.try_iter() {
            snapshot.apply(event);
            applied += 1;
        }
        if applied > 0 {
            debug!("Applied {} external updates", applied);
        }
        applied
    }
}
