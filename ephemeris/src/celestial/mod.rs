//! Celestial coordinate types and transforms

pub mod horizontal;
pub mod precession;

use crate::{EphemerisError, EphemerisResult};

/// Equatorial position with right ascension in hours and declination in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equatorial {
    /// Right ascension in hours, [0, 24)
    pub ra_hours: f64,
    /// Declination in degrees, [-90, 90]
    pub dec_degrees: f64,
}

impl Equatorial {
    /// Create a position, normalising right ascension into [0, 24).
    pub fn new(ra_hours: f64, dec_degrees: f64) -> EphemerisResult<Self> {
        if !ra_hours.is_finite() {
            return Err(EphemerisError::NonFinite("right ascension"));
        }
        if !dec_degrees.is_finite() {
            return Err(EphemerisError::NonFinite("declination"));
        }
        if !(-90.0..=90.0).contains(&dec_degrees) {
            return Err(EphemerisError::DeclinationOutOfRange(dec_degrees));
        }
        Ok(Self {
            ra_hours: ra_hours.rem_euclid(24.0),
            dec_degrees,
        })
    }

    /// Right ascension in degrees.
    pub fn ra_degrees(&self) -> f64 {
        self.ra_hours * 15.0
    }
}

/// Horizontal position. Azimuth is measured from north through east.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Horizontal {
    pub azimuth_degrees: f64,
    pub altitude_degrees: f64,
}

/// Observing site. Longitude is east-positive in (-180, 180].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeographicSite {
    pub latitude_degrees: f64,
    pub longitude_degrees: f64,
}

impl GeographicSite {
    /// Create a site, folding longitudes given in [0, 360) onto (-180, 180].
    pub fn new(latitude_degrees: f64, longitude_degrees: f64) -> EphemerisResult<Self> {
        if !latitude_degrees.is_finite() || !longitude_degrees.is_finite() {
            return Err(EphemerisError::NonFinite("site"));
        }
        if !(-90.0..=90.0).contains(&latitude_degrees) {
            return Err(EphemerisError::LatitudeOutOfRange(latitude_degrees));
        }
        let longitude_degrees = if longitude_degrees > 180.0 {
            longitude_degrees - 360.0
        } else {
            longitude_degrees
        };
        Ok(Self {
            latitude_degrees,
            longitude_degrees,
        })
    }
}
