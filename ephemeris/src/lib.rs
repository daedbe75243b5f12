//! Coordinate transforms for astrometric image metadata
//!
//! This crate converts telescope positions between the epoch-of-date frame
//! reported by mounts and the J2000 reference frame written into image
//! headers, and projects epoch-of-date positions onto the local horizon for
//! altitude, azimuth and airmass.
//!
//! All angles are in degrees except right ascension, which follows mount
//! convention and is expressed in hours.

pub mod celestial;
pub mod time;

pub use celestial::horizontal::{airmass, equatorial_to_horizontal};
pub use celestial::precession::{epoch_to_j2000, j2000_to_epoch};
pub use celestial::{Equatorial, GeographicSite, Horizontal};
pub use time::{julian_day, J2000_JD};

use thiserror::Error;

/// Errors raised when a transform is handed coordinates it cannot use.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EphemerisError {
    #[error("non-finite coordinate: {0}")]
    NonFinite(&'static str),

    #[error("declination {0} outside [-90, 90] degrees")]
    DeclinationOutOfRange(f64),

    #[error("latitude {0} outside [-90, 90] degrees")]
    LatitudeOutOfRange(f64),
}

pub type EphemerisResult<T> = Result<T, EphemerisError>;
