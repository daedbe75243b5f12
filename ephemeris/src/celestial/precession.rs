//! IAU 1976 precession between J2000.0 and the epoch of date
//!
//! Uses the Lieske angles (zeta, z, theta) and composes them into a single
//! rotation matrix `P = R3(-z) * R2(theta) * R3(-zeta)` acting on unit
//! vectors. The inverse transform is the transpose.

use nalgebra::{Matrix3, Vector3};

use super::Equatorial;
use crate::time::centuries_since_j2000;

const ARCSEC_TO_RAD: f64 = std::f64::consts::PI / (180.0 * 3600.0);

/// Frame rotation about the y axis in the IAU sign convention.
fn rotation_y(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(c, 0.0, -s, 0.0, 1.0, 0.0, s, 0.0, c)
}

fn rotation_z(angle: f64) -> Matrix3<f64> {
    let (s, c) = angle.sin_cos();
    Matrix3::new(c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0)
}

/// Precession matrix taking J2000 unit vectors to the epoch of `jd`.
pub fn precession_matrix(jd: f64) -> Matrix3<f64> {
    let t = centuries_since_j2000(jd);
    let t2 = t * t;
    let t3 = t2 * t;

    let zeta = (2306.2181 * t + 0.30188 * t2 + 0.017998 * t3) * ARCSEC_TO_RAD;
    let z = (2306.2181 * t + 1.09468 * t2 + 0.018203 * t3) * ARCSEC_TO_RAD;
    let theta = (2004.3109 * t - 0.42665 * t2 - 0.041833 * t3) * ARCSEC_TO_RAD;

    rotation_z(-z) * rotation_y(theta) * rotation_z(-zeta)
}

fn to_unit_vector(pos: &Equatorial) -> Vector3<f64> {
    let ra = pos.ra_degrees().to_radians();
    let dec = pos.dec_degrees.to_radians();
    Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
}

fn from_unit_vector(v: &Vector3<f64>) -> Equatorial {
    let ra_degrees = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
    let dec_degrees = v.z.clamp(-1.0, 1.0).asin().to_degrees();
    Equatorial {
        ra_hours: ra_degrees / 15.0,
        dec_degrees,
    }
}

/// Precess a J2000 position to the epoch of date.
pub fn j2000_to_epoch(pos: &Equatorial, jd: f64) -> Equatorial {
    from_unit_vector(&(precession_matrix(jd) * to_unit_vector(pos)))
}

/// Precess an epoch-of-date position back to J2000.
pub fn epoch_to_j2000(pos: &Equatorial, jd: f64) -> Equatorial {
    from_unit_vector(&(precession_matrix(jd).transpose() * to_unit_vector(pos)))
}
