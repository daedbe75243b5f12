//! Equatorial to horizontal conversion and airmass

use super::{Equatorial, GeographicSite, Horizontal};
use crate::time::{centuries_since_j2000, J2000_JD};

/// Ratio of the Earth's radius to the atmosphere's scale height used for airmass.
pub const AIRMASS_SCALE: f64 = 750.0;

/// Greenwich mean sidereal time in degrees, [0, 360).
pub fn greenwich_mean_sidereal_time(jd: f64) -> f64 {
    let t = centuries_since_j2000(jd);
    let gmst = 280.460_618_37 + 360.985_647_366_29 * (jd - J2000_JD) + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    gmst.rem_euclid(360.0)
}

/// Project an epoch-of-date position onto the local horizon at `jd`.
pub fn equatorial_to_horizontal(pos: &Equatorial, site: &GeographicSite, jd: f64) -> Horizontal {
    let local_sidereal = greenwich_mean_sidereal_time(jd) + site.longitude_degrees;
    let hour_angle = (local_sidereal - pos.ra_degrees()).to_radians();
    let lat = site.latitude_degrees.to_radians();
    let dec = pos.dec_degrees.to_radians();

    let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * hour_angle.cos();
    let altitude = sin_alt.clamp(-1.0, 1.0).asin();

    // Measured from south, rotated to north-based azimuth below
    let south_azimuth = hour_angle
        .sin()
        .atan2(hour_angle.cos() * lat.sin() - dec.tan() * lat.cos());

    Horizontal {
        azimuth_degrees: (south_azimuth.to_degrees() + 180.0).rem_euclid(360.0),
        altitude_degrees: altitude.to_degrees(),
    }
}

/// Relative airmass for a homogeneous spherical atmosphere.
pub fn airmass(altitude_degrees: f64) -> f64 {
    airmass_with_scale(altitude_degrees, AIRMASS_SCALE)
}

/// Relative airmass with an explicit Earth radius to scale height ratio.
pub fn airmass_with_scale(altitude_degrees: f64, scale: f64) -> f64 {
    let a = scale * altitude_degrees.to_radians().sin();
    (a * a + 2.0 * scale + 1.0).sqrt() - a
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn naval_observatory() -> GeographicSite {
        let lat = 38.0 + 55.0 / 60.0 + 17.0 / 3600.0;
        let lon = -(77.0 + 3.0 / 60.0 + 56.0 / 3600.0);
        GeographicSite::new(lat, lon).unwrap()
    }

    #[test]
    fn test_sidereal_time() {
        // 1987 April 10, 19:21:00 UT: 8h34m57.09s mean sidereal time
        let gmst_hours = greenwich_mean_sidereal_time(2_446_896.306_25) / 15.0;
        assert_relative_eq!(gmst_hours, 8.582_525, epsilon = 1e-5);
    }

    #[test]
    fn test_venus_altitude_azimuth() {
        let venus = Equatorial::new(347.319_337_5 / 15.0, -6.719_891_7).unwrap();
        let hrz = equatorial_to_horizontal(&venus, &naval_observatory(), 2_446_896.306_25);
        assert_relative_eq!(hrz.altitude_degrees, 15.1249, epsilon = 0.01);
        assert_relative_eq!(hrz.azimuth_degrees, 248.0337, epsilon = 0.01);
    }

    #[test]
    fn test_airmass_at_zenith_is_one() {
        assert_relative_eq!(airmass(90.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_airmass_grows_towards_horizon() {
        assert_relative_eq!(airmass(30.0), 1.996, epsilon = 1e-3);
        assert_relative_eq!(airmass(0.0), 38.7427, epsilon = 1e-3);
        assert!(airmass(10.0) > airmass(20.0));
    }
}
