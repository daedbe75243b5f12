//! Instrument and astrometric header synthesis for one captured frame.
//!
//! Inputs are the frame description copied out of the chip, persistent
//! header settings and the external snapshot drained from the event inbox.
//! Any missing optical or positional input drops only the keywords that
//! depend on it.

use ephemeris::{
    airmass, epoch_to_j2000, equatorial_to_horizontal, j2000_to_epoch, Equatorial,
    GeographicSite, Horizontal,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::camera_interface::{FrameInfo, FrameKind, ImageGeometry};
use crate::external::{ExternalSnapshot, Optics, PierSide, TelescopeState};
use crate::fits::FitsHeader;

/// Arcseconds per radian divided by the micron/millimetre ratio
pub const PLATE_SCALE_FACTOR: f64 = 206.3;

const GENERATOR: &str = concat!("Generated by ", env!("CARGO_PKG_NAME"));

/// Which optical train feeds the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TelescopeType {
    #[default]
    Primary,
    Guide,
}

/// Color filter array layout of a one-shot color sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BayerInfo {
    pub x_offset: i64,
    pub y_offset: i64,
    /// e.g. "RGGB"
    pub pattern: String,
}

/// Operator-controlled header content.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderSettings {
    pub device_name: String,
    pub telescope_name: Option<String>,
    pub telescope_type: TelescopeType,
    pub observer: String,
    pub object: String,
    pub bayer: Option<BayerInfo>,
    pub include_min_max: bool,
    pub wcs_enabled: bool,
    /// Sensor rotation in degrees, clockwise. `None` until one is reported.
    pub ccd_rotation: Option<f64>,
}

impl Default for HeaderSettings {
    fn default() -> Self {
        Self {
            device_name: "CCD Simulator".to_string(),
            telescope_name: None,
            telescope_type: TelescopeType::Primary,
            observer: "Unknown".to_string(),
            object: "Unknown".to_string(),
            bayer: None,
            include_min_max: false,
            wcs_enabled: false,
            ccd_rotation: None,
        }
    }
}

/// Everything the synthesizer reads for one frame.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub frame: &'a FrameInfo,
    pub settings: &'a HeaderSettings,
    pub external: &'a ExternalSnapshot,
    /// Reported when the camera has a cooler
    pub ccd_temperature: Option<f64>,
    pub pixels: &'a [u8],
}

/// Focal length and aperture of the active optical train, each only when known.
pub fn effective_optics(
    telescope: &TelescopeState,
    active: TelescopeType,
) -> (Option<f64>, Option<f64>) {
    let optics: Optics = match active {
        TelescopeType::Primary => telescope.primary,
        TelescopeType::Guide => telescope.guide,
    };
    let positive = |v: f64| (v > 0.0 && v.is_finite()).then_some(v);
    (positive(optics.focal_length), positive(optics.aperture))
}

/// Arcseconds per binned pixel.
pub fn plate_scale(pixel_size_um: f64, focal_length_mm: f64, binning: u32) -> f64 {
    pixel_size_um / focal_length_mm * PLATE_SCALE_FACTOR * f64::from(binning)
}

/// J2000 position to record for this frame.
///
/// A J2000 position pushed by the mount is only used on the first frame
/// after it arrived. Otherwise the epoch-of-date position, when known, is
/// precessed so a stale J2000 value never outlives a mount slew.
pub fn resolve_j2000(telescope: &TelescopeState, jd: f64) -> Option<Equatorial> {
    match (telescope.epoch, telescope.j2000) {
        (Some(epoch), j2000) if j2000.is_none() || !telescope.j2000_fresh => {
            Some(epoch_to_j2000(&epoch, jd))
        }
        (_, j2000) => j2000,
    }
}

/// Horizontal position and airmass of a J2000 position seen from `site`.
pub fn horizontal_position(
    j2000: &Equatorial,
    site: &GeographicSite,
    jd: f64,
) -> (Horizontal, f64) {
    let observed = j2000_to_epoch(j2000, jd);
    let horizontal = equatorial_to_horizontal(&observed, site, jd);
    (horizontal, airmass(horizontal.altitude_degrees))
}

/// `DD MM SS.ss` rendering with hundredths of a second, sign kept on the
/// leading field even when it rounds to zero.
pub fn sexagesimal(value: f64) -> String {
    const FRACBASE: u64 = 360_000;
    let n = (value.abs() * FRACBASE as f64).round() as u64;
    let whole = n / FRACBASE;
    let frac = n % FRACBASE;
    let lead = if value < 0.0 {
        format!("-{whole}")
    } else {
        whole.to_string()
    };
    format!(
        "{lead:>2} {:02} {:02}.{:02}",
        frac / 6000,
        (frac % 6000) / 100,
        frac % 100
    )
}

/// Minimum and maximum sample value of a frame.
pub fn min_max(geometry: &ImageGeometry, pixels: &[u8]) -> Option<(u32, u32)> {
    let bytes = geometry.bytes_per_sample();
    if bytes == 0 || pixels.len() < bytes {
        return None;
    }
    pixels
        .chunks_exact(bytes)
        .map(|c| {
            let mut word = [0u8; 4];
            word[..bytes].copy_from_slice(c);
            u32::from_le_bytes(word)
        })
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// World coordinate system parameters for a tangent-plane projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WcsSolution {
    pub crval1: f64,
    pub crval2: f64,
    pub crpix1: f64,
    pub crpix2: f64,
    pub secpix1: f64,
    pub secpix2: f64,
    pub cdelt1: f64,
    pub cdelt2: f64,
    /// Counter-clockwise rotation in [0, 360)
    pub crota: f64,
}

impl WcsSolution {
    pub fn derive(frame: &FrameInfo, j2000: &Equatorial, focal_length: f64, rotation: f64) -> Self {
        let (px, py) = frame.pixel_size;
        let secpix1 = plate_scale(px, focal_length, frame.binning.x);
        let secpix2 = plate_scale(py, focal_length, frame.binning.y);
        Self {
            crval1: j2000.ra_degrees(),
            crval2: j2000.dec_degrees,
            crpix1: f64::from(frame.roi.width / frame.binning.x) / 2.0,
            crpix2: f64::from(frame.roi.height / frame.binning.y) / 2.0,
            secpix1,
            secpix2,
            cdelt1: secpix1 / 3600.0,
            cdelt2: secpix2 / 3600.0,
            // Sensor rotation is clockwise, CROTA is counter-clockwise
            crota: (360.0 - rotation).rem_euclid(360.0),
        }
    }

    fn write(&self, header: &mut FitsHeader) {
        header.set_float("CRVAL1", self.crval1, "Reference RA (degrees)");
        header.set_float("CRVAL2", self.crval2, "Reference DEC (degrees)");
        header.set_str("RADECSYS", "FK5", "Reference frame");
        header.set_str("CTYPE1", "RA---TAN", "Gnomonic projection");
        header.set_str("CTYPE2", "DEC--TAN", "Gnomonic projection");
        header.set_float("CRPIX1", self.crpix1, "Reference pixel 1");
        header.set_float("CRPIX2", self.crpix2, "Reference pixel 2");
        header.set_float("SECPIX1", self.secpix1, "arcsecs per pixel 1");
        header.set_float("SECPIX2", self.secpix2, "arcsecs per pixel 2");
        header.set_float("CDELT1", self.cdelt1, "degrees per pixel 1");
        header.set_float("CDELT2", self.cdelt2, "degrees per pixel 2");
        header.set_float("CROTA1", self.crota, "Rotation angle 1");
        header.set_float("CROTA2", self.crota, "Rotation angle 2");
    }
}

/// Build the header for one frame. `jd` is the Julian day used for every
/// coordinate transform in this pass.
pub fn synthesize(input: &SynthesisInput, jd: f64) -> FitsHeader {
    let frame = input.frame;
    let settings = input.settings;
    let telescope = &input.external.telescope;
    let mut header = FitsHeader::new();

    header.set_str("ROWORDER", "TOP-DOWN", "Row Order");
    header.set_str("INSTRUME", &settings.device_name, "CCD Name");
    if let Some(name) = settings.telescope_name.as_deref().filter(|n| !n.is_empty()) {
        header.set_str("TELESCOP", name, "Telescope name");
    }

    let (focal_length, aperture) = effective_optics(telescope, settings.telescope_type);
    if focal_length.is_none() {
        warn!("Telescope focal length is missing.");
    }
    if aperture.is_none() {
        warn!("Telescope aperture is missing.");
    }

    header.set_str("OBSERVER", &settings.observer, "Observer name");
    header.set_str("OBJECT", &settings.object, "Object name");

    header.set_float("EXPTIME", frame.exposure_duration, "Total Exposure Time (s)");
    if frame.frame_kind == FrameKind::Dark {
        header.set_float("DARKTIME", frame.exposure_duration, "Total Dark Exposure Time (s)");
    }
    if let Some(t) = input.ccd_temperature {
        header.set_float("CCD-TEMP", t, "CCD Temperature (Celsius)");
    }

    let (px, py) = frame.pixel_size;
    header.set_float("PIXSIZE1", px, "Pixel Size 1 (microns)");
    header.set_float("PIXSIZE2", py, "Pixel Size 2 (microns)");
    header.set_int("XBINNING", i64::from(frame.binning.x), "Binning factor in width");
    header.set_int("YBINNING", i64::from(frame.binning.y), "Binning factor in height");
    header.set_float("XPIXSZ", px * f64::from(frame.binning.x), "X binned pixel size in microns");
    header.set_float("YPIXSZ", py * f64::from(frame.binning.y), "Y binned pixel size in microns");
    header.set_str("FRAME", frame.frame_kind.label(), "Frame Type");
    header.set_str("IMAGETYP", frame.frame_kind.image_type(), "Frame Type");

    if let Some(filter) = input.external.filter.current_name() {
        header.set_str("FILTER", filter, "Filter");
    }

    let two_axis = frame.geometry.n_axis() == 2;
    if settings.include_min_max && two_axis {
        if let Some((lo, hi)) = min_max(&frame.geometry, input.pixels) {
            header.set_float("DATAMIN", f64::from(lo), "Minimum value");
            header.set_float("DATAMAX", f64::from(hi), "Maximum value");
        }
    }
    if let Some(bayer) = settings.bayer.as_ref().filter(|_| two_axis) {
        header.set_int("XBAYROFF", bayer.x_offset, "X offset of Bayer array");
        header.set_int("YBAYROFF", bayer.y_offset, "Y offset of Bayer array");
        header.set_str("BAYERPAT", &bayer.pattern, "Bayer color pattern");
    }

    if let Some(fl) = focal_length {
        header.set_float("FOCALLEN", fl, "Focal Length (mm)");
    }
    if let Some(ap) = aperture {
        header.set_float("APTDIA", ap, "Telescope diameter (mm)");
    }
    if let Some(mpsas) = input.external.sky.brightness {
        header.set_float("MPSAS", mpsas, "Sky Quality (mag per arcsec^2)");
    }
    if let Some(angle) = telescope.rotator_angle {
        header.set_float("ROTATANG", angle, "Rotator angle in degrees");
    }
    if let Some(pos) = input.external.focuser.position {
        header.set_int("FOCUSPOS", pos, "Focus position in steps");
    }
    if let Some(temp) = input.external.focuser.temperature {
        header.set_float("FOCUSTEM", temp, "Focuser temperature in degrees C");
    }
    if let Some(fl) = focal_length {
        header.set_float("SCALE", plate_scale(px, fl, frame.binning.x), "arcsecs per pixel");
    }

    if frame.frame_kind == FrameKind::Light {
        if let Some(j2000) = resolve_j2000(telescope, jd) {
            write_pointing(&mut header, input, &j2000, focal_length, jd);
        }
    }

    if let Some(start) = &frame.exposure_start {
        header.set_str("DATE-OBS", start, "UTC start date of observation");
    }
    header.set_str("CREATOR", GENERATOR, "Software that created this file");
    header
}

fn write_pointing(
    header: &mut FitsHeader,
    input: &SynthesisInput,
    j2000: &Equatorial,
    focal_length: Option<f64>,
    jd: f64,
) {
    let telescope = &input.external.telescope;

    if let Some(site) = &telescope.site {
        header.set_float(
            "SITELAT",
            site.latitude_degrees,
            "Latitude of the imaging site in degrees",
        );
        header.set_float(
            "SITELONG",
            site.longitude_degrees,
            "Longitude of the imaging site in degrees",
        );
        let (horizontal, airmass) = horizontal_position(j2000, site, jd);
        header.set_float("AIRMASS", airmass, "Airmass");
        header.set_float(
            "OBJCTAZ",
            horizontal.azimuth_degrees,
            "Azimuth of center of image in Degrees",
        );
        header.set_float(
            "OBJCTALT",
            horizontal.altitude_degrees,
            "Altitude of center of image in Degrees",
        );
    }

    header.set_str("OBJCTRA", &sexagesimal(j2000.ra_hours), "Object J2000 RA in Hours");
    header.set_str(
        "OBJCTDEC",
        &sexagesimal(j2000.dec_degrees),
        "Object J2000 DEC in Degrees",
    );
    header.set_float("RA", j2000.ra_degrees(), "Object J2000 RA in Degrees");
    header.set_float("DEC", j2000.dec_degrees, "Object J2000 DEC in Degrees");

    match telescope.pier_side {
        Some(PierSide::West) => header.set_str("PIERSIDE", "WEST", "West, looking East"),
        Some(PierSide::East) => header.set_str("PIERSIDE", "EAST", "East, looking West"),
        None => {}
    }
    header.set_int("EQUINOX", 2000, "Equinox");

    let settings = input.settings;
    if let (true, Some(rotation), Some(fl)) =
        (settings.wcs_enabled, settings.ccd_rotation, focal_length)
    {
        WcsSolution::derive(input.frame, j2000, fl, rotation).write(header);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::{Binning, ChipKind, Roi};
    use crate::external::{ExternalEvent, FilterState};
    use approx::assert_relative_eq;
    use ephemeris::J2000_JD;

    fn frame() -> FrameInfo {
        FrameInfo {
            kind: ChipKind::Primary,
            roi: Roi::new(0, 0, 1000, 800),
            binning: Binning { x: 2, y: 2 },
            geometry: ImageGeometry {
                width: 500,
                height: 400,
                planes: 1,
                bits_per_pixel: 16,
            },
            pixel_size: (5.2, 5.2),
            frame_kind: FrameKind::Light,
            exposure_duration: 2.0,
            exposure_start: Some("2026-03-01T21:04:05.250".to_string()),
            image_extension: "fits".to_string(),
            compressed: false,
        }
    }

    fn external() -> ExternalSnapshot {
        let mut snapshot = ExternalSnapshot::default();
        snapshot.apply(ExternalEvent::OpticsChanged {
            primary: Optics::new(1000.0, 200.0),
            guide: Optics::new(240.0, 60.0),
        });
        snapshot.apply(ExternalEvent::TelescopeCoordinatesChanged {
            ra_hours: 5.5,
            dec_degrees: -5.4,
        });
        snapshot
    }

    fn float(header: &FitsHeader, key: &str) -> f64 {
        header.get(key).and_then(|v| v.as_f64()).unwrap()
    }

    fn synthesize_with(settings: &HeaderSettings, external: &ExternalSnapshot) -> FitsHeader {
        let frame = frame();
        synthesize(
            &SynthesisInput {
                frame: &frame,
                settings,
                external,
                ccd_temperature: Some(-10.0),
                pixels: &[],
            },
            J2000_JD,
        )
    }

    #[test]
    fn test_plate_scale() {
        assert_relative_eq!(plate_scale(5.2, 1000.0, 2), 2.14552, epsilon = 1e-9);
    }

    #[test]
    fn test_optics_follow_active_telescope() {
        let snapshot = external();
        assert_eq!(
            effective_optics(&snapshot.telescope, TelescopeType::Primary),
            (Some(1000.0), Some(200.0))
        );
        assert_eq!(
            effective_optics(&snapshot.telescope, TelescopeType::Guide),
            (Some(240.0), Some(60.0))
        );
        assert_eq!(
            effective_optics(&TelescopeState::default(), TelescopeType::Primary),
            (None, None)
        );
    }

    #[test]
    fn test_sexagesimal() {
        assert_eq!(sexagesimal(2.5), " 2 30 00.00");
        assert_eq!(sexagesimal(41.547214), "41 32 49.97");
        assert_eq!(sexagesimal(-5.4), "-5 24 00.00");
        assert_eq!(sexagesimal(-0.5), "-0 30 00.00");
    }

    #[test]
    fn test_fresh_j2000_wins_once() {
        let mut telescope = external().telescope;
        let pushed = Equatorial::new(1.0, 10.0).unwrap();
        telescope.j2000 = Some(pushed);
        telescope.j2000_fresh = true;
        assert_eq!(resolve_j2000(&telescope, J2000_JD), Some(pushed));

        // Stale: recomputed from the epoch position, which at J2000 is identity
        telescope.j2000_fresh = false;
        let resolved = resolve_j2000(&telescope, J2000_JD).unwrap();
        assert_relative_eq!(resolved.ra_hours, 5.5, epsilon = 1e-9);
        assert_relative_eq!(resolved.dec_degrees, -5.4, epsilon = 1e-9);

        // Without an epoch position the stored value is all there is
        telescope.epoch = None;
        assert_eq!(resolve_j2000(&telescope, J2000_JD), Some(pushed));
    }

    #[test]
    fn test_keyword_order() {
        let header = synthesize_with(&HeaderSettings::default(), &external());
        let keys: Vec<&str> = header.keys().collect();
        assert_eq!(
            keys,
            vec![
                "ROWORDER", "INSTRUME", "OBSERVER", "OBJECT", "EXPTIME", "CCD-TEMP", "PIXSIZE1",
                "PIXSIZE2", "XBINNING", "YBINNING", "XPIXSZ", "YPIXSZ", "FRAME", "IMAGETYP",
                "FOCALLEN", "APTDIA", "SCALE", "OBJCTRA", "OBJCTDEC", "RA", "DEC", "EQUINOX",
                "DATE-OBS", "CREATOR",
            ]
        );
        assert_eq!(
            header.get("OBJCTDEC").and_then(|v| v.as_str()),
            Some("-5 24 00.00")
        );
        assert_relative_eq!(float(&header, "RA"), 82.5, epsilon = 1e-9);
        assert_relative_eq!(float(&header, "XPIXSZ"), 10.4, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_optics_omit_dependent_fields() {
        let mut snapshot = external();
        snapshot.telescope.primary = Optics::default();
        let settings = HeaderSettings {
            wcs_enabled: true,
            ccd_rotation: Some(10.0),
            ..Default::default()
        };
        let header = synthesize_with(&settings, &snapshot);
        for key in ["FOCALLEN", "APTDIA", "SCALE", "CRVAL1"] {
            assert!(!header.contains(key), "{key} should be omitted");
        }
        assert!(header.contains("RA"));
    }

    #[test]
    fn test_site_adds_horizontal_fields() {
        let mut snapshot = external();
        snapshot.apply(ExternalEvent::SiteChanged {
            latitude: 38.9,
            longitude: 282.9,
        });
        snapshot.apply(ExternalEvent::PierSideChanged(PierSide::West));
        let header = synthesize_with(&HeaderSettings::default(), &snapshot);
        assert_relative_eq!(float(&header, "SITELONG"), -77.1, epsilon = 1e-9);
        let altitude = float(&header, "OBJCTALT");
        let expected = airmass(altitude);
        assert_relative_eq!(float(&header, "AIRMASS"), expected, epsilon = 1e-12);
        assert_eq!(header.get("PIERSIDE").and_then(|v| v.as_str()), Some("WEST"));
    }

    #[test]
    fn test_non_light_frames_skip_pointing() {
        let mut frame = frame();
        frame.frame_kind = FrameKind::Dark;
        let settings = HeaderSettings::default();
        let snapshot = external();
        let header = synthesize(
            &SynthesisInput {
                frame: &frame,
                settings: &settings,
                external: &snapshot,
                ccd_temperature: None,
                pixels: &[],
            },
            J2000_JD,
        );
        assert!(header.contains("DARKTIME"));
        assert!(!header.contains("OBJCTRA"));
        assert!(!header.contains("CCD-TEMP"));
        assert_eq!(header.get("FRAME").and_then(|v| v.as_str()), Some("Dark"));
    }

    #[test]
    fn test_wcs_block() {
        let settings = HeaderSettings {
            wcs_enabled: true,
            ccd_rotation: Some(90.0),
            ..Default::default()
        };
        let header = synthesize_with(&settings, &external());
        assert_relative_eq!(float(&header, "CRVAL1"), 82.5, epsilon = 1e-9);
        assert_relative_eq!(float(&header, "CRPIX1"), 250.0);
        assert_relative_eq!(float(&header, "CRPIX2"), 200.0);
        assert_relative_eq!(float(&header, "SECPIX1"), 2.14552, epsilon = 1e-9);
        assert_relative_eq!(float(&header, "CDELT1"), 2.14552 / 3600.0, epsilon = 1e-12);
        assert_relative_eq!(float(&header, "CROTA1"), 270.0);
        assert_eq!(header.get("CTYPE1").and_then(|v| v.as_str()), Some("RA---TAN"));

        // Rotation never reported: no WCS block
        let unrotated = HeaderSettings {
            ccd_rotation: None,
            ..settings
        };
        let header = synthesize_with(&unrotated, &external());
        assert!(!header.contains("CRVAL1"));
    }

    #[test]
    fn test_zero_rotation_wraps() {
        let frame = frame();
        let pos = Equatorial::new(0.0, 0.0).unwrap();
        assert_eq!(WcsSolution::derive(&frame, &pos, 500.0, 0.0).crota, 0.0);
    }

    #[test]
    fn test_filter_min_max_and_bayer() {
        let mut snapshot = external();
        snapshot.filter = FilterState {
            slot: Some(2),
            names: vec!["Red".into(), "Green".into()],
        };
        let settings = HeaderSettings {
            include_min_max: true,
            bayer: Some(BayerInfo {
                x_offset: 0,
                y_offset: 1,
                pattern: "RGGB".into(),
            }),
            ..Default::default()
        };
        let mut frame = frame();
        frame.geometry = ImageGeometry {
            width: 2,
            height: 2,
            planes: 1,
            bits_per_pixel: 16,
        };
        let pixels: Vec<u8> = [300u16, 7, 65535, 1000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let header = synthesize(
            &SynthesisInput {
                frame: &frame,
                settings: &settings,
                external: &snapshot,
                ccd_temperature: None,
                pixels: &pixels,
            },
            J2000_JD,
        );
        assert_eq!(header.get("FILTER").and_then(|v| v.as_str()), Some("Green"));
        assert_eq!(float(&header, "DATAMIN"), 7.0);
        assert_eq!(float(&header, "DATAMAX"), 65535.0);
        assert_eq!(header.get("BAYERPAT").and_then(|v| v.as_str()), Some("RGGB"));
    }
}
