//! FITS header model and primary image HDU serialization through `fitsio`.
//!
//! Samples arrive as little-endian unsigned integers and are widened to the
//! next signed type before writing, so 16-bit frames land as `Long` and
//! 32-bit frames as `LongLong` without any BZERO juggling.

use std::fmt;
use std::path::Path;

use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::images::{ImageDescription, ImageType, WriteImage};
use tracing::trace;

use crate::camera_interface::ImageGeometry;
use crate::error::{CaptureError, CaptureResult};

/// Keywords owned by the image writer. User headers may not override them.
pub const RESERVED_KEYS: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "EXTEND", "BZERO", "BSCALE", "END",
];

/// Value carried by a keyword.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl HeaderValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Int(v) => Some(*v as f64),
            HeaderValue::Float(v) => Some(*v),
            HeaderValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            HeaderValue::Int(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v:E}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCard {
    pub key: String,
    pub value: HeaderValue,
    pub comment: String,
}

/// Ordered collection of keywords with update-in-place semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    cards: Vec<HeaderCard>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `key`, keeping its place in the order.
    pub fn set(&mut self, key: &str, value: HeaderValue, comment: &str) {
        debug_assert!(key.len() <= 8, "FITS keyword too long: {key}");
        let card = HeaderCard {
            key: key.to_string(),
            value,
            comment: comment.to_string(),
        };
        match self.cards.iter_mut().find(|c| c.key == key) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str, comment: &str) {
        self.set(key, HeaderValue::Str(value.to_string()), comment);
    }

    pub fn set_int(&mut self, key: &str, value: i64, comment: &str) {
        self.set(key, HeaderValue::Int(value), comment);
    }

    pub fn set_float(&mut self, key: &str, value: f64, comment: &str) {
        self.set(key, HeaderValue::Float(value), comment);
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.cards.iter().find(|c| c.key == key).map(|c| &c.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cards.iter().map(|c| c.key.as_str())
    }

    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

fn check_geometry(geometry: &ImageGeometry, pixels: &[u8]) -> CaptureResult<()> {
    if !matches!(geometry.bits_per_pixel, 8 | 16 | 32) {
        return Err(CaptureError::UnsupportedBitDepth(geometry.bits_per_pixel));
    }
    if pixels.len() != geometry.byte_len() {
        return Err(CaptureError::Encoding(format!(
            "buffer holds {} bytes but a {}x{}x{} frame at {} bits needs {}",
            pixels.len(),
            geometry.width,
            geometry.height,
            geometry.planes,
            geometry.bits_per_pixel,
            geometry.byte_len()
        )));
    }
    Ok(())
}

fn dimensions(geometry: &ImageGeometry) -> Vec<usize> {
    let mut dims = vec![geometry.width as usize, geometry.height as usize];
    if geometry.planes > 1 {
        dims.push(geometry.planes as usize);
    }
    dims
}

/// Write `header` and `pixels` as the primary HDU of a new file at `path`.
pub fn write_image_file(
    path: &Path,
    header: &FitsHeader,
    geometry: &ImageGeometry,
    pixels: &[u8],
) -> CaptureResult<()> {
    check_geometry(geometry, pixels)?;

    let data_type = match geometry.bits_per_pixel {
        8 => ImageType::UnsignedByte,
        16 => ImageType::Long,
        _ => ImageType::LongLong,
    };
    let description = ImageDescription {
        data_type,
        dimensions: dimensions(geometry),
    };

    let mut fptr = FitsFile::create(path).overwrite().open()?;
    let hdu = fptr.create_image("PRIMARY", &description)?;

    match geometry.bits_per_pixel {
        8 => u8::write_image(&mut fptr, &hdu, pixels)?,
        16 => {
            let data: Vec<i32> = pixels
                .chunks_exact(2)
                .map(|c| i32::from(u16::from_le_bytes([c[0], c[1]])))
                .collect();
            i32::write_image(&mut fptr, &hdu, &data)?
        }
        _ => {
            let data: Vec<i64> = pixels
                .chunks_exact(4)
                .map(|c| i64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect();
            i64::write_image(&mut fptr, &hdu, &data)?
        }
    };

    for card in header.cards() {
        if RESERVED_KEYS.contains(&card.key.as_str()) {
            continue;
        }
        trace!("{} = {} / {}", card.key, card.value, card.comment);
        match &card.value {
            HeaderValue::Str(value) => hdu.write_key(&mut fptr, &card.key, value)?,
            HeaderValue::Int(value) => hdu.write_key(&mut fptr, &card.key, value)?,
            HeaderValue::Float(value) => hdu.write_key(&mut fptr, &card.key, value)?,
        }
    }
    Ok(())
}

/// Serialize to an in-memory FITS file.
pub fn write_image(
    header: &FitsHeader,
    geometry: &ImageGeometry,
    pixels: &[u8],
) -> CaptureResult<Vec<u8>> {
    let scratch = tempfile::tempdir().map_err(|e| CaptureError::io("creating FITS scratch", e))?;
    let path = scratch.path().join("frame.fits");
    write_image_file(&path, header, geometry, pixels)?;
    std::fs::read(&path).map_err(|e| CaptureError::io(format!("reading {}", path.display()), e))
}
