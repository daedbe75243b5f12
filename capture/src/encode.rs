//! Frame encoding and optional lossless compression.
//!
//! The container path wraps pixels and header into a FITS file. The native
//! path hands the sensor buffer through untouched. Either result can then be
//! compressed at level 9: FITS files are gzipped whole (`.fits.gz`), which
//! FITS readers open directly, and anything else is zlib-deflated (`.<ext>.z`).

use std::borrow::Cow;
use std::io::Write;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::camera_interface::ImageGeometry;
use crate::error::{CaptureError, CaptureResult};
use crate::fits::{self, FitsHeader};

const FITS_EXTENSION: &str = "fits";
const NATIVE_EXTENSION: &str = "bin";

/// How frames are serialized before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncodeFormat {
    /// FITS container with the synthesized header
    #[default]
    Fits,
    /// Sensor buffer as-is
    Native,
}

/// Inputs for encoding one frame.
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub format: EncodeFormat,
    pub header: &'a FitsHeader,
    pub geometry: &'a ImageGeometry,
    /// Extension configured on the chip, without a leading dot
    pub extension: &'a str,
    pub pixels: &'a [u8],
}

impl EncodeRequest<'_> {
    /// Extension actually written. Native output never claims to be FITS.
    pub fn effective_extension(&self) -> &str {
        match self.format {
            EncodeFormat::Native if self.extension == FITS_EXTENSION => NATIVE_EXTENSION,
            _ => self.extension,
        }
    }
}

/// Encoded bytes plus the format string identifying them, e.g. `.fits.gz`.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload<'a> {
    pub bytes: Cow<'a, [u8]>,
    pub format: String,
}

impl Payload<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_owned(self) -> Payload<'static> {
        Payload {
            bytes: Cow::Owned(self.bytes.into_owned()),
            format: self.format,
        }
    }
}

/// Serialize a frame without compression.
pub fn encode<'a>(request: &EncodeRequest<'a>) -> CaptureResult<Payload<'a>> {
    let format = format!(".{}", request.effective_extension());
    let bytes = match request.format {
        EncodeFormat::Fits => {
            Cow::Owned(fits::write_image(request.header, request.geometry, request.pixels)?)
        }
        EncodeFormat::Native => Cow::Borrowed(request.pixels),
    };
    Ok(Payload { bytes, format })
}

/// Compress an already encoded frame.
pub fn compress(request: &EncodeRequest, encoded: &Payload) -> CaptureResult<Payload<'static>> {
    let extension = request.effective_extension();
    if request.format == EncodeFormat::Fits && extension == FITS_EXTENSION {
        return Ok(Payload {
            bytes: Cow::Owned(gzip(&encoded.bytes)?),
            format: format!(".{extension}.gz"),
        });
    }
    Ok(Payload {
        bytes: Cow::Owned(deflate(&encoded.bytes)?),
        format: format!(".{extension}.z"),
    })
}

/// gzip member at maximum compression.
pub fn gzip(data: &[u8]) -> CaptureResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::new(9));
    encoder
        .write_all(data)
        .map_err(|e| CaptureError::Encoding(format!("gzip compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| CaptureError::Encoding(format!("gzip compression failed: {e}")))
}

/// zlib stream at maximum compression.
pub fn deflate(data: &[u8]) -> CaptureResult<Vec<u8>> {
    let buffer = Vec::with_capacity(data.len() / 2 + 64);
    let mut encoder = ZlibEncoder::new(buffer, Compression::new(9));
    encoder
        .write_all(data)
        .map_err(|e| CaptureError::Encoding(format!("zlib compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| CaptureError::Encoding(format!("zlib compression failed: {e}")))
}
