//! File naming and client delivery through the public delivery API

use capture::camera_interface::{ChipKind, ImageGeometry};
use capture::delivery::{self, BlobChannel, UploadMode, UploadSettings};
use capture::encode::{EncodeFormat, EncodeRequest};
use capture::fits::FitsHeader;
use fitsio::compat::fitsfile::FitsFile;
use tempfile::TempDir;

fn geometry() -> ImageGeometry {
    ImageGeometry {
        width: 16,
        height: 8,
        planes: 1,
        bits_per_pixel: 16,
    }
}

fn settings(dir: &TempDir, mode: UploadMode) -> UploadSettings {
    UploadSettings {
        mode,
        directory: dir.path().to_path_buf(),
        prefix: "IMAGE_XXX".to_string(),
    }
}

#[test]
fn test_saves_are_numbered_sequentially() {
    let dir = TempDir::new().unwrap();
    let geometry = geometry();
    let pixels = vec![3u8; geometry.byte_len()];
    let mut header = FitsHeader::new();
    header.set_str("OBJECT", "M42", "Object name");
    let request = EncodeRequest {
        format: EncodeFormat::Fits,
        header: &header,
        geometry: &geometry,
        extension: "fits",
        pixels: &pixels,
    };
    let sink = BlobChannel::new();
    let upload = settings(&dir, UploadMode::Local);

    let first = delivery::deliver(ChipKind::Primary, &request, false, &upload, &sink).unwrap();
    let second = delivery::deliver(ChipKind::Primary, &request, false, &upload, &sink).unwrap();

    assert_eq!(first.saved_path, Some(dir.path().join("IMAGE_001.fits")));
    assert_eq!(second.saved_path, Some(dir.path().join("IMAGE_002.fits")));
    assert_eq!(first.sent_format, None);

    let fptr = FitsFile::open(dir.path().join("IMAGE_002.fits")).unwrap();
    let hdu = fptr.hdu(0).unwrap();
    assert_eq!(hdu.read_key::<i64>(&fptr, "NAXIS1").unwrap(), 16);
    assert_eq!(hdu.read_key::<String>(&fptr, "OBJECT").unwrap().trim_end(), "M42");
}

#[test]
fn test_compressed_send_keeps_local_copy_plain() {
    let dir = TempDir::new().unwrap();
    let geometry = geometry();
    let pixels: Vec<u8> = (0..geometry.byte_len()).map(|i| (i % 7) as u8).collect();
    let header = FitsHeader::new();
    let request = EncodeRequest {
        format: EncodeFormat::Fits,
        header: &header,
        geometry: &geometry,
        extension: "fits",
        pixels: &pixels,
    };
    let sink = BlobChannel::new();
    let rx = sink.subscribe();
    let upload = settings(&dir, UploadMode::Both);

    let report = delivery::deliver(ChipKind::Guide, &request, true, &upload, &sink).unwrap();
    assert_eq!(report.saved_path, Some(dir.path().join("IMAGE_001.fits")));
    assert_eq!(report.sent_format.as_deref(), Some(".fits.gz"));

    let blob = rx.try_recv().unwrap();
    assert_eq!(blob.chip, ChipKind::Guide);
    assert_eq!(blob.format, ".fits.gz");
    let saved = std::fs::read(dir.path().join("IMAGE_001.fits")).unwrap();
    assert_ne!(saved.as_slice(), &blob.bytes[..]);
}

#[test]
fn test_empty_frame_is_skipped() {
    let dir = TempDir::new().unwrap();
    let geometry = geometry();
    let header = FitsHeader::new();
    let request = EncodeRequest {
        format: EncodeFormat::Fits,
        header: &header,
        geometry: &geometry,
        extension: "fits",
        pixels: &[],
    };
    let sink = BlobChannel::new();
    let rx = sink.subscribe();
    let upload = settings(&dir, UploadMode::Both);

    let report = delivery::deliver(ChipKind::Primary, &request, false, &upload, &sink).unwrap();
    assert!(report.skipped_empty);
    assert!(rx.try_recv().is_err());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
