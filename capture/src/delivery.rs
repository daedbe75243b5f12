//! Local persistence and client transmission of encoded frames.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::camera_interface::ChipKind;
use crate::encode::{self, EncodeRequest, Payload};
use crate::error::{CaptureError, CaptureResult};

/// Placeholder replaced by the local capture time.
pub const TIMESTAMP_PLACEHOLDER: &str = "ISO8601";
/// Placeholder replaced by the zero-padded file index.
pub const INDEX_PLACEHOLDER: &str = "XXX";

/// Where finished frames go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UploadMode {
    #[default]
    Client,
    Local,
    Both,
}

impl UploadMode {
    pub fn sends_to_client(&self) -> bool {
        matches!(self, UploadMode::Client | UploadMode::Both)
    }

    pub fn saves_locally(&self) -> bool {
        matches!(self, UploadMode::Local | UploadMode::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSettings {
    pub mode: UploadMode,
    pub directory: PathBuf,
    /// File name template, e.g. `IMAGE_XXX` or `M31_ISO8601_XXX`
    pub prefix: String,
}

impl Default for UploadSettings {
    fn default() -> Self {
        let directory = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            mode: UploadMode::Client,
            directory,
            prefix: format!("IMAGE_{INDEX_PLACEHOLDER}"),
        }
    }
}

/// Next free file index for `prefix` in `dir`.
///
/// Scans for entries containing the prefix stem (placeholders removed) and
/// returns one past the largest numeric suffix. The directory is created
/// when it does not exist yet.
pub fn file_index(dir: &Path, prefix: &str) -> CaptureResult<u32> {
    if !dir.exists() {
        debug!("Creating directory {}...", dir.display());
        fs::create_dir_all(dir)
            .map_err(|e| CaptureError::io(format!("creating directory {}", dir.display()), e))?;
    }

    let stem = prefix
        .replace(&format!("_{TIMESTAMP_PLACEHOLDER}"), "")
        .replace(&format!("_{INDEX_PLACEHOLDER}"), "");

    let entries = fs::read_dir(dir)
        .map_err(|e| CaptureError::io(format!("reading directory {}", dir.display()), e))?;

    let mut max_index = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.contains(&stem) {
            continue;
        }
        if let Some(index) = numeric_suffix(name) {
            max_index = max_index.max(index);
        }
    }
    max_index.checked_add(1).ok_or_else(|| {
        CaptureError::rejected(format!(
            "file index for prefix {prefix} in {} is exhausted",
            dir.display()
        ))
    })
}

/// Leading digits after the last underscore: `IMAGE_012.fits` gives 12.
fn numeric_suffix(name: &str) -> Option<u32> {
    let (_, tail) = name.rsplit_once('_')?;
    let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Expand the prefix template into a file name.
pub fn expand_prefix(prefix: &str, index: u32, now: DateTime<Local>) -> String {
    let timestamp = now.format("%Y-%m-%dT%H-%M-%S").to_string();
    prefix
        .replace(TIMESTAMP_PLACEHOLDER, &timestamp)
        .replace(INDEX_PLACEHOLDER, &format!("{index:03}"))
}

/// Destination for the next local save. `format` carries its leading dot.
pub fn resolve_path(settings: &UploadSettings, format: &str) -> CaptureResult<PathBuf> {
    let index = file_index(&settings.directory, &settings.prefix)?;
    let name = expand_prefix(&settings.prefix, index, Local::now());
    Ok(settings.directory.join(format!("{name}{format}")))
}

/// Write a payload to the next free path and return that path.
pub fn save_local(settings: &UploadSettings, payload: &Payload) -> CaptureResult<PathBuf> {
    let path = resolve_path(settings, &payload.format)?;
    fs::write(&path, &payload.bytes)
        .map_err(|e| CaptureError::io(format!("saving image file {}", path.display()), e))?;
    info!("Image saved to {}", path.display());
    Ok(path)
}

/// One frame as transmitted to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub chip: ChipKind,
    /// Format string such as `.fits` or `.fits.gz`
    pub format: String,
    pub bytes: Bytes,
}

/// Transmission path towards connected clients.
pub trait ClientSink: Send + Sync {
    fn send(&self, blob: Blob) -> CaptureResult<()>;
}

/// In-process broadcast: each subscriber receives every blob in send order.
#[derive(Debug, Clone, Default)]
pub struct BlobChannel {
    subscribers: Arc<Mutex<Vec<Sender<Blob>>>>,
}

impl BlobChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Blob> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Blob>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ClientSink for BlobChannel {
    fn send(&self, blob: Blob) -> CaptureResult<()> {
        // Receivers that went away are pruned
        self.lock().retain(|tx| tx.send(blob.clone()).is_ok());
        Ok(())
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub saved_path: Option<PathBuf>,
    pub sent_format: Option<String>,
    pub skipped_empty: bool,
}

/// Encode, optionally compress, then save and/or send one frame.
pub fn deliver(
    chip: ChipKind,
    request: &EncodeRequest,
    compressed: bool,
    settings: &UploadSettings,
    sink: &dyn ClientSink,
) -> CaptureResult<DeliveryReport> {
    let mut report = DeliveryReport::default();
    let send = settings.mode.sends_to_client();
    let save = settings.mode.saves_locally();

    if request.pixels.is_empty() {
        debug!("Skipping empty {} frame", chip);
        report.skipped_empty = true;
        return Ok(report);
    }

    let started = Instant::now();
    let encoded = encode::encode(request)?;

    if save {
        report.saved_path = Some(save_local(settings, &encoded)?);
    }

    if send {
        let payload = if compressed {
            encode::compress(request, &encoded)?
        } else {
            encoded.into_owned()
        };
        debug!(
            "Uploading {} bytes as {} for {} chip",
            payload.len(),
            payload.format,
            chip
        );
        report.sent_format = Some(payload.format.clone());
        sink.send(Blob {
            chip,
            format: payload.format,
            bytes: Bytes::from(payload.bytes.into_owned()),
        })?;
    }

    debug!("transfer took {:.3} seconds", started.elapsed().as_secs_f64());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera_interface::ImageGeometry;
    use crate::encode::EncodeFormat;
    use crate::fits::FitsHeader;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn settings(dir: &Path, mode: UploadMode) -> UploadSettings {
        UploadSettings {
            mode,
            directory: dir.to_path_buf(),
            prefix: "IMAGE_XXX".to_string(),
        }
    }

    #[test]
    fn test_index_starts_at_one() {
        let dir = TempDir::new().unwrap();
        assert_eq!(file_index(dir.path(), "IMAGE_XXX").unwrap(), 1);

        let missing = dir.path().join("nested/captures");
        assert_eq!(file_index(&missing, "IMAGE_XXX").unwrap(), 1);
        assert!(missing.is_dir());
    }

    #[test]
    fn test_index_follows_existing_files() {
        let dir = TempDir::new().unwrap();
        for i in 1..=4 {
            fs::write(dir.path().join(format!("IMAGE_{i:03}.fits")), b"x").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert_eq!(file_index(dir.path(), "IMAGE_XXX").unwrap(), 5);
    }

    #[test]
    fn test_exhausted_index_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(format!("IMAGE_{}.fits", u32::MAX)), b"").unwrap();
        assert!(matches!(
            file_index(dir.path(), "IMAGE_XXX"),
            Err(CaptureError::RequestRejected(_))
        ));
    }

    #[test]
    fn test_index_ignores_timestamp_placeholder() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("M31_2026-01-02T03-04-05_007.fits"), b"x").unwrap();
        assert_eq!(file_index(dir.path(), "M31_ISO8601_XXX").unwrap(), 8);
    }

    #[test]
    fn test_numeric_suffix() {
        assert_eq!(numeric_suffix("IMAGE_012.fits"), Some(12));
        assert_eq!(numeric_suffix("IMAGE_3.fits.gz"), Some(3));
        assert_eq!(numeric_suffix("IMAGE.fits"), None);
        assert_eq!(numeric_suffix("IMAGE_final.fits"), None);
    }

    #[test]
    fn test_expand_prefix() {
        let now = Local.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(expand_prefix("IMAGE_XXX", 7, now), "IMAGE_007");
        assert_eq!(
            expand_prefix("M31_ISO8601_XXX", 12, now),
            "M31_2026-01-02T03-04-05_012"
        );
    }

    #[test]
    fn test_mode_flags() {
        assert!(UploadMode::Client.sends_to_client());
        assert!(!UploadMode::Client.saves_locally());
        assert!(UploadMode::Both.sends_to_client() && UploadMode::Both.saves_locally());
        assert!(!UploadMode::Local.sends_to_client());
    }

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let channel = BlobChannel::new();
        let a = channel.subscribe();
        let b = channel.subscribe();
        let blob = Blob {
            chip: ChipKind::Primary,
            format: ".fits".into(),
            bytes: Bytes::from_static(b"abc"),
        };
        channel.send(blob.clone()).unwrap();
        assert_eq!(a.try_recv().unwrap(), blob);
        assert_eq!(b.try_recv().unwrap(), blob);

        drop(a);
        channel.send(blob).unwrap();
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[test]
    fn test_deliver_saves_uncompressed_and_sends_compressed() {
        let dir = TempDir::new().unwrap();
        let header = FitsHeader::new();
        let geometry = ImageGeometry {
            width: 4,
            height: 4,
            planes: 1,
            bits_per_pixel: 8,
        };
        let pixels = vec![5u8; 16];
        let request = EncodeRequest {
            format: EncodeFormat::Fits,
            header: &header,
            geometry: &geometry,
            extension: "fits",
            pixels: &pixels,
        };
        let channel = BlobChannel::new();
        let rx = channel.subscribe();

        let report = deliver(
            ChipKind::Primary,
            &request,
            true,
            &settings(dir.path(), UploadMode::Both),
            &channel,
        )
        .unwrap();

        assert_eq!(report.saved_path, Some(dir.path().join("IMAGE_001.fits")));
        assert_eq!(report.sent_format.as_deref(), Some(".fits.gz"));
        assert_eq!(rx.try_recv().unwrap().format, ".fits.gz");
    }

    #[test]
    fn test_empty_frame_is_skipped() {
        let dir = TempDir::new().unwrap();
        let header = FitsHeader::new();
        let geometry = ImageGeometry {
            width: 0,
            height: 0,
            planes: 1,
            bits_per_pixel: 16,
        };
        let request = EncodeRequest {
            format: EncodeFormat::Fits,
            header: &header,
            geometry: &geometry,
            extension: "fits",
            pixels: &[],
        };
        let channel = BlobChannel::new();
        let rx = channel.subscribe();
        let report = deliver(
            ChipKind::Primary,
            &request,
            false,
            &settings(dir.path(), UploadMode::Both),
            &channel,
        )
        .unwrap();
        assert!(report.skipped_empty);
        assert!(rx.try_recv().is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unwritable_directory_is_io_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let settings = UploadSettings {
            directory: blocker.join("sub"),
            ..settings(dir.path(), UploadMode::Local)
        };
        let payload = Payload {
            bytes: std::borrow::Cow::Borrowed(&b"data"[..]),
            format: ".bin".into(),
        };
        assert!(matches!(
            save_local(&settings, &payload),
            Err(CaptureError::Io { .. })
        ));
    }
}
