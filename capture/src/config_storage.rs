//! Persisted device settings.
//!
//! Settings are stored as one pretty-printed JSON file per device under
//! ~/.cf_config/devices/ by default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::camera_interface::{Binning, Roi};
use crate::delivery::UploadSettings;
use crate::encode::EncodeFormat;
use crate::error::{CaptureError, CaptureResult};
use crate::fast_exposure::LatencyPolicy;
use crate::metadata::{BayerInfo, TelescopeType};
use crate::stream::DEFAULT_WS_PORT;
use crate::temperature::TemperatureRamp;

/// Names of the peer devices whose values feed the header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveDevices {
    pub telescope: Option<String>,
    pub rotator: Option<String>,
    pub focuser: Option<String>,
    pub filter_wheel: Option<String>,
    pub sky_quality: Option<String>,
}

/// Everything a device restores on startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub ramp: TemperatureRamp,
    pub primary_compressed: bool,
    pub guide_compressed: bool,
    /// Label of the selected capture format
    pub capture_format: Option<String>,
    pub encode_format: EncodeFormat,
    pub upload: UploadSettings,
    pub fast_exposure_enabled: bool,
    pub latency_policy: LatencyPolicy,
    pub telescope_type: TelescopeType,
    pub active_devices: ActiveDevices,
    pub guide_binning: Binning,
    pub primary_frame: Option<Roi>,
    pub bayer: Option<BayerInfo>,
    pub websocket_enabled: bool,
    pub websocket_port: u16,
    pub wcs_enabled: bool,
    pub observer: String,
    pub object: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            ramp: TemperatureRamp::default(),
            primary_compressed: false,
            guide_compressed: false,
            capture_format: None,
            encode_format: EncodeFormat::default(),
            upload: UploadSettings::default(),
            fast_exposure_enabled: false,
            latency_policy: LatencyPolicy::default(),
            telescope_type: TelescopeType::default(),
            active_devices: ActiveDevices::default(),
            guide_binning: Binning::default(),
            primary_frame: None,
            bayer: None,
            websocket_enabled: false,
            websocket_port: DEFAULT_WS_PORT,
            wcs_enabled: false,
            observer: "Unknown".to_string(),
            object: "Unknown".to_string(),
        }
    }
}

/// Receives settings whenever an operator change should be persisted.
pub trait ConfigSink: Send {
    fn save(&self, device: &str, settings: &DeviceSettings) -> CaptureResult<()>;
}

/// Configuration storage manager for device settings.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.cf_config)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.cf_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".cf_config");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn devices_dir(&self) -> PathBuf {
        self.root_path.join("devices")
    }

    /// Settings file for a device, with spaces and slashes made filename safe.
    pub fn device_settings_path(&self, device: &str) -> PathBuf {
        let safe = device.replace([' ', '/'], "_");
        self.devices_dir().join(format!("{safe}.json"))
    }

    /// Load settings for a device.
    ///
    /// Returns None if nothing was saved for this device yet.
    /// Returns Some(Err) if the file exists but cannot be read or parsed.
    pub fn get_device_settings(&self, device: &str) -> Option<CaptureResult<DeviceSettings>> {
        let path = self.device_settings_path(device);
        if !path.exists() {
            return None;
        }
        Some(Self::load(&path))
    }

    fn load(path: &Path) -> CaptureResult<DeviceSettings> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CaptureError::io(format!("reading {}", path.display()), e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings for a device, creating the directory on demand.
    pub fn save_device_settings(
        &self,
        device: &str,
        settings: &DeviceSettings,
    ) -> CaptureResult<PathBuf> {
        let dir = self.devices_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| CaptureError::io(format!("creating {}", dir.display()), e))?;

        let path = self.device_settings_path(device);
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&path, json)
            .map_err(|e| CaptureError::io(format!("writing {}", path.display()), e))?;
        debug!("Saved settings for {} to {}", device, path.display());
        Ok(path)
    }

    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete_device_settings(&self, device: &str) -> std::io::Result<bool> {
        let path = self.device_settings_path(device);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }
}

impl ConfigSink for ConfigStorage {
    fn save(&self, device: &str, settings: &DeviceSettings) -> CaptureResult<()> {
        self.save_device_settings(device, settings).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::UploadMode;
    use tempfile::TempDir;

    fn storage() -> (TempDir, ConfigStorage) {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());
        (dir, storage)
    }

    #[test]
    fn test_missing_settings_is_none() {
        let (_dir, storage) = storage();
        assert!(storage.get_device_settings("CCD Simulator").is_none());
    }

    #[test]
    fn test_save_and_load() {
        let (_dir, storage) = storage();
        let mut settings = DeviceSettings {
            ramp: TemperatureRamp::new(5.0, 0.5).unwrap(),
            primary_compressed: true,
            capture_format: Some("Mono 16".to_string()),
            fast_exposure_enabled: true,
            latency_policy: LatencyPolicy::WindowedMean(4),
            ..Default::default()
        };
        settings.upload.mode = UploadMode::Both;
        settings.upload.prefix = "M31_ISO8601_XXX".to_string();

        let path = storage
            .save_device_settings("CCD Simulator", &settings)
            .unwrap();
        assert!(path.ends_with("devices/CCD_Simulator.json"));

        let loaded = storage
            .get_device_settings("CCD Simulator")
            .expect("settings should exist")
            .expect("settings should parse");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let (_dir, storage) = storage();
        let path = storage.device_settings_path("cam");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{ "wcs_enabled": true }"#).unwrap();

        let loaded = storage.get_device_settings("cam").unwrap().unwrap();
        assert!(loaded.wcs_enabled);
        assert_eq!(loaded.websocket_port, DEFAULT_WS_PORT);
        assert_eq!(loaded.observer, "Unknown");
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let (_dir, storage) = storage();
        let path = storage.device_settings_path("cam");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            storage.get_device_settings("cam"),
            Some(Err(CaptureError::Config(_)))
        ));
    }

    #[test]
    fn test_delete_device_settings() {
        let (_dir, storage) = storage();
        storage
            .save(" cam/1", &DeviceSettings::default())
            .unwrap();
        assert!(storage.delete_device_settings(" cam/1").unwrap());
        assert!(!storage.delete_device_settings(" cam/1").unwrap());
    }
}
