//! Named sensor readout formats.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CaptureError, CaptureResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFormat {
    /// Stable identifier, e.g. `INDI_MONO`
    pub name: String,
    /// Human readable label, persisted as the selection
    pub label: String,
    pub bits_per_pixel: u8,
    pub is_default: bool,
    pub is_little_endian: bool,
}

impl CaptureFormat {
    pub fn new(name: impl Into<String>, label: impl Into<String>, bits_per_pixel: u8) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            bits_per_pixel,
            is_default: false,
            is_little_endian: true,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Ordered list of formats a driver offers plus the active selection.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: Vec<CaptureFormat>,
    selected: Option<usize>,
    /// Label restored from configuration, applied once it is registered
    configured: Option<String>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the persisted selection so it wins over the default.
    pub fn with_configured(mut self, label: Option<String>) -> Self {
        if let Some(index) = label
            .as_deref()
            .and_then(|l| self.formats.iter().position(|f| f.label == l))
        {
            self.selected = Some(index);
        }
        self.configured = label;
        self
    }

    /// Register a format. A name that is already present is left untouched.
    pub fn add(&mut self, format: CaptureFormat) -> bool {
        if self.formats.iter().any(|f| f.name == format.name) {
            debug!("Capture format {} already registered", format.name);
            return false;
        }

        let index = self.formats.len();
        let configured = self.configured.as_deref() == Some(format.label.as_str());
        let take_default = format.is_default && self.selected.is_none();
        if configured || take_default {
            self.selected = Some(index);
        }
        self.formats.push(format);
        true
    }

    pub fn formats(&self) -> &[CaptureFormat] {
        &self.formats
    }

    pub fn selected(&self) -> Option<&CaptureFormat> {
        self.selected.and_then(|i| self.formats.get(i))
    }

    fn position(&self, name: &str) -> CaptureResult<usize> {
        self.formats
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| CaptureError::rejected(format!("unknown capture format {name}")))
    }

    /// Look up a registered format without selecting it.
    pub fn find(&self, name: &str) -> CaptureResult<&CaptureFormat> {
        let index = self.position(name)?;
        Ok(&self.formats[index])
    }

    /// Select by name. Selecting the active format again is a no-op; the
    /// choice only matters for the next exposure.
    pub fn select(&mut self, name: &str) -> CaptureResult<&CaptureFormat> {
        let index = self.position(name)?;
        if self.selected != Some(index) {
            info!("Capture format set to {}", self.formats[index].label);
            self.selected = Some(index);
        }
        Ok(&self.formats[index])
    }

    /// Label to persist, if anything is selected.
    pub fn selected_label(&self) -> Option<&str> {
        self.selected().map(|f| f.label.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> FormatRegistry {
        let mut registry = FormatRegistry::new();
        registry.add(CaptureFormat::new("MONO8", "Mono 8", 8));
        registry.add(CaptureFormat::new("MONO16", "Mono 16", 16).as_default());
        registry.add(CaptureFormat::new("RAW32", "Raw 32", 32));
        registry
    }

    #[test]
    fn test_default_is_selected() {
        let registry = registry();
        assert_eq!(registry.selected().unwrap().name, "MONO16");
    }

    #[test]
    fn test_duplicate_name_is_ignored() {
        let mut registry = registry();
        assert!(!registry.add(CaptureFormat::new("MONO8", "Other", 12)));
        assert_eq!(registry.formats().len(), 3);
        assert_eq!(registry.formats()[0].label, "Mono 8");
    }

    #[test]
    fn test_configured_label_wins() {
        let mut registry = FormatRegistry::new().with_configured(Some("Raw 32".to_string()));
        registry.add(CaptureFormat::new("MONO16", "Mono 16", 16).as_default());
        registry.add(CaptureFormat::new("RAW32", "Raw 32", 32));
        assert_eq!(registry.selected_label(), Some("Raw 32"));
    }

    #[test]
    fn test_select_is_idempotent() {
        let mut registry = registry();
        assert_eq!(registry.select("MONO8").unwrap().bits_per_pixel, 8);
        assert_eq!(registry.select("MONO8").unwrap().bits_per_pixel, 8);
        assert_eq!(registry.selected_label(), Some("Mono 8"));
        assert!(registry.select("NOPE").is_err());
        assert_eq!(registry.selected_label(), Some("Mono 8"));
    }

    #[test]
    fn test_find_leaves_selection_alone() {
        let registry = registry();
        assert_eq!(registry.find("RAW32").unwrap().label, "Raw 32");
        assert_eq!(registry.selected_label(), Some("Mono 16"));
        assert!(registry.find("NOPE").is_err());
    }

    #[test]
    fn test_nothing_selected_without_default() {
        let mut registry = FormatRegistry::new();
        registry.add(CaptureFormat::new("MONO8", "Mono 8", 8));
        assert!(registry.selected().is_none());
    }
}
