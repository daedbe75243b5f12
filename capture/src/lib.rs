//! Capture and delivery pipeline for imaging sensors
//!
//! A [`device::CcdDevice`] wraps a [`camera_interface::SensorDriver`] and turns
//! each completed exposure into a FITS (or raw) artifact carrying instrument
//! and astrometric metadata, saved locally and/or sent to clients. Alongside
//! the exposure cycle it ramps the cooler towards a target temperature and
//! can chain back-to-back exposures.

pub mod camera_interface;
pub mod config_storage;
pub mod delivery;
pub mod device;
pub mod encode;
pub mod error;
pub mod exposure;
pub mod external;
pub mod fast_exposure;
pub mod fits;
pub mod formats;
pub mod metadata;
pub mod stream;
pub mod temperature;
pub mod worker;

pub use camera_interface::{ChipKind, SensorDriver};
pub use device::{CcdDevice, Command};
pub use error::{CaptureError, CaptureResult};
