//! Device-state synchronization and camera frame extraction for the
//! sensor dashboards.
//!
//! - [`mqtt::client::StateSynchronizer`] mirrors the device's MQTT topics into a
//!   [`telemetry::TelemetryState`] and publishes LED toggles.
//! - [`camera::client::FrameExtractor`] turns an MJPEG-over-HTTP feed into
//!   discrete JPEG frames and reconnects on its own.
//!
//! The two share nothing and can be used independently.

pub mod camera;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod telemetry;

pub use camera::Frame;
pub use camera::client::{FrameExtractor, FrameReceiver};
pub use config::Config;
pub use error::{Error, FrameError, Result, SyncError};
pub use mqtt::client::{StateSynchronizer, SyncPhase, ToggleOutcome};
pub use telemetry::{TelemetrySnapshot, TelemetryState};
