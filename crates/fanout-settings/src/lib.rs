//! # fanout-settings
//!
//! Layered configuration: compiled defaults, then `~/.fanout/settings.json`,
//! then `FANOUT_*` environment overrides.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{
    FanoutSettings, LoggingSettings, PresenceBackend, PresenceSettings, RelaySettings,
    ServerSettings,
};
