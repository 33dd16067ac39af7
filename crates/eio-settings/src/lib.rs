//! # eio-settings
//!
//! Layered configuration for the eio engine and its HTTP server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`EioSettings::default()`]
//! 2. **Settings file**: `$EIO_SETTINGS` or `~/.eio/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `EIO_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
static SETTINGS: OnceLock<EioSettings> = OnceLock::new();

/// Get the global settings instance.
///
/// On first call, loads settings with env var overrides. If loading fails,
/// returns compiled defaults.
pub fn get_settings() -> &'static EioSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// Returns the settings back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: EioSettings) -> std::result::Result<(), EioSettings> {
    SETTINGS.set(settings)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
