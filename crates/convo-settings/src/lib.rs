//! # convo-settings
//!
//! Layered configuration for the conversation ledger runtime.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ConvoSettings::default()`]
//! 2. **User file**: `~/.convo/settings.json` or `CONVO_SETTINGS_PATH`
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `CONVO_*` overrides (highest priority)
//!
//! There is no process-wide instance: load once at startup and hand the
//! relevant section to each service constructor.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
