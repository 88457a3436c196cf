//! # crossline-settings
//!
//! Configuration for Crossline, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CrosslineSettings::default()`]
//! 2. **Settings file**: `~/.crossline/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `CROSSLINE_*` overrides
//!
//! There is no global singleton: the binary loads settings once and passes
//! the relevant sections to each component.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;
