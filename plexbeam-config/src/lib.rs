//! Shared configuration library for the plexbeam cartridge.
//!
//! This crate centralizes env-var parsing, installer-baked `.env` loading,
//! and the on-disk state layout (session directories, global event logs,
//! fingerprint files). The cartridge binary and the core library both go
//! through here so there is a single source of truth for variable names,
//! defaults, and validation rules.

pub mod constants;
pub mod loader;
pub mod models;
pub mod paths;
pub mod util;

pub use loader::{load, ConfigError};
pub use models::{Config, MultiMode, Source};
pub use paths::StateLayout;
