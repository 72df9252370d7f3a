//! Launch configuration for channeld hub connections.
//!
//! Settings persist to disk as a RON file. CLI flags (including the legacy
//! single-dash forms such as `-sa 10.0.0.2`) override the file.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, normalize_legacy_args};
pub use config::{ClientConfig, Config, ConnectionSettings, LogConfig, ServerConfig, default_config_dir};
pub use error::ConfigError;
