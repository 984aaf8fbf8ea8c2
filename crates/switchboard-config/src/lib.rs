//! Configuration system for the Switchboard agent pipeline.
//!
//! Provides TOML-based configuration with:
//! - Completion model and per-agent step budgets (`[agent]`)
//! - Hydration threshold and legacy agent retry policy
//! - Price rows layered over the built-in table
//! - Config file layering (XDG user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    project_config_path, save_config, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
