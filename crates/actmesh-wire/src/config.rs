//! Configuration loading from `actmesh.toml` with defaults.
//!
//! The path comes from the caller, then the `ACTMESH_CONFIG` environment
//! variable, then `./actmesh.toml`. A missing, unreadable, unparsable or
//! invalid file falls back to defaults with a warning.

use actmesh_types::TransportConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ACTMESH_CONFIG";

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "actmesh.toml";

/// Load transport configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> TransportConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return TransportConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return TransportConfig::default();
        }
    };

    match TransportConfig::from_toml_str(&contents) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Invalid config, using defaults"
            );
            TransportConfig::default()
        }
    }
}

/// Config path from the environment, else `./actmesh.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
