//! Engine configuration loader.
//!
//! Reads `conductor.toml` from the data directory (`~/.conductor/` unless
//! `CONDUCTOR_DATA_DIR` says otherwise) and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use conductor_types::config::EngineConfig;

pub const CONFIG_FILE: &str = "conductor.toml";

/// Load engine configuration from `{data_dir}/conductor.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or unparsable file: a warning, then defaults.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `CONDUCTOR_DATA_DIR` environment variable
/// 2. `~/.conductor`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CONDUCTOR_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".conductor");
    }

    // Last resort: current directory
    PathBuf::from(".conductor")
}
