//! Configuration file loading.
//!
//! One TOML file holds a `[router]` table for the `coordinator` and `agent`
//! commands and a `[node]` table for `send`. A missing or broken file falls
//! back to defaults; command-line flags are applied on top afterwards.

use fieldmesh_types::{NodeConfig, RouterConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub router: RouterConfig,
    pub node: NodeConfig,
}

/// Load configuration from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> FileConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<FileConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    FileConfig::default()
}

/// `~/.fieldmesh/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".fieldmesh")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [router]
            id = "rig-7"
            heartbeat_interval_ms = 2000

            [router.parent]
            id = "coordinator"
            addr = "10.0.0.1:5560"

            [node]
            id = "cli"
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.router.id, "rig-7");
        assert_eq!(config.router.heartbeat_interval_ms, 2000);
        assert_eq!(config.router.parent.unwrap().addr, "10.0.0.1:5560");
        assert_eq!(config.node.id, "cli");
        assert!(config.node.expand_arrays);
    }

    #[test]
    fn test_missing_or_broken_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert!(config.router.parent.is_none());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[router\nid = ").unwrap();
        let config = load_config(Some(&broken));
        assert_eq!(config.router.listen.port(), fieldmesh_types::config::DEFAULT_ROUTER_PORT);
    }
}
