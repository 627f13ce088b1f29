//! Configuration handling for the chirp node.
//!
//! Values come from a YAML file, then `CHIRP_*` environment variables, then
//! command line flags (applied in `main`).

use std::path::Path;

use anyhow::{Context, Result};
use chirp_session::ChirpConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Contents of the node configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Log level used when `--log-level` is not given
    pub log_level: Option<String>,
    /// Transport settings
    pub chirp: ChirpConfig,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path))
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `CHIRP_PORT` and `CHIRP_IDENTITY` as returned by `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("CHIRP_PORT") {
            self.chirp.port = port
                .parse()
                .with_context(|| format!("CHIRP_PORT is not a port: {}", port))?;
            info!("Port overridden by environment: {}", self.chirp.port);
        }
        if let Some(identity) = lookup("CHIRP_IDENTITY") {
            info!("Identity overridden by environment: {}", identity);
            self.chirp.identity = Some(identity);
        }
        Ok(())
    }
}
