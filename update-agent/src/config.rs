// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Load-time configuration for the update agent.

use camino::Utf8PathBuf;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Configuration for the update agent daemon.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Path of the sqlite database holding coordinator and module state.
    pub database_path: Utf8PathBuf,
    /// Directory images are staged into; owned exclusively by the agent.
    pub download_dir: Utf8PathBuf,
    /// Bind address of the control API.
    pub listen_address: SocketAddr,
    /// The set of updatable components on this device.
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentConfig>,
}

/// Static description of one updatable component.
#[derive(Clone, Debug, Deserialize)]
pub struct ComponentConfig {
    /// Stable component id, unique across the config.
    pub id: String,
    /// Name of the compiled-in module factory servicing this component.
    pub plugin: String,
    /// Components with a higher value update first; equal values update
    /// concurrently.
    #[serde(default)]
    pub update_priority: u32,
    /// Same ordering rule, applied to the reboot pass.
    #[serde(default)]
    pub reboot_priority: u32,
    #[serde(default)]
    pub disabled: bool,
    /// Opaque module parameters, forwarded to the factory untouched.
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse config from {path}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("duplicate component id in config: {0}")]
    DuplicateComponent(String),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;

        let mut seen = std::collections::BTreeSet::new();
        for component in &config.components {
            if !seen.insert(component.id.as_str()) {
                return Err(ConfigError::DuplicateComponent(
                    component.id.clone(),
                ));
            }
        }

        Ok(config)
    }
}
