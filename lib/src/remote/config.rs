// Copyright 2021 The Depot Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Server configuration.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

const CONFIG_FILE: &str = "server_config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read server config")]
    Io(#[from] std::io::Error),
    #[error("could not parse server config: {0}")]
    Parse(String),
}

/// Limits and policy advertised by (and enforced on) the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Budget for one uncompressed payload batch on the wire.
    pub push_max_nbytes: u64,
    pub enable_compression: bool,
    pub optimization_target: String,
    /// When set, only callers presenting the username/password pair may
    /// invoke push operations.
    pub restrict_push: bool,
    pub username: String,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            push_max_nbytes: 32 << 20,
            enable_compression: true,
            optimization_target: "throughput".to_string(),
            restrict_push: false,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl ServerConfig {
    /// Reads the config from `dir`, writing the defaults there first when no
    /// file exists yet.
    pub fn load_or_create(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            let raw = fs::read_to_string(&path)?;
            toml::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))
        } else {
            let config = Self::default();
            let rendered = toml::to_string_pretty(&config)
                .map_err(|err| ConfigError::Parse(err.to_string()))?;
            fs::create_dir_all(dir)?;
            fs::write(&path, rendered)?;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let created = ServerConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(created.push_max_nbytes, 32 << 20);
        assert!(dir.path().join(CONFIG_FILE).is_file());

        // Second load reads the file back.
        let loaded = ServerConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(loaded.push_max_nbytes, created.push_max_nbytes);
        assert!(!loaded.restrict_push);
    }
}
