//! Connection configuration for the backing store.
//!
//! The registry never reads files or flags on its own; embedders build an
//! [`EtcdConfig`] directly or load one with [`EtcdConfig::parse`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};

/// Default etcd client endpoint.
pub static DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4001";
/// Default subnet directory.
pub static DEFAULT_SUBNET_PATH: &str = "/registry/subnets";
/// Default network-config directory.
pub static DEFAULT_SUBNET_CONFIG_PATH: &str = "/registry/subnets/config";
/// Default host directory.
pub static DEFAULT_HOST_PATH: &str = "/registry/minions";

/// Where the store lives, how to authenticate to it, and the three
/// directories the registry owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub keyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub subnet_path: String,
    pub subnet_config_path: String,
    pub host_path: String,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_owned()],
            keyfile: None,
            certfile: None,
            ca_file: None,
            subnet_path: DEFAULT_SUBNET_PATH.to_owned(),
            subnet_config_path: DEFAULT_SUBNET_CONFIG_PATH.to_owned(),
            host_path: DEFAULT_HOST_PATH.to_owned(),
        }
    }
}

fn is_set(path: &Option<PathBuf>) -> bool {
    path.as_ref().is_some_and(|p| !p.as_os_str().is_empty())
}

impl EtcdConfig {
    /// attempts to decode the config as JSON or YAML, picking by extension and
    /// trying both when there is none
    pub fn parse<P: AsRef<Path>>(path: P) -> RegistryResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Config(format!("failed to read config at {}: {e}", path.display()))
        })?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&input)
                .map_err(|e| RegistryError::Config(format!("invalid JSON config: {e}")))?,
            Some("yaml" | "yml") => serde_yaml::from_str(&input)
                .map_err(|e| RegistryError::Config(format!("invalid YAML config: {e}")))?,
            _ => return Self::parse_str(input),
        };
        config.validate()?;
        debug!(?config, path = %path.display(), "parsed registry config");
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML
    pub fn parse_str<S: AsRef<str>>(s: S) -> RegistryResult<Self> {
        let s = s.as_ref();
        let config: Self = match serde_json::from_str(s) {
            Ok(config) => config,
            Err(json_err) => serde_yaml::from_str(s).map_err(|yaml_err| {
                RegistryError::Config(format!(
                    "config is neither JSON ({json_err}) nor YAML ({yaml_err})"
                ))
            })?,
        };
        config.validate()?;
        debug!(?config, "parsed registry config");
        Ok(config)
    }

    /// True when any certificate, key or CA path is configured.
    pub fn uses_tls(&self) -> bool {
        is_set(&self.keyfile) || is_set(&self.certfile) || is_set(&self.ca_file)
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if self.endpoints.is_empty() {
            return Err(RegistryError::Config("at least one endpoint is required".into()));
        }
        for endpoint in &self.endpoints {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(RegistryError::Config(format!(
                    "endpoint '{endpoint}' must be an http:// or https:// URL"
                )));
            }
        }
        for (name, path) in [
            ("subnet_path", &self.subnet_path),
            ("subnet_config_path", &self.subnet_config_path),
            ("host_path", &self.host_path),
        ] {
            if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
                return Err(RegistryError::Config(format!(
                    "{name} '{path}' must be an absolute key without a trailing slash"
                )));
            }
        }
        if is_set(&self.certfile) != is_set(&self.keyfile) {
            return Err(RegistryError::Config(
                "certfile and keyfile must be configured together".into(),
            ));
        }
        Ok(())
    }
}
