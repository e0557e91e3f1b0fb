//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `SPMD_*` environment variables override config file values.
//! Example: `SPMD_TOPOLOGY__RANK=3` overrides `topology.rank` in config.

use crate::distributed::backend::CollectiveBackend;
use crate::distributed::identity::GroupIdentity;
use crate::distributed::sim_backend::SimulatedBackend;
use crate::distributed::nccl_sys::MIN_SPLIT_VERSION;
use crate::utils::error::{CommError, Result};
use crate::utils::logging::LogFormat;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "SPMD_";

/// Launch topology of this participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Number of participants in the global group
    #[serde(default = "default_world_size")]
    pub world_size: i32,

    /// This participant's global rank
    #[serde(default)]
    pub rank: i32,

    /// Device index to bind
    #[serde(default)]
    pub device: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Simulated,
    Nccl,
    Disabled,
}

impl BackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "simulated" | "sim" => Some(BackendKind::Simulated),
            "nccl" => Some(BackendKind::Nccl),
            "disabled" | "none" => Some(BackendKind::Disabled),
            _ => None,
        }
    }
}

/// Collective backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// Precomputed group identity, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Library version the simulated backend reports
    #[serde(default = "default_simulated_version")]
    pub simulated_version: i32,

    /// Devices the simulated backend exposes
    #[serde(default = "default_simulated_devices")]
    pub simulated_devices: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `pretty`, `json` or `compact`
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub topology: TopologyConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default value functions
fn default_world_size() -> i32 { 1 }
fn default_backend_kind() -> BackendKind { BackendKind::Simulated }
fn default_simulated_version() -> i32 { MIN_SPLIT_VERSION }
fn default_simulated_devices() -> i32 { 8 }
fn default_log_format() -> String { "pretty".to_string() }

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            rank: 0,
            device: 0,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            unique_id: None,
            simulated_version: default_simulated_version(),
            simulated_devices: default_simulated_devices(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CommError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Nested keys use double underscore: `SPMD_BACKEND__KIND`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(env::vars());
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(env::vars());
        config
    }

    /// Apply `SPMD_`-prefixed overrides from `vars`; other keys are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(config_key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let config_key = config_key.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            let applied = match parts.as_slice() {
                ["topology", field] => self.apply_topology_override(field, &value),
                ["backend", field] => self.apply_backend_override(field, &value),
                ["logging", field] => self.apply_logging_override(field, &value),
                ["log_format"] => self.apply_logging_override("format", &value),
                [field] => {
                    self.apply_topology_override(field, &value)
                        || self.apply_backend_override(field, &value)
                }
                _ => false,
            };
            if !applied {
                debug!(key = %key, "Ignoring unrecognized or unparsable config override");
            }
        }
    }

    fn apply_topology_override(&mut self, field: &str, value: &str) -> bool {
        let target = match field {
            "world_size" => &mut self.topology.world_size,
            "rank" => &mut self.topology.rank,
            "device" => &mut self.topology.device,
            _ => return false,
        };
        value.parse().map(|v| *target = v).is_ok()
    }

    fn apply_backend_override(&mut self, field: &str, value: &str) -> bool {
        match field {
            "kind" | "backend" => BackendKind::parse(value)
                .map(|kind| self.backend.kind = kind)
                .is_some(),
            "unique_id" => {
                self.backend.unique_id = Some(value.to_string());
                true
            }
            "simulated_version" => value
                .parse()
                .map(|v| self.backend.simulated_version = v)
                .is_ok(),
            "simulated_devices" => value
                .parse()
                .map(|v| self.backend.simulated_devices = v)
                .is_ok(),
            _ => false,
        }
    }

    fn apply_logging_override(&mut self, field: &str, value: &str) -> bool {
        match field {
            "format" => {
                self.logging.format = value.to_lowercase();
                true
            }
            _ => false,
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        let topology = &self.topology;
        if topology.world_size < 1 {
            return Err(CommError::Config(format!(
                "world_size must be at least 1, got {}",
                topology.world_size
            )));
        }
        if topology.rank < 0 || topology.rank >= topology.world_size {
            return Err(CommError::Config(format!(
                "rank ({}) must be in [0, {})",
                topology.rank, topology.world_size
            )));
        }
        if topology.device < 0 {
            return Err(CommError::Config(format!(
                "device must be non-negative, got {}",
                topology.device
            )));
        }
        if self.backend.simulated_devices < 1 {
            return Err(CommError::Config("simulated_devices must be at least 1".into()));
        }
        self.unique_id_bytes()?;
        if LogFormat::parse(&self.logging.format).is_none() {
            return Err(CommError::Config(format!(
                "unknown log format: {}",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// The precomputed group identity as raw bytes; empty when none is configured.
    pub fn unique_id_bytes(&self) -> Result<Vec<u8>> {
        match &self.backend.unique_id {
            Some(text) => GroupIdentity::from_hex(text)
                .map(|id| id.as_bytes().to_vec())
                .map_err(|e| CommError::Config(format!("backend.unique_id: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Build the configured collective backend. `None` when collectives are disabled.
    pub fn build_backend(&self) -> Result<Option<Arc<dyn CollectiveBackend>>> {
        match self.backend.kind {
            BackendKind::Simulated => {
                let backend = SimulatedBackend::new()
                    .with_version(self.backend.simulated_version)
                    .with_devices(self.backend.simulated_devices);
                Ok(Some(Arc::new(backend)))
            }
            BackendKind::Nccl => Self::native_backend(),
            BackendKind::Disabled => Ok(None),
        }
    }

    #[cfg(feature = "cuda")]
    fn native_backend() -> Result<Option<Arc<dyn CollectiveBackend>>> {
        Ok(Some(Arc::new(crate::distributed::nccl_backend::NcclBackend::new())))
    }

    #[cfg(not(feature = "cuda"))]
    fn native_backend() -> Result<Option<Arc<dyn CollectiveBackend>>> {
        Err(CommError::Config(
            "backend.kind = nccl requires building with the `cuda` feature".into(),
        ))
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CommError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}
