use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use shm_channel::names::DEFAULT_PREFIX;
use shm_channel::{ChannelNames, RegionLayout};

use crate::error::IpcError;
use crate::transport::BackendKind;

/// Environment variable naming a JSON file that overrides the defaults.
pub const CONFIG_ENV: &str = "ENCODE_OFFLOAD_CONFIG";

pub const DEFAULT_WORKER_EXECUTABLE: &str = "encode-offload-worker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Prefix of the region and signal names, unique per deployment.
    pub channel_prefix: String,
    pub backend: BackendKind,
    /// Buffer capacities; must match the worker's.
    pub layout: RegionLayout,
    /// File name of the worker, looked up next to the current executable.
    pub worker_executable: String,
    /// Explicit worker location. Relative paths resolve against the
    /// directory of the current executable.
    pub worker_path: Option<PathBuf>,
    /// Appended after the positional and channel arguments.
    pub worker_args: Vec<String>,
    pub discovery_interval_ms: u64,
    pub discovery_attempts: u32,
    pub ready_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub packet_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_PREFIX.to_string(),
            backend: BackendKind::default(),
            layout: RegionLayout::reference(),
            worker_executable: DEFAULT_WORKER_EXECUTABLE.to_string(),
            worker_path: None,
            worker_args: Vec::new(),
            discovery_interval_ms: 100,
            discovery_attempts: 50,
            ready_timeout_ms: 5000,
            shutdown_grace_ms: 3000,
            packet_timeout_ms: 1000,
        }
    }
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Loads the file named by `ENCODE_OFFLOAD_CONFIG`, or the defaults when unset.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    pub fn channel_names(&self) -> Result<ChannelNames, IpcError> {
        ChannelNames::from_prefix(&self.channel_prefix).map_err(IpcError::region)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }
}

/// Process-wide configuration, loaded once from the environment.
pub fn config() -> &'static BridgeConfig {
    static CONFIG: LazyLock<BridgeConfig> = LazyLock::new(|| {
        BridgeConfig::from_env().unwrap_or_else(|e| {
            log::warn!("falling back to default offload config: {:#}", e);
            BridgeConfig::default()
        })
    });
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.discovery_interval(), Duration::from_millis(100));
        assert_eq!(config.discovery_attempts, 50);
        assert_eq!(config.ready_timeout(), Duration::from_secs(5));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(3));
        assert!(config.layout.is_reference());
        assert!(config.channel_names().unwrap().is_default());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{
                "channel_prefix": "vr_stream",
                "layout": { "frame_capacity": 8294400, "packet_capacity": 1048576 },
                "ready_timeout_ms": 2500
            }"#,
        )
        .unwrap();
        assert_eq!(config.channel_prefix, "vr_stream");
        assert_eq!(config.layout, RegionLayout::new(8_294_400, 1_048_576));
        assert_eq!(config.ready_timeout(), Duration::from_millis(2500));
        assert_eq!(config.backend, BackendKind::SharedMemory);
        assert_eq!(config.shutdown_grace_ms, 3000);
        assert_eq!(config.worker_executable, DEFAULT_WORKER_EXECUTABLE);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("encode_offload_cfg_{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "backend": "shared_memory", "packet_timeout_ms": 16 }"#).unwrap();
        let config = BridgeConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.packet_timeout(), Duration::from_millis(16));

        assert!(BridgeConfig::from_file(path.with_extension("missing")).is_err());
    }

    #[test]
    fn test_invalid_prefix_is_region_error() {
        let config = BridgeConfig {
            channel_prefix: "bad/prefix".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.channel_names(),
            Err(IpcError::SharedRegionUnavailable { .. })
        ));
    }
}
