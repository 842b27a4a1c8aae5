use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Durable tensor cache location; a temporary store when absent
    pub cache_path: Option<PathBuf>,
    /// How long to wait for a sandbox that is already loading
    #[serde(with = "duration_ms")]
    pub ready_timeout: Duration,
    /// Maximum gap between progress updates while loading
    #[serde(with = "duration_ms")]
    pub load_stall_timeout: Duration,
    /// Bound on a sandbox cache read before it counts as a miss
    #[serde(with = "duration_ms")]
    pub cache_read_timeout: Duration,
    /// Fetch attempts per artifact
    pub fetch_attempts: u32,
    #[serde(with = "duration_ms")]
    pub fetch_retry_delay: Duration,
    /// Delay before a crashed sandbox is reloaded
    #[serde(with = "duration_ms")]
    pub crash_reload_cooldown: Duration,
    /// Capacity of the sandbox message channels
    pub channel_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            ready_timeout: Duration::from_secs(8),
            load_stall_timeout: Duration::from_secs(120),
            cache_read_timeout: Duration::from_secs(5),
            fetch_attempts: 3,
            fetch_retry_delay: Duration::from_secs(1),
            crash_reload_cooldown: Duration::from_secs(20),
            channel_capacity: 256,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Model used when a request names none
    pub default_model: String,
    /// Inactivity after which the runtime is put to sleep
    #[serde(with = "optional_duration_ms")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "duration_ms")]
    pub idle_check_interval: Duration,
    /// Tear down on an idle or lock-screen signal
    pub teardown_on_idle_signal: bool,
    /// Serve repeated one-shot requests from the completion cache
    pub completion_cache: bool,
    /// How long finished requests stay in the tracker
    #[serde(with = "duration_ms")]
    pub request_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: "redpajama-chat-3b".to_string(),
            idle_timeout: Some(Duration::from_secs(600)),
            idle_check_interval: Duration::from_secs(30),
            teardown_on_idle_signal: true,
            completion_cache: false,
            request_retention: Duration::from_secs(600),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: HostConfig,
    pub orchestrator: OrchestratorConfig,
    /// JSON model catalog replacing the built-in one
    pub catalog: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
