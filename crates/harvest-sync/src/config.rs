//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HARVEST_AGENT_ID=agent-7                                           │
//! │     HARVEST_MAX_RETRIES=5                                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/harvest/sync.toml (Linux)                                │
//! │     ~/Library/Application Support/org.harvest.census/sync.toml (macOS) │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     3 retries, 5 s base delay, batches of 50                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Tablet 3"
//!
//! [agent]
//! id = "agent-7"
//!
//! [sync]
//! max_retries = 3
//! batch_size = 50
//! retry_delay_secs = 5
//! sync_timeout_secs = 30
//! checksum_validation = true
//! cooldown_secs = 10
//! batch_pause_ms = 100
//! auto_sync = true
//! auto_sync_interval_secs = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for the collecting device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier, generated on first run.
    pub id: String,

    /// Human-readable device name.
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Field Tablet".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// The field agent signed in on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent identifier attached to every queued record.
    pub id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            id: "unassigned".to_string(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Delivery, retry and pacing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Lifetime handler invocations per record.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Records per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Base backoff delay; attempt `n` waits `retry_delay * 2^n`.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Deadline for a whole pass.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    /// Verify payload checksums before each delivery.
    #[serde(default = "default_true")]
    pub checksum_validation: bool,

    /// Minimum gap between two unforced passes.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Pause between batches.
    #[serde(default = "default_batch_pause")]
    pub batch_pause_ms: u64,

    /// Run passes in the background.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Background pass interval.
    #[serde(default = "default_auto_sync_interval")]
    pub auto_sync_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}
fn default_batch_size() -> usize {
    50
}
fn default_retry_delay() -> u64 {
    5
}
fn default_sync_timeout() -> u64 {
    30
}
fn default_cooldown() -> u64 {
    10
}
fn default_batch_pause() -> u64 {
    100
}
fn default_auto_sync_interval() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            retry_delay_secs: default_retry_delay(),
            sync_timeout_secs: default_sync_timeout(),
            checksum_validation: true,
            cooldown_secs: default_cooldown(),
            batch_pause_ms: default_batch_pause(),
            auto_sync: true,
            auto_sync_interval_secs: default_auto_sync_interval(),
        }
    }
}

impl SyncSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_secs)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Signed-in agent.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Delivery settings.
    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for the given agent and device.
    pub fn for_agent(agent_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.agent.id = agent_id.into();
        config.device.id = device_id.into();
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        Self::load_with(config_path, |var| std::env::var(var).ok())
    }

    /// [`load`](Self::load) with environment lookups answered by `env`.
    fn load_with<F>(config_path: Option<PathBuf>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides(&env);
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load sync config, using defaults");
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> Result<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.agent.id.trim().is_empty() {
            return Err(SyncError::MissingAgentId);
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.sync_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync_timeout_secs must be greater than 0".into(),
            ));
        }

        // Keeps retry_delay * 2^n in range.
        if self.sync.max_retries > 16 {
            return Err(SyncError::InvalidConfig(format!(
                "max_retries must be at most 16, got {}",
                self.sync.max_retries
            )));
        }

        if self.sync.auto_sync && self.sync.auto_sync_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "auto_sync_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides<F>(&mut self, env: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = env("HARVEST_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(id) = env("HARVEST_AGENT_ID") {
            debug!(agent_id = %id, "Overriding agent ID from environment");
            self.agent.id = id;
        }

        override_parsed(env, "HARVEST_MAX_RETRIES", &mut self.sync.max_retries);
        override_parsed(env, "HARVEST_BATCH_SIZE", &mut self.sync.batch_size);
        override_parsed(env, "HARVEST_RETRY_DELAY_SECS", &mut self.sync.retry_delay_secs);
        override_parsed(env, "HARVEST_SYNC_TIMEOUT_SECS", &mut self.sync.sync_timeout_secs);
        override_parsed(
            env,
            "HARVEST_CHECKSUM_VALIDATION",
            &mut self.sync.checksum_validation,
        );
        override_parsed(env, "HARVEST_AUTO_SYNC", &mut self.sync.auto_sync);
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "harvest", "census")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the agent ID.
    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }
}

fn override_parsed<F, T>(env: &F, var: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + std::fmt::Debug,
{
    let Some(raw) = env(var) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            debug!(var, ?value, "Overriding sync setting from environment");
            *target = value;
        }
        Err(_) => warn!(var, value = %raw, "Ignoring unparseable environment override"),
    }
}
