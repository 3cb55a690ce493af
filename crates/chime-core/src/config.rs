//! Chime configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChimeError, Result};

/// Staleness tolerance must stay below the smallest recurrence step (1 minute),
/// otherwise a re-armed minutely task could be mistaken for its own stale entry.
const MAX_STALENESS_TOLERANCE_SECS: u64 = 59;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl ChimeConfig {
    /// Load config from the default path (~/.chime/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChimeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChimeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChimeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.staleness_tolerance_secs > MAX_STALENESS_TOLERANCE_SECS {
            return Err(ChimeError::Config(format!(
                "scheduler.staleness_tolerance_secs must be at most {MAX_STALENESS_TOLERANCE_SECS}, got {}",
                self.scheduler.staleness_tolerance_secs
            )));
        }
        if self.scheduler.retry_delay_secs == 0 {
            return Err(ChimeError::Config(
                "scheduler.retry_delay_secs must be positive".into(),
            ));
        }
        if self.scheduler.delivery_timeout_secs == 0 {
            return Err(ChimeError::Config(
                "scheduler.delivery_timeout_secs must be positive".into(),
            ));
        }
        if self.delivery.timeout_secs == 0 {
            return Err(ChimeError::Config(
                "delivery.timeout_secs must be positive".into(),
            ));
        }
        if let Some(url) = &self.delivery.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ChimeError::Config(format!(
                    "delivery.webhook_url must be an http(s) URL, got '{url}'"
                )));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Chime home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chime")
    }
}

/// Scheduler loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How far the stored trigger time may drift from a popped entry's time
    /// before the entry is treated as stale.
    #[serde(default = "default_staleness_tolerance_secs")]
    pub staleness_tolerance_secs: u64,
    /// Extra lead a new trigger time must have over "now".
    #[serde(default)]
    pub min_lead_millis: u64,
    /// Delay before a task whose row could not be read at fire time is tried again.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Upper bound on one delivery attempt.
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

fn default_staleness_tolerance_secs() -> u64 { 5 }
fn default_retry_delay_secs() -> u64 { 30 }
fn default_delivery_timeout_secs() -> u64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            staleness_tolerance_secs: default_staleness_tolerance_secs(),
            min_lead_millis: 0,
            retry_delay_secs: default_retry_delay_secs(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn staleness_tolerance(&self) -> Duration {
        Duration::from_secs(self.staleness_tolerance_secs)
    }

    pub fn min_lead(&self) -> Duration {
        Duration::from_millis(self.min_lead_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.chime/reminders.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

impl StoreConfig {
    /// Store path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Delivery settings. Without a webhook URL, notifications are only logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_timeout_secs() -> u64 { 10 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_timeout_secs(),
            headers: Vec::new(),
        }
    }
}
