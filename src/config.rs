//! Fleet configuration
//!
//! Load/validate/save settings for the orchestrator. Loading never fails:
//! a missing or corrupt file falls back to defaults with a warning, and
//! `validate` clamps out-of-range values instead of rejecting them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::exec::RetryPolicy;
use crate::queue::QueueConfig;
use crate::residency::{MonitorConfig, PressureSource};
use crate::storage::StorageError;
use crate::types::Tier;

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Execution service base URL (default: local Ollama).
    pub exec_base_url: Option<String>,
    /// Hardware tier this host belongs to. Detection is external; the
    /// tier arrives through configuration.
    pub tier: Tier,
    /// Per-request timeout for generate calls, seconds.
    pub request_timeout_secs: u64,
    /// Per-member timeout inside an ensemble, seconds.
    pub ensemble_timeout_secs: u64,
    /// Residency monitor poll interval, seconds.
    pub monitor_interval_secs: u64,
    /// Resident-set cache TTL, seconds.
    pub resident_cache_ttl_secs: u64,
    /// Used-memory fraction above which eviction starts.
    pub pressure_threshold: f64,
    pub pressure_source: PressureSource,
    /// Total RAM override in GB; probed when absent.
    pub total_ram_gb: Option<f64>,
    /// Trailing window for usage-frequency queries, hours.
    pub usage_window_hours: i64,
    /// Queue consumer lease TTL, seconds.
    pub lease_ttl_secs: i64,
    /// Attempts before a queue item is dead-lettered.
    pub max_attempts: u32,
    pub dead_letter_cap: usize,
    /// Attempt cap for transient-failure retries.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Keep-alive passed to the execution service, seconds.
    pub keep_alive_secs: i64,
    /// Use the performance-informed adaptive tuner instead of the default.
    pub adaptive_tuning: bool,
    /// Data directory override for persisted state.
    pub data_dir: Option<PathBuf>,
    /// Model catalog file; built-in catalog when absent.
    pub catalog_path: Option<PathBuf>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            exec_base_url: None,
            tier: Tier::B,
            request_timeout_secs: 120,
            ensemble_timeout_secs: 120,
            monitor_interval_secs: 60,
            resident_cache_ttl_secs: 5,
            pressure_threshold: 0.85,
            pressure_source: PressureSource::ResidentSum,
            total_ram_gb: None,
            usage_window_hours: 24,
            lease_ttl_secs: 300,
            max_attempts: 3,
            dead_letter_cap: 50,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            keep_alive_secs: 300,
            adaptive_tuning: false,
            data_dir: None,
            catalog_path: None,
        }
    }
}

impl FleetConfig {
    /// Clamp values into acceptable ranges.
    pub fn validate(&mut self) {
        self.pressure_threshold = self.pressure_threshold.clamp(0.1, 0.99);
        self.request_timeout_secs = self.request_timeout_secs.clamp(1, 3600);
        self.ensemble_timeout_secs = self.ensemble_timeout_secs.clamp(1, 3600);
        self.monitor_interval_secs = self.monitor_interval_secs.max(1);
        self.resident_cache_ttl_secs = self.resident_cache_ttl_secs.max(1);
        self.usage_window_hours = self.usage_window_hours.max(1);
        self.lease_ttl_secs = self.lease_ttl_secs.max(10);
        self.max_attempts = self.max_attempts.max(1);
        self.dead_letter_cap = self.dead_letter_cap.max(1);
        self.retry_max_attempts = self.retry_max_attempts.max(1);
        if self.keep_alive_secs < -1 {
            self.keep_alive_secs = -1;
        }
    }

    /// Load from a JSON file, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: &Path) -> Self {
        match Self::load_internal(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config from {:?}, using defaults: {}", path, e);
                let mut config = Self::default();
                config.validate();
                config
            }
        }
    }

    fn load_internal(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            let mut config = Self::default();
            config.validate();
            return Ok(config);
        }
        let json = fs::read_to_string(path)?;
        let mut config: FleetConfig = serde_json::from_str(&json)?;
        config.validate();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.monitor_interval_secs),
            cache_ttl: Duration::from_secs(self.resident_cache_ttl_secs),
            pressure_threshold: self.pressure_threshold,
            source: self.pressure_source,
            total_ram_gb: self.total_ram_gb,
            usage_window: chrono::Duration::hours(self.usage_window_hours),
            keep_alive_secs: self.keep_alive_secs,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease_ttl: chrono::Duration::seconds(self.lease_ttl_secs),
            max_attempts: self.max_attempts,
            dead_letter_cap: self.dead_letter_cap,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn usage_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.usage_window_hours)
    }
}
