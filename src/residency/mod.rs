//! Residency monitoring
//!
//! Tracks which models the execution service holds in memory, watches
//! memory pressure on a fixed interval and relieves it by unloading
//! models in eviction order. Models serving an in-flight request are
//! pinned and never unloaded.

pub mod eviction;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::exec::ExecutionService;
use crate::storage::ledger::UsageLedger;
use crate::system::memory::{self, MemorySnapshot};
use crate::types::FleetError;

/// Fallback total-RAM estimate when no probe and no override is available.
const DEFAULT_TOTAL_RAM_GB: f64 = 16.0;

/// A model currently loaded by the execution service. Mirrors external
/// truth; `loaded_at` is when this process first observed it resident.
#[derive(Debug, Clone)]
pub struct ResidentModel {
    pub name: String,
    pub ram_gb: f64,
    pub loaded_at: DateTime<Utc>,
}

/// Where the pressure estimate comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PressureSource {
    /// Sum of reported resident model memory against total RAM.
    ResidentSum,
    /// System-reported available memory (vm_stat / meminfo / wmic), with a
    /// 50%-of-total fallback when the probe fails.
    SystemFree,
}

/// Monitor loop state, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Polling,
    Pressure,
    Nominal,
}

/// Result of an `ensure_loaded` call. A failed warm is a soft outcome,
/// not an error: the service loads models lazily on first real use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyResident,
    Warmed,
    WarmFailed,
}

/// Monitor settings, extracted from the fleet config.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub cache_ttl: Duration,
    /// Used fraction above which pressure relief starts.
    pub pressure_threshold: f64,
    pub source: PressureSource,
    /// Total RAM override; probed (then defaulted) when absent.
    pub total_ram_gb: Option<f64>,
    pub usage_window: chrono::Duration,
    pub keep_alive_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(5),
            pressure_threshold: 0.85,
            source: PressureSource::ResidentSum,
            total_ram_gb: None,
            usage_window: chrono::Duration::hours(24),
            keep_alive_secs: 300,
        }
    }
}

struct CachedResidents {
    at: Instant,
    models: Vec<ResidentModel>,
}

/// Keeps a model out of the eviction candidate set while held.
pub struct PinGuard {
    pins: Arc<DashMap<String, usize>>,
    model: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins
            .remove_if_mut(&self.model, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            });
    }
}

/// Polls the execution service and keeps resident memory under the soft
/// budget.
pub struct ResidencyMonitor {
    exec: Arc<dyn ExecutionService>,
    ledger: Arc<UsageLedger>,
    config: MonitorConfig,
    state: RwLock<MonitorState>,
    cache: tokio::sync::Mutex<Option<CachedResidents>>,
    pins: Arc<DashMap<String, usize>>,
}

/// Handle to a spawned monitor loop.
pub struct MonitorHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl ResidencyMonitor {
    pub fn new(
        exec: Arc<dyn ExecutionService>,
        ledger: Arc<UsageLedger>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            exec,
            ledger,
            config,
            state: RwLock::new(MonitorState::Idle),
            cache: tokio::sync::Mutex::new(None),
            pins: Arc::new(DashMap::new()),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, next: MonitorState) {
        let mut state = self.state.write().unwrap();
        if *state != next {
            tracing::debug!("Residency monitor: {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Pin a model for the duration of an in-flight request.
    pub fn pin(&self, model: &str) -> PinGuard {
        *self.pins.entry(model.to_string()).or_insert(0) += 1;
        PinGuard {
            pins: Arc::clone(&self.pins),
            model: model.to_string(),
        }
    }

    pub fn pinned_set(&self) -> HashSet<String> {
        self.pins
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Resident models, served from a short-TTL cache so callers do not
    /// hammer the service.
    pub async fn residents(&self) -> Result<Vec<ResidentModel>, FleetError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = &*cache {
            if cached.at.elapsed() < self.config.cache_ttl {
                return Ok(cached.models.clone());
            }
        }

        let listed = self.exec.list().await?;
        let previous: HashMap<String, DateTime<Utc>> = cache
            .take()
            .map(|c| c.models.into_iter().map(|m| (m.name, m.loaded_at)).collect())
            .unwrap_or_default();

        let now = Utc::now();
        let models: Vec<ResidentModel> = listed
            .into_iter()
            .map(|info| ResidentModel {
                loaded_at: previous.get(&info.name).copied().unwrap_or(now),
                name: info.name,
                ram_gb: info.ram_gb,
            })
            .collect();

        *cache = Some(CachedResidents {
            at: Instant::now(),
            models: models.clone(),
        });
        Ok(models)
    }

    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    fn total_ram_gb(&self) -> f64 {
        self.config
            .total_ram_gb
            .or_else(memory::total_ram_gb)
            .unwrap_or(DEFAULT_TOTAL_RAM_GB)
    }

    /// Whether the configured estimator currently reports pressure.
    pub async fn pressure(&self) -> Result<bool, FleetError> {
        let total = self.total_ram_gb();
        let used_fraction = match self.config.source {
            PressureSource::ResidentSum => {
                let residents = self.residents().await?;
                let resident_gb: f64 = residents.iter().map(|m| m.ram_gb).sum();
                resident_gb / total
            }
            PressureSource::SystemFree => memory::probe()
                .unwrap_or_else(|| MemorySnapshot::assume_half_free(total))
                .used_fraction(),
        };
        Ok(used_fraction > self.config.pressure_threshold)
    }

    /// One monitor cycle: poll, classify, relieve if needed. Probe
    /// failures skip the cycle; they never trigger eviction.
    pub async fn run_cycle(&self) {
        self.set_state(MonitorState::Polling);
        self.invalidate().await;

        if self.residents().await.is_err() {
            tracing::warn!("Residency poll failed, skipping cycle");
            self.set_state(MonitorState::Idle);
            return;
        }

        match self.pressure().await {
            Ok(true) => {
                self.set_state(MonitorState::Pressure);
                self.relieve_pressure().await;
            }
            Ok(false) => self.set_state(MonitorState::Nominal),
            Err(e) => tracing::warn!("Pressure check failed, skipping cycle: {}", e),
        }
        self.set_state(MonitorState::Idle);
    }

    /// Unload models one at a time in eviction order until pressure clears
    /// or the candidate list is exhausted. Partial relief is acceptable;
    /// this never blocks indefinitely.
    pub async fn relieve_pressure(&self) {
        let residents = match self.residents().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Cannot relieve pressure, resident probe failed: {}", e);
                return;
            }
        };

        let pinned = self.pinned_set();
        let order = eviction::eviction_order(
            &residents,
            &pinned,
            &self.ledger,
            self.config.usage_window,
        );
        if order.is_empty() {
            tracing::debug!("Pressure but no eviction candidates (all pinned or none resident)");
            return;
        }

        for candidate in order {
            tracing::info!("Evicting {} to relieve memory pressure", candidate);
            if let Err(e) = self.exec.warm(&candidate, 0).await {
                tracing::warn!("Failed to unload {}: {}", candidate, e);
            }
            self.invalidate().await;

            match self.pressure().await {
                Ok(false) => {
                    tracing::info!("Memory pressure cleared");
                    return;
                }
                Ok(true) => continue,
                Err(e) => {
                    tracing::warn!("Pressure re-check failed, stopping eviction: {}", e);
                    return;
                }
            }
        }
        tracing::warn!("Eviction candidates exhausted, pressure may persist");
    }

    /// Make sure `model` is resident before a request hits it. Not forced,
    /// this relieves pressure first; a failed warm is soft (the service
    /// loads lazily on first real use).
    pub async fn ensure_loaded(&self, model: &str, force: bool) -> EnsureOutcome {
        match self.residents().await {
            Ok(residents) if residents.iter().any(|m| m.name == model) => {
                return EnsureOutcome::AlreadyResident;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Resident probe failed in ensure_loaded: {}", e),
        }

        if !force {
            if let Ok(true) = self.pressure().await {
                self.relieve_pressure().await;
            }
        }

        match self.exec.warm(model, self.config.keep_alive_secs).await {
            Ok(()) => {
                self.invalidate().await;
                EnsureOutcome::Warmed
            }
            Err(e) => {
                tracing::warn!("Warm failed for {} (continuing lazily): {}", model, e);
                EnsureOutcome::WarmFailed
            }
        }
    }

    /// Spawn the background monitor loop.
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.run_cycle().await,
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Residency monitor loop stopped");
        });
        MonitorHandle { handle, shutdown }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::MockExec;

    fn config(total_gb: f64, threshold: f64) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(60),
            cache_ttl: Duration::from_millis(50),
            pressure_threshold: threshold,
            source: PressureSource::ResidentSum,
            total_ram_gb: Some(total_gb),
            usage_window: chrono::Duration::hours(24),
            keep_alive_secs: 300,
        }
    }

    fn monitor_with(exec: Arc<MockExec>, cfg: MonitorConfig) -> ResidencyMonitor {
        ResidencyMonitor::new(exec, Arc::new(UsageLedger::in_memory()), cfg)
    }

    #[tokio::test]
    async fn test_residents_are_cached_within_ttl() {
        let exec = Arc::new(MockExec::with_residents(&[("a", 2.0)]));
        let monitor = monitor_with(Arc::clone(&exec), config(16.0, 0.85));

        assert_eq!(monitor.residents().await.unwrap().len(), 1);
        // Mutate behind the cache; within the TTL the old view is served.
        exec.residents.lock().unwrap().clear();
        assert_eq!(monitor.residents().await.unwrap().len(), 1);

        monitor.invalidate().await;
        assert_eq!(monitor.residents().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_pressure_from_resident_sum() {
        let exec = Arc::new(MockExec::with_residents(&[("a", 10.0), ("b", 5.0)]));
        let monitor = monitor_with(exec, config(16.0, 0.85));
        assert!(monitor.pressure().await.unwrap());

        let calm = Arc::new(MockExec::with_residents(&[("a", 2.0)]));
        let monitor = monitor_with(calm, config(16.0, 0.85));
        assert!(!monitor.pressure().await.unwrap());
    }

    #[tokio::test]
    async fn test_relief_stops_once_pressure_clears() {
        // 14 of 16 GB used; unloading the 6 GB model is enough.
        let exec = Arc::new(MockExec::with_residents(&[("big", 6.0), ("small", 8.0)]));
        let ledger = Arc::new(UsageLedger::in_memory());
        ledger.record_use("small"); // "big" is least used, goes first
        let monitor = ResidencyMonitor::new(
            Arc::clone(&exec) as Arc<dyn ExecutionService>,
            ledger,
            config(16.0, 0.85),
        );

        monitor.relieve_pressure().await;

        let unloaded = exec.unloaded.lock().unwrap().clone();
        assert_eq!(unloaded, vec!["big"]);
        assert!(!monitor.pressure().await.unwrap());
    }

    #[tokio::test]
    async fn test_pinned_model_survives_relief() {
        let exec = Arc::new(MockExec::with_residents(&[("pinned", 10.0), ("other", 5.0)]));
        let monitor = monitor_with(Arc::clone(&exec), config(16.0, 0.85));

        let _guard = monitor.pin("pinned");
        monitor.relieve_pressure().await;

        let unloaded = exec.unloaded.lock().unwrap().clone();
        assert!(!unloaded.contains(&"pinned".to_string()));
        assert!(unloaded.contains(&"other".to_string()));
    }

    #[tokio::test]
    async fn test_pin_guard_released_on_drop() {
        let exec = Arc::new(MockExec::new());
        let monitor = monitor_with(exec, config(16.0, 0.85));

        {
            let _a = monitor.pin("m");
            let _b = monitor.pin("m");
            assert!(monitor.pinned_set().contains("m"));
        }
        assert!(monitor.pinned_set().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_skips_cycle_without_eviction() {
        let exec = Arc::new(MockExec::with_residents(&[("a", 100.0)]));
        exec.fail_list
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let monitor = monitor_with(Arc::clone(&exec), config(16.0, 0.85));

        monitor.run_cycle().await;

        assert!(exec.unloaded.lock().unwrap().is_empty());
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_cycle_relieves_pressure() {
        let exec = Arc::new(MockExec::with_residents(&[("a", 15.0)]));
        let monitor = monitor_with(Arc::clone(&exec), config(16.0, 0.85));

        monitor.run_cycle().await;

        assert_eq!(exec.unloaded.lock().unwrap().clone(), vec!["a"]);
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_ensure_loaded_short_circuits_when_resident() {
        let exec = Arc::new(MockExec::with_residents(&[("m", 2.0)]));
        let monitor = monitor_with(exec, config(16.0, 0.85));
        assert_eq!(
            monitor.ensure_loaded("m", false).await,
            EnsureOutcome::AlreadyResident
        );
    }

    #[tokio::test]
    async fn test_ensure_loaded_warms_and_soft_fails() {
        let exec = Arc::new(MockExec::new());
        let monitor = monitor_with(Arc::clone(&exec), config(16.0, 0.85));
        assert_eq!(
            monitor.ensure_loaded("m", false).await,
            EnsureOutcome::Warmed
        );
        assert_eq!(
            monitor.ensure_loaded("m", false).await,
            EnsureOutcome::AlreadyResident
        );

        let failing = Arc::new(MockExec::new());
        failing
            .fail_warm
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let monitor = monitor_with(failing, config(16.0, 0.85));
        assert_eq!(
            monitor.ensure_loaded("m", false).await,
            EnsureOutcome::WarmFailed
        );
    }

    #[tokio::test]
    async fn test_ensure_loaded_relieves_pressure_first() {
        let exec = Arc::new(MockExec::with_residents(&[("old", 15.0)]));
        let monitor = monitor_with(Arc::clone(&exec), config(16.0, 0.85));

        assert_eq!(
            monitor.ensure_loaded("new", false).await,
            EnsureOutcome::Warmed
        );
        assert_eq!(exec.unloaded.lock().unwrap().clone(), vec!["old"]);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_cleanly() {
        let exec = Arc::new(MockExec::new());
        let monitor = Arc::new(monitor_with(exec, config(16.0, 0.85)));
        let handle = monitor.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;
    }
}
