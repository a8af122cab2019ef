//! Usage ledger
//!
//! Tracks per-model invocation counts and last-used timestamps, persisted
//! after every mutation. A persistence failure is never fatal: the
//! in-memory state stays authoritative for the running process.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::storage::{load_json_or_default, write_json_atomic};

/// How far back per-invocation timestamps are retained. Anything older can
/// no longer influence a windowed frequency query (default window is 24h).
const RECENT_HORIZON_HOURS: i64 = 48;

/// Usage state for one model. Counts only increase; `last_used` is
/// monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub invocations: u64,
    pub last_used: DateTime<Utc>,
    /// Recent invocation timestamps, pruned to the retention horizon.
    #[serde(default)]
    pub recent: Vec<DateTime<Utc>>,
}

/// Persistent per-model usage ledger.
pub struct UsageLedger {
    records: DashMap<String, UsageRecord>,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl UsageLedger {
    /// Ledger without persistence. Used by tests and ephemeral setups.
    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open a ledger backed by a JSON file. A missing file is an empty
    /// ledger.
    pub fn open(path: PathBuf) -> Self {
        let loaded: HashMap<String, UsageRecord> = match load_json_or_default(&path) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("Failed to load usage ledger from {:?}: {}", path, e);
                HashMap::new()
            }
        };
        let records = DashMap::new();
        for (model, record) in loaded {
            records.insert(model, record);
        }
        Self {
            records,
            path: Some(path),
            persist_lock: Mutex::new(()),
        }
    }

    /// Record one invocation of `model`, creating the record if absent.
    pub fn record_use(&self, model: &str) {
        let now = Utc::now();
        let horizon = now - Duration::hours(RECENT_HORIZON_HOURS);
        {
            let mut entry = self
                .records
                .entry(model.to_string())
                .or_insert_with(|| UsageRecord {
                    invocations: 0,
                    last_used: now,
                    recent: Vec::new(),
                });
            entry.invocations += 1;
            if now > entry.last_used {
                entry.last_used = now;
            }
            entry.recent.push(now);
            entry.recent.retain(|t| *t >= horizon);
        }
        self.persist();
    }

    /// Number of invocations of `model` within the trailing `window`.
    /// Returns 0 when the model was not used inside the window, even if a
    /// record exists.
    pub fn frequency(&self, model: &str, window: Duration) -> u64 {
        let cutoff = Utc::now() - window;
        self.records
            .get(model)
            .map(|r| r.recent.iter().filter(|t| **t >= cutoff).count() as u64)
            .unwrap_or(0)
    }

    pub fn last_used(&self, model: &str) -> Option<DateTime<Utc>> {
        self.records.get(model).map(|r| r.last_used)
    }

    /// The candidate with the highest windowed frequency, in candidate
    /// order on ties. `None` when nothing was used inside the window.
    pub fn most_frequent(&self, candidates: &[String], window: Duration) -> Option<String> {
        let mut best: Option<(String, u64)> = None;
        for model in candidates {
            let count = self.frequency(model, window);
            if count == 0 {
                continue;
            }
            match &best {
                Some((_, top)) if *top >= count => {}
                _ => best = Some((model.clone(), count)),
            }
        }
        best.map(|(model, _)| model)
    }

    /// Current state of every record, for stats reporting.
    pub fn snapshot(&self) -> HashMap<String, UsageRecord> {
        self.records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap();
        let map = self.snapshot();
        if let Err(e) = write_json_atomic(path, &map) {
            tracing::warn!("Failed to persist usage ledger to {:?}: {}", path, e);
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_record(&self, model: &str, record: UsageRecord) {
        self.records.insert(model.to_string(), record);
    }
}
