//! Performance recorder
//!
//! Append-only log of per-invocation duration, throughput and success,
//! keyed by (model, task type). Samples are only ever read back for
//! summaries; they are never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::storage::{load_json_or_default, write_json_atomic};
use crate::types::TaskType;

/// One recorded invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub model: String,
    pub task_type: TaskType,
    pub duration_secs: f64,
    pub token_count: u64,
    pub tokens_per_second: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceSample {
    pub fn new(
        model: &str,
        task_type: TaskType,
        duration_secs: f64,
        token_count: u64,
        success: bool,
    ) -> Self {
        let tokens_per_second = if duration_secs > 0.0 {
            token_count as f64 / duration_secs
        } else {
            0.0
        };
        Self {
            model: model.to_string(),
            task_type,
            duration_secs,
            token_count,
            tokens_per_second,
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate view over the samples for one (model, task type) pair.
#[derive(Debug, Clone, Serialize)]
pub struct PerfSummary {
    pub samples: u64,
    pub success_rate: f64,
    pub mean_duration_secs: f64,
    pub mean_tokens_per_second: f64,
}

/// Append-only performance log.
pub struct PerformanceLog {
    samples: Mutex<Vec<PerformanceSample>>,
    path: Option<PathBuf>,
}

impl PerformanceLog {
    pub fn in_memory() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            path: None,
        }
    }

    pub fn open(path: PathBuf) -> Self {
        let loaded: Vec<PerformanceSample> = match load_json_or_default(&path) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!("Failed to load performance log from {:?}: {}", path, e);
                Vec::new()
            }
        };
        Self {
            samples: Mutex::new(loaded),
            path: Some(path),
        }
    }

    /// Append a sample and persist. A write failure is logged and the
    /// in-memory log remains authoritative.
    pub fn record(&self, sample: PerformanceSample) {
        let mut samples = self.samples.lock().unwrap();
        samples.push(sample);
        if let Some(path) = &self.path {
            if let Err(e) = write_json_atomic(path, &*samples) {
                tracing::warn!("Failed to persist performance log to {:?}: {}", path, e);
            }
        }
    }

    /// Summary for one (model, task type) pair; `None` when no samples
    /// were recorded for it.
    pub fn summary(&self, model: &str, task_type: TaskType) -> Option<PerfSummary> {
        let samples = self.samples.lock().unwrap();
        let matching: Vec<&PerformanceSample> = samples
            .iter()
            .filter(|s| s.model == model && s.task_type == task_type)
            .collect();
        if matching.is_empty() {
            return None;
        }
        let n = matching.len() as f64;
        let successes = matching.iter().filter(|s| s.success).count() as f64;
        Some(PerfSummary {
            samples: matching.len() as u64,
            success_rate: successes / n,
            mean_duration_secs: matching.iter().map(|s| s.duration_secs).sum::<f64>() / n,
            mean_tokens_per_second: matching.iter().map(|s| s.tokens_per_second).sum::<f64>() / n,
        })
    }

    /// Summaries for every task type recorded against `model`.
    pub fn summaries_for(&self, model: &str) -> Vec<(TaskType, PerfSummary)> {
        let task_types: Vec<TaskType> = {
            let samples = self.samples.lock().unwrap();
            let mut seen = Vec::new();
            for s in samples.iter().filter(|s| s.model == model) {
                if !seen.contains(&s.task_type) {
                    seen.push(s.task_type);
                }
            }
            seen
        };
        task_types
            .into_iter()
            .filter_map(|t| self.summary(model, t).map(|s| (t, s)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_derives_throughput() {
        let s = PerformanceSample::new("m", TaskType::Chat, 2.0, 100, true);
        assert_eq!(s.tokens_per_second, 50.0);

        let zero = PerformanceSample::new("m", TaskType::Chat, 0.0, 100, true);
        assert_eq!(zero.tokens_per_second, 0.0);
    }

    #[test]
    fn test_summary_aggregates_matching_samples() {
        let log = PerformanceLog::in_memory();
        log.record(PerformanceSample::new("m", TaskType::Chat, 1.0, 100, true));
        log.record(PerformanceSample::new("m", TaskType::Chat, 3.0, 300, false));
        log.record(PerformanceSample::new("m", TaskType::Coding, 9.0, 10, true));
        log.record(PerformanceSample::new("other", TaskType::Chat, 9.0, 10, true));

        let summary = log.summary("m", TaskType::Chat).unwrap();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.success_rate, 0.5);
        assert_eq!(summary.mean_duration_secs, 2.0);

        assert!(log.summary("m", TaskType::Review).is_none());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.json");

        let log = PerformanceLog::open(path.clone());
        log.record(PerformanceSample::new("m", TaskType::Chat, 1.0, 100, true));

        let reloaded = PerformanceLog::open(path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.summary("m", TaskType::Chat).is_some());
    }
}
