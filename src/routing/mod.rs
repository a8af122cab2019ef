//! Task routing
//!
//! Maps a (task type, hardware tier, installed models) tuple to one
//! preferred model. Selection is deterministic: a per-task preference
//! table is consulted first, then size and usage heuristics over the
//! tier-eligible candidates.

use chrono::Duration;
use std::sync::Arc;

use crate::storage::ledger::UsageLedger;
use crate::types::{FleetError, ModelCatalog, TaskCategory, TaskType, Tier};

/// Preferred models per task type, best first. Entries not installed or
/// not tier-eligible are skipped.
fn preference_table(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        TaskType::Autocomplete => &["qwen2.5-coder:1.5b", "llama3.2:1b", "llama3.2:3b"],
        TaskType::Coding => &["qwen2.5-coder:32b", "qwen2.5-coder:7b", "llama3.1:8b"],
        TaskType::Refactoring => &["qwen2.5-coder:32b", "qwen2.5:14b", "qwen2.5-coder:7b"],
        TaskType::Chat => &["llama3.2:3b", "llama3.1:8b", "qwen2.5:14b"],
        TaskType::Review | TaskType::Testing => {
            &["qwen2.5:14b", "qwen2.5-coder:7b", "llama3.1:8b"]
        }
        TaskType::Documentation => &["llama3.1:8b", "llama3.2:3b"],
        TaskType::Creative => &["llama3.3:70b", "llama3.1:8b", "llama3.2:3b"],
    }
}

/// Deterministic model selection over the installed set.
pub struct TaskRouter {
    catalog: Arc<ModelCatalog>,
    ledger: Arc<UsageLedger>,
    usage_window: Duration,
}

impl TaskRouter {
    pub fn new(catalog: Arc<ModelCatalog>, ledger: Arc<UsageLedger>, usage_window: Duration) -> Self {
        Self {
            catalog,
            ledger,
            usage_window,
        }
    }

    /// Pick the model to serve `task_type` on `tier` from `installed`.
    /// Fails only when `installed` is empty.
    pub fn select_model(
        &self,
        task_type: TaskType,
        tier: Tier,
        installed: &[String],
    ) -> Result<String, FleetError> {
        if installed.is_empty() {
            return Err(FleetError::NotFound(format!(
                "no model available for task {:?}",
                task_type
            )));
        }

        let max_ram = tier.max_model_ram_gb();
        let eligible: Vec<String> = installed
            .iter()
            .filter(|name| self.catalog.ram_estimate(name) <= max_ram)
            .cloned()
            .collect();

        if eligible.is_empty() {
            // Nothing passes the tier gate; degrade to the smallest
            // installed model rather than refusing the request.
            let smallest = self.smallest(installed).unwrap_or_else(|| installed[0].clone());
            tracing::warn!(
                "No tier-{:?}-eligible model installed, degrading to {}",
                tier,
                smallest
            );
            return Ok(smallest);
        }

        for preferred in preference_table(task_type) {
            if eligible.iter().any(|m| m == preferred) {
                return Ok(preferred.to_string());
            }
        }

        let selected = match task_type.category() {
            TaskCategory::Simple => self.smallest(&eligible),
            TaskCategory::Complex | TaskCategory::Refactoring => self.largest(&eligible),
            TaskCategory::Moderate => self.ledger.most_frequent(&eligible, self.usage_window),
        };
        Ok(selected.unwrap_or_else(|| eligible[0].clone()))
    }

    fn smallest(&self, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                self.catalog
                    .ram_estimate(a)
                    .partial_cmp(&self.catalog.ram_estimate(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    fn largest(&self, candidates: &[String]) -> Option<String> {
        candidates
            .iter()
            .max_by(|a, b| {
                self.catalog
                    .ram_estimate(a)
                    .partial_cmp(&self.catalog.ram_estimate(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}
