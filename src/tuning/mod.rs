//! Parameter tuning
//!
//! Derives per-invocation inference options from hardware tier, model
//! role, task type and prompt length. The default tuner is a pure
//! function; the adaptive tuner additionally consults recorded
//! performance for the (model, task) pair. The strategy is picked once at
//! service construction.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::perf::PerformanceLog;
use crate::types::{ModelRole, TaskCategory, TaskType, Tier};

/// Context is never tuned below this, whatever the scaling says.
const MIN_CONTEXT: u32 = 2048;

/// Refactoring tasks may scale past the base, up to this hard cap, before
/// the final never-exceed-tier-base clamp.
const REFACTOR_CONTEXT_CAP: u32 = 32768;

/// Inference options for one invocation. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningProfile {
    pub context_size: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub keep_alive_secs: i64,
    pub gpu_layers: u32,
    pub num_threads: u32,
}

/// Everything a tuner may look at.
#[derive(Debug, Clone)]
pub struct TuneRequest {
    pub tier: Tier,
    pub role: ModelRole,
    pub task_type: TaskType,
    /// Estimated prompt length in tokens.
    pub prompt_tokens: u32,
    /// Force near-greedy sampling regardless of role and task.
    pub deterministic: bool,
    /// Model the request will run on, when already routed. Only the
    /// adaptive tuner uses this.
    pub model: Option<String>,
}

/// Tuning strategy.
pub trait Tuner: Send + Sync {
    fn tune(&self, request: &TuneRequest) -> TuningProfile;
}

/// Pure table-driven tuner.
pub struct DefaultTuner {
    keep_alive_secs: i64,
}

impl DefaultTuner {
    pub fn new(keep_alive_secs: i64) -> Self {
        Self { keep_alive_secs }
    }
}

impl Tuner for DefaultTuner {
    fn tune(&self, request: &TuneRequest) -> TuningProfile {
        let base = request.tier.context_base();

        let mut context = match request.task_type.category() {
            TaskCategory::Simple => (base / 4).max(MIN_CONTEXT),
            TaskCategory::Moderate => base / 2,
            TaskCategory::Complex => base,
            TaskCategory::Refactoring => ((base / 4) * 5).min(REFACTOR_CONTEXT_CAP),
        };

        // Make room for the prompt when the scaled context is too tight,
        // without ever exceeding the tier base.
        let needed = request.prompt_tokens.saturating_mul(2);
        if context < needed {
            context = needed.min(base);
        }
        context = context.min(base);

        let max_tokens = (context / 8).clamp(512, 4096);

        let mut temperature = request.role.base_temperature();
        temperature = match request.task_type {
            TaskType::Review | TaskType::Testing => (temperature * 0.6).max(0.1),
            TaskType::Creative | TaskType::Coding => (temperature * 1.1).min(1.0),
            TaskType::Documentation => temperature,
            _ => temperature,
        };
        if request.deterministic {
            temperature = 0.1;
        }

        TuningProfile {
            context_size: context,
            max_tokens,
            temperature,
            top_p: request.role.base_top_p(),
            keep_alive_secs: self.keep_alive_secs,
            gpu_layers: request.tier.gpu_layers(),
            num_threads: request.tier.num_threads(),
        }
    }
}

/// Tuner that shrinks its ask when the performance log shows the
/// (model, task) pair struggling.
pub struct AdaptiveTuner {
    base: DefaultTuner,
    perf: Arc<PerformanceLog>,
}

/// Summaries with fewer samples than this are ignored.
const MIN_SAMPLES: u64 = 3;

/// Below this throughput the context is stepped down.
const SLOW_TOKENS_PER_SEC: f64 = 5.0;

impl AdaptiveTuner {
    pub fn new(keep_alive_secs: i64, perf: Arc<PerformanceLog>) -> Self {
        Self {
            base: DefaultTuner::new(keep_alive_secs),
            perf,
        }
    }
}

impl Tuner for AdaptiveTuner {
    fn tune(&self, request: &TuneRequest) -> TuningProfile {
        let mut profile = self.base.tune(request);

        let Some(model) = &request.model else {
            return profile;
        };
        let Some(summary) = self.perf.summary(model, request.task_type) else {
            return profile;
        };
        if summary.samples < MIN_SAMPLES {
            return profile;
        }

        if summary.success_rate < 0.5 {
            tracing::debug!(
                "Adaptive tuning: {} struggling on {:?} (success rate {:.2}), backing off",
                model,
                request.task_type,
                summary.success_rate
            );
            profile.temperature = (profile.temperature * 0.8).max(0.1);
            profile.context_size = (profile.context_size / 2).max(MIN_CONTEXT);
            profile.max_tokens = (profile.context_size / 8).clamp(512, 4096);
        } else if summary.mean_tokens_per_second < SLOW_TOKENS_PER_SEC {
            profile.context_size = (profile.context_size / 2).max(MIN_CONTEXT);
            profile.max_tokens = (profile.context_size / 8).clamp(512, 4096);
        }

        profile
    }
}
