//! Ensemble execution
//!
//! Fans one prompt out to several models concurrently, each with its own
//! tuned parameters and a bounded timeout, then merges the survivors
//! under a selectable strategy. Partial failures are tolerated; the call
//! fails only when every member does.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::exec::{ExecutionService, GenerateOptions};
use crate::residency::ResidencyMonitor;
use crate::tuning::{TuneRequest, Tuner};
use crate::types::{FleetError, ModelCatalog, ModelRole, TaskType, Tier};

/// How member responses are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineStrategy {
    /// Response from the largest successful model wins.
    Weighted,
    /// Longest response not dominated by short-substring repetition.
    Majority,
    /// Fastest successful response wins.
    Best,
    /// De-duplicated line-level concatenation, first-seen order.
    Merge,
}

impl FromStr for CombineStrategy {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weighted" => Ok(CombineStrategy::Weighted),
            "majority" => Ok(CombineStrategy::Majority),
            "best" => Ok(CombineStrategy::Best),
            "merge" => Ok(CombineStrategy::Merge),
            other => Err(FleetError::NotFound(format!(
                "unknown combine strategy: {}",
                other
            ))),
        }
    }
}

/// One successful member response.
#[derive(Debug, Clone)]
pub struct EnsembleMember {
    pub model: String,
    pub text: String,
    pub duration: Duration,
    pub ram_gb: f64,
}

/// Combined result plus the raw member data it came from.
#[derive(Debug, Clone)]
pub struct EnsembleOutcome {
    pub text: String,
    pub members: Vec<EnsembleMember>,
    /// (model, error) for members that failed or timed out.
    pub failures: Vec<(String, String)>,
}

/// Below this distinct-token ratio a response counts as degenerate
/// repetition and is skipped by the majority strategy.
const REPETITION_FLOOR: f64 = 0.3;

fn repetition_dominated(text: &str) -> bool {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() < 8 {
        return false;
    }
    let distinct: std::collections::HashSet<&str> = tokens.iter().copied().collect();
    (distinct.len() as f64) / (tokens.len() as f64) < REPETITION_FLOOR
}

/// Runs ensembles against the execution service.
pub struct EnsembleExecutor {
    exec: Arc<dyn ExecutionService>,
    catalog: Arc<ModelCatalog>,
    monitor: Arc<ResidencyMonitor>,
    tuner: Arc<dyn Tuner>,
    tier: Tier,
    member_timeout: Duration,
}

impl EnsembleExecutor {
    pub fn new(
        exec: Arc<dyn ExecutionService>,
        catalog: Arc<ModelCatalog>,
        monitor: Arc<ResidencyMonitor>,
        tuner: Arc<dyn Tuner>,
        tier: Tier,
        member_timeout: Duration,
    ) -> Self {
        Self {
            exec,
            catalog,
            monitor,
            tuner,
            tier,
            member_timeout,
        }
    }

    fn role_for(&self, model: &str) -> ModelRole {
        self.catalog
            .get(model)
            .and_then(|m| m.roles.first().copied())
            .unwrap_or(ModelRole::Chat)
    }

    /// Execute `prompt` on every model concurrently and combine.
    pub async fn run(
        &self,
        prompt: &str,
        task_type: TaskType,
        models: &[String],
        strategy: CombineStrategy,
    ) -> Result<EnsembleOutcome, FleetError> {
        if models.is_empty() {
            return Err(FleetError::NotFound("ensemble with no models".into()));
        }
        tracing::info!(
            "Running {:?} ensemble across {} model(s)",
            strategy,
            models.len()
        );

        let prompt_tokens = crate::context::estimate_tokens(prompt);
        let mut handles = Vec::with_capacity(models.len());
        for model in models {
            let profile = self.tuner.tune(&TuneRequest {
                tier: self.tier,
                role: self.role_for(model),
                task_type,
                prompt_tokens,
                deterministic: false,
                model: Some(model.clone()),
            });
            let options = GenerateOptions {
                context_size: profile.context_size,
                max_tokens: profile.max_tokens,
                temperature: profile.temperature,
                top_p: profile.top_p,
                keep_alive_secs: profile.keep_alive_secs,
            };

            let exec = Arc::clone(&self.exec);
            let monitor = Arc::clone(&self.monitor);
            let model = model.clone();
            let prompt = prompt.to_string();
            let timeout = self.member_timeout;
            let ram_gb = self.catalog.ram_estimate(&model);

            handles.push(tokio::spawn(async move {
                let _pin = monitor.pin(&model);
                // Best effort; the service also loads lazily on generate.
                monitor.ensure_loaded(&model, false).await;

                let result =
                    tokio::time::timeout(timeout, exec.generate(&model, &prompt, &options)).await;
                let member = match result {
                    Ok(Ok(outcome)) => Ok(EnsembleMember {
                        model: model.clone(),
                        text: outcome.text,
                        duration: outcome.duration,
                        ram_gb,
                    }),
                    Ok(Err(e)) => Err(format!("{}", e)),
                    Err(_) => Err(format!("timed out after {:?}", timeout)),
                };
                (model, member)
            }));
        }

        let mut members = Vec::new();
        let mut failures = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(member))) => members.push(member),
                Ok((model, Err(reason))) => {
                    tracing::warn!("Ensemble member {} failed: {}", model, reason);
                    failures.push((model, reason));
                }
                Err(e) => failures.push(("<task>".to_string(), format!("{}", e))),
            }
        }

        if members.is_empty() {
            return Err(FleetError::Unknown(format!(
                "no successful response from any of: {}",
                models.join(", ")
            )));
        }

        let text = combine(&members, strategy);
        Ok(EnsembleOutcome {
            text,
            members,
            failures,
        })
    }
}

fn combine(members: &[EnsembleMember], strategy: CombineStrategy) -> String {
    match strategy {
        CombineStrategy::Weighted => members
            .iter()
            .max_by(|a, b| {
                a.ram_gb
                    .partial_cmp(&b.ram_gb)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|m| m.text.clone())
            .unwrap_or_default(),
        CombineStrategy::Majority => {
            let clean = members
                .iter()
                .filter(|m| !repetition_dominated(&m.text))
                .max_by_key(|m| m.text.len());
            clean
                .or_else(|| members.iter().max_by_key(|m| m.text.len()))
                .map(|m| m.text.clone())
                .unwrap_or_default()
        }
        CombineStrategy::Best => members
            .iter()
            .min_by_key(|m| m.duration)
            .map(|m| m.text.clone())
            .unwrap_or_default(),
        CombineStrategy::Merge => {
            let mut seen = std::collections::HashSet::new();
            let mut lines = Vec::new();
            for member in members {
                for line in member.text.lines() {
                    if seen.insert(line.to_string()) {
                        lines.push(line.to_string());
                    }
                }
            }
            lines.join("\n")
        }
    }
}
