//! Fleet coordinator
//!
//! The single service object that owns the catalog, the stores, the
//! residency monitor and the execution client, and wires them into the
//! request paths: route, tune, compress, generate, record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::FleetConfig;
use crate::context;
use crate::ensemble::{CombineStrategy, EnsembleExecutor, EnsembleOutcome};
use crate::exec::http::HttpExecutionService;
use crate::exec::{with_retries, ExecutionService, GenerateOptions, RetryPolicy};
use crate::queue::{BatchStrategy, ItemOutcome, RequestQueue};
use crate::residency::{MonitorHandle, ResidencyMonitor};
use crate::routing::TaskRouter;
use crate::storage;
use crate::storage::ledger::UsageLedger;
use crate::storage::perf::{PerfSummary, PerformanceLog, PerformanceSample};
use crate::tuning::{AdaptiveTuner, DefaultTuner, TuneRequest, Tuner};
use crate::types::{ErrorKind, FleetError, ModelCatalog, ModelRole, TaskType};

/// Usage and performance view over one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub invocations: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub windowed_frequency: u64,
    pub perf: Vec<(TaskType, PerfSummary)>,
}

/// Fleet-wide summary returned by [`FleetService::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct FleetStats {
    pub models: Vec<ModelStats>,
    pub queue_depth: usize,
    pub dead_letters: usize,
}

/// Coordinating service for the model fleet.
pub struct FleetService {
    config: FleetConfig,
    catalog: Arc<ModelCatalog>,
    exec: Arc<dyn ExecutionService>,
    ledger: Arc<UsageLedger>,
    perf: Arc<PerformanceLog>,
    queue: Arc<RequestQueue>,
    monitor: Arc<ResidencyMonitor>,
    router: TaskRouter,
    tuner: Arc<dyn Tuner>,
    ensemble: EnsembleExecutor,
    retry: RetryPolicy,
}

impl FleetService {
    /// Build a fleet against the HTTP execution service with persistent
    /// stores under the data directory.
    pub fn new(config: FleetConfig) -> Result<Self, FleetError> {
        let exec: Arc<dyn ExecutionService> = Arc::new(HttpExecutionService::new(
            config.exec_base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?);

        let data_dir: PathBuf = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => storage::get_data_dir()
                .map_err(|e| FleetError::Unknown(format!("data dir: {}", e)))?,
        };
        let ledger = Arc::new(UsageLedger::open(data_dir.join("usage.json")));
        let perf = Arc::new(PerformanceLog::open(data_dir.join("perf.json")));
        let queue = Arc::new(RequestQueue::open(
            data_dir.join("queue.json"),
            config.queue_config(),
        ));
        Ok(Self::assemble(config, exec, ledger, perf, queue))
    }

    /// Build a fleet around an arbitrary execution service with in-memory
    /// stores. Used by tests and embedders that manage persistence
    /// themselves.
    pub fn with_exec(config: FleetConfig, exec: Arc<dyn ExecutionService>) -> Self {
        let ledger = Arc::new(UsageLedger::in_memory());
        let perf = Arc::new(PerformanceLog::in_memory());
        let queue = Arc::new(RequestQueue::in_memory(config.queue_config()));
        Self::assemble(config, exec, ledger, perf, queue)
    }

    fn assemble(
        config: FleetConfig,
        exec: Arc<dyn ExecutionService>,
        ledger: Arc<UsageLedger>,
        perf: Arc<PerformanceLog>,
        queue: Arc<RequestQueue>,
    ) -> Self {
        let catalog = Arc::new(match &config.catalog_path {
            Some(path) => ModelCatalog::load(path),
            None => ModelCatalog::default(),
        });

        let monitor = Arc::new(ResidencyMonitor::new(
            Arc::clone(&exec),
            Arc::clone(&ledger),
            config.monitor_config(),
        ));

        let tuner: Arc<dyn Tuner> = if config.adaptive_tuning {
            Arc::new(AdaptiveTuner::new(config.keep_alive_secs, Arc::clone(&perf)))
        } else {
            Arc::new(DefaultTuner::new(config.keep_alive_secs))
        };

        let router = TaskRouter::new(
            Arc::clone(&catalog),
            Arc::clone(&ledger),
            config.usage_window(),
        );

        let ensemble = EnsembleExecutor::new(
            Arc::clone(&exec),
            Arc::clone(&catalog),
            Arc::clone(&monitor),
            Arc::clone(&tuner),
            config.tier,
            Duration::from_secs(config.ensemble_timeout_secs),
        );

        let retry = config.retry_policy();
        Self {
            config,
            catalog,
            exec,
            ledger,
            perf,
            queue,
            monitor,
            router,
            tuner,
            ensemble,
            retry,
        }
    }

    pub fn monitor(&self) -> &Arc<ResidencyMonitor> {
        &self.monitor
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    /// Start the background residency monitor loop.
    pub fn spawn_monitor(&self) -> MonitorHandle {
        self.monitor.spawn()
    }

    /// Route, tune, compress if needed, and run one request.
    pub async fn select_and_run(
        &self,
        task_type: TaskType,
        prompt: &str,
        role: ModelRole,
    ) -> Result<String, FleetError> {
        self.run_request(task_type, prompt, role, false).await
    }

    /// Same as [`Self::select_and_run`], forcing near-greedy sampling.
    pub async fn select_and_run_deterministic(
        &self,
        task_type: TaskType,
        prompt: &str,
        role: ModelRole,
    ) -> Result<String, FleetError> {
        self.run_request(task_type, prompt, role, true).await
    }

    async fn run_request(
        &self,
        task_type: TaskType,
        prompt: &str,
        role: ModelRole,
        deterministic: bool,
    ) -> Result<String, FleetError> {
        let installed = self.catalog.names();
        let model = self
            .router
            .select_model(task_type, self.config.tier, &installed)?;
        tracing::debug!("Routed {:?} request to {}", task_type, model);

        let _pin = self.monitor.pin(&model);
        self.monitor.ensure_loaded(&model, false).await;

        let profile = self.tuner.tune(&TuneRequest {
            tier: self.config.tier,
            role,
            task_type,
            prompt_tokens: context::estimate_tokens(prompt),
            deterministic,
            model: Some(model.clone()),
        });

        // Shrink the prompt to what fits beside the reserved output.
        let input_budget = profile.context_size.saturating_sub(profile.max_tokens);
        let prompt = context::compress(prompt, input_budget);

        let options = GenerateOptions {
            context_size: profile.context_size,
            max_tokens: profile.max_tokens,
            temperature: profile.temperature,
            top_p: profile.top_p,
            keep_alive_secs: profile.keep_alive_secs,
        };

        let started = std::time::Instant::now();
        let mut result = with_retries(&self.retry, || {
            self.exec.generate(&model, &prompt, &options)
        })
        .await;

        // Memory exhaustion gets one eviction pass and a single retry
        // before it is surfaced.
        if let Err(e) = &result {
            if e.kind() == ErrorKind::ResourceExhausted {
                tracing::warn!("{} exhausted memory, attempting eviction: {}", model, e);
                self.monitor.relieve_pressure().await;
                result = self.exec.generate(&model, &prompt, &options).await;
            }
        }

        self.ledger.record_use(&model);
        match result {
            Ok(outcome) => {
                let tokens = outcome
                    .eval_tokens
                    .unwrap_or_else(|| context::estimate_tokens(&outcome.text) as u64);
                self.perf.record(PerformanceSample::new(
                    &model,
                    task_type,
                    outcome.duration.as_secs_f64(),
                    tokens,
                    true,
                ));
                Ok(outcome.text)
            }
            Err(e) => {
                self.perf.record(PerformanceSample::new(
                    &model,
                    task_type,
                    started.elapsed().as_secs_f64(),
                    0,
                    false,
                ));
                Err(e)
            }
        }
    }

    /// Fan a prompt out to several models and combine the responses.
    pub async fn run_ensemble(
        &self,
        prompt: &str,
        task_type: TaskType,
        models: &[String],
        strategy: CombineStrategy,
    ) -> Result<EnsembleOutcome, FleetError> {
        let outcome = self.ensemble.run(prompt, task_type, models, strategy).await?;
        for member in &outcome.members {
            self.ledger.record_use(&member.model);
            let tokens = context::estimate_tokens(&member.text) as u64;
            self.perf.record(PerformanceSample::new(
                &member.model,
                task_type,
                member.duration.as_secs_f64(),
                tokens,
                true,
            ));
        }
        Ok(outcome)
    }

    /// Park a request in the durable queue.
    pub async fn enqueue(
        &self,
        prompt: &str,
        task_type: TaskType,
        priority: u8,
        role: ModelRole,
    ) -> Uuid {
        self.queue.enqueue(prompt, task_type, priority, role).await
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    /// Drain up to `batch_size` queued requests through the normal run
    /// path under the consumer lease.
    pub async fn process_queue(
        self: &Arc<Self>,
        batch_size: usize,
        strategy: BatchStrategy,
    ) -> Result<Vec<ItemOutcome>, FleetError> {
        let service = Arc::clone(self);
        self.queue
            .process_batch(batch_size, strategy, move |item| {
                let service = Arc::clone(&service);
                async move {
                    service
                        .select_and_run(item.task_type, &item.prompt, item.role)
                        .await
                }
            })
            .await
    }

    /// Usage and performance summaries, for one model or the whole
    /// catalog.
    pub async fn stats(&self, model: Option<&str>) -> FleetStats {
        let names: Vec<String> = match model {
            Some(name) => vec![name.to_string()],
            None => self.catalog.names(),
        };
        let usage = self.ledger.snapshot();
        let window = self.config.usage_window();

        let models = names
            .into_iter()
            .map(|name| {
                let record = usage.get(&name);
                ModelStats {
                    invocations: record.map(|r| r.invocations).unwrap_or(0),
                    last_used: record.map(|r| r.last_used),
                    windowed_frequency: self.ledger.frequency(&name, window),
                    perf: self.perf.summaries_for(&name),
                    model: name,
                }
            })
            .collect();

        FleetStats {
            models,
            queue_depth: self.queue.len().await,
            dead_letters: self.queue.dead_letters().await.len(),
        }
    }
}
