//! Model execution service boundary
//!
//! The crate never runs inference itself; it orchestrates calls to an
//! external execution service behind the [`ExecutionService`] trait. The
//! HTTP implementation lives in [`http`]; tests substitute mocks.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::types::{ErrorKind, FleetError};

/// Inference options forwarded to the execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub context_size: u32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// Seconds the service should keep the model resident after the call.
    /// 0 unloads immediately, -1 keeps it indefinitely.
    pub keep_alive_secs: i64,
}

/// Result of a generate call.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub duration: Duration,
    /// Generated token count when the service reports it.
    pub eval_tokens: Option<u64>,
}

/// A model the service currently holds in memory.
#[derive(Debug, Clone, Deserialize)]
pub struct ResidentModelInfo {
    pub name: String,
    pub ram_gb: f64,
}

/// External model execution service.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Currently resident models with their reported memory.
    async fn list(&self) -> Result<Vec<ResidentModelInfo>, FleetError>;

    /// Run a prompt against a model.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, FleetError>;

    /// Best-effort preload. `keep_alive_secs = 0` asks the service to drop
    /// the model instead, which is how eviction unloads.
    async fn warm(&self, model: &str, keep_alive_secs: i64) -> Result<(), FleetError>;
}

/// Bounded exponential backoff for retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): base * 2^(n-1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `op`, retrying per the error taxonomy: transient failures retry up
/// to the attempt cap with exponential backoff, unknown failures retry
/// exactly once, everything else fails immediately.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, FleetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FleetError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let cap = match e.kind() {
                    ErrorKind::Transient => policy.max_attempts,
                    ErrorKind::Unknown => 2.min(policy.max_attempts),
                    _ => 1,
                };
                if attempt >= cap {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "Attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    cap,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Scriptable in-memory execution service for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// What a mock `generate` call should do for a given model.
    #[derive(Clone)]
    pub enum MockBehavior {
        Reply {
            text: String,
            duration_ms: u64,
            delay_ms: u64,
        },
        Fail(ErrorKind),
    }

    pub struct MockExec {
        pub residents: Mutex<Vec<ResidentModelInfo>>,
        pub fail_list: AtomicBool,
        pub fail_warm: AtomicBool,
        pub behaviors: Mutex<HashMap<String, MockBehavior>>,
        pub unloaded: Mutex<Vec<String>>,
        pub generate_calls: Mutex<Vec<String>>,
    }

    impl MockExec {
        pub fn new() -> Self {
            Self {
                residents: Mutex::new(Vec::new()),
                fail_list: AtomicBool::new(false),
                fail_warm: AtomicBool::new(false),
                behaviors: Mutex::new(HashMap::new()),
                unloaded: Mutex::new(Vec::new()),
                generate_calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_residents(models: &[(&str, f64)]) -> Self {
            let exec = Self::new();
            {
                let mut residents = exec.residents.lock().unwrap();
                for (name, ram_gb) in models {
                    residents.push(ResidentModelInfo {
                        name: name.to_string(),
                        ram_gb: *ram_gb,
                    });
                }
            }
            exec
        }

        pub fn set_behavior(&self, model: &str, behavior: MockBehavior) {
            self.behaviors
                .lock()
                .unwrap()
                .insert(model.to_string(), behavior);
        }
    }

    #[async_trait]
    impl ExecutionService for MockExec {
        async fn list(&self) -> Result<Vec<ResidentModelInfo>, FleetError> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(FleetError::Transient("list: connection refused".into()));
            }
            Ok(self.residents.lock().unwrap().clone())
        }

        async fn generate(
            &self,
            model: &str,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<GenerateOutcome, FleetError> {
            self.generate_calls.lock().unwrap().push(model.to_string());
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(model)
                .cloned()
                .unwrap_or(MockBehavior::Reply {
                    text: "ok".into(),
                    duration_ms: 10,
                    delay_ms: 0,
                });
            match behavior {
                MockBehavior::Reply {
                    text,
                    duration_ms,
                    delay_ms,
                } => {
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    Ok(GenerateOutcome {
                        text: text.clone(),
                        duration: Duration::from_millis(duration_ms),
                        eval_tokens: Some(text.len() as u64),
                    })
                }
                MockBehavior::Fail(kind) => Err(match kind {
                    ErrorKind::NotFound => FleetError::NotFound(model.to_string()),
                    ErrorKind::ResourceExhausted => {
                        FleetError::ResourceExhausted(model.to_string())
                    }
                    ErrorKind::Transient => FleetError::Transient(model.to_string()),
                    ErrorKind::Auth => FleetError::Auth(model.to_string()),
                    ErrorKind::Unknown => FleetError::Unknown(model.to_string()),
                }),
            }
        }

        async fn warm(&self, model: &str, keep_alive_secs: i64) -> Result<(), FleetError> {
            if self.fail_warm.load(Ordering::SeqCst) {
                return Err(FleetError::Transient(format!("{}: warm refused", model)));
            }
            let mut residents = self.residents.lock().unwrap();
            if keep_alive_secs == 0 {
                residents.retain(|m| m.name != model);
                self.unloaded.lock().unwrap().push(model.to_string());
            } else if !residents.iter().any(|m| m.name == model) {
                residents.push(ResidentModelInfo {
                    name: model.to_string(),
                    ram_gb: 1.0,
                });
            }
            Ok(())
        }
    }
}
