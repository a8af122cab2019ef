//! Request queue
//!
//! A durable, priority-ordered mailbox of pending generation requests.
//! The consumer side is guarded by a lease (owner id + expiry) instead of
//! a lock file: a crashed consumer's stale lease is reclaimed after its
//! TTL rather than awaited forever. Items are removed only on a terminal
//! outcome; repeat offenders land in a bounded dead-letter list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use uuid::Uuid;

use crate::storage::{load_json_or_default, write_json_atomic};
use crate::types::{ErrorKind, FleetError, ModelRole, TaskType};

/// A pending generation request. Ids are v7 UUIDs: unique and
/// time-ordered, never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub prompt: String,
    pub task_type: TaskType,
    pub role: ModelRole,
    /// 1 = highest, 10 = lowest.
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// An item that exhausted its retry budget, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Consumer lease. Held by at most one processor at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    items: Vec<QueueItem>,
    dead_letter: Vec<DeadLetter>,
    lease: Option<Lease>,
}

/// How a batch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    Sequential,
    /// All popped items run as concurrent tasks.
    Concurrent,
}

/// Terminal or intermediate status of one processed item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus {
    Completed(String),
    /// Failed retryably; waiting for a future batch.
    Requeued { attempts: u32 },
    DeadLettered { reason: String },
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub id: Uuid,
    pub status: ItemStatus,
}

/// Queue tuning knobs, extracted from the fleet config.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lease_ttl: chrono::Duration,
    pub max_attempts: u32,
    pub dead_letter_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: chrono::Duration::seconds(300),
            max_attempts: 3,
            dead_letter_cap: 50,
        }
    }
}

/// Durable FIFO-within-priority request store.
pub struct RequestQueue {
    state: tokio::sync::Mutex<QueueState>,
    path: Option<PathBuf>,
    config: QueueConfig,
}

impl RequestQueue {
    pub fn in_memory(config: QueueConfig) -> Self {
        Self {
            state: tokio::sync::Mutex::new(QueueState::default()),
            path: None,
            config,
        }
    }

    /// Open a queue backed by a JSON file; a missing file is an empty
    /// queue.
    pub fn open(path: PathBuf, config: QueueConfig) -> Self {
        let state: QueueState = match load_json_or_default(&path) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Failed to load queue from {:?}: {}", path, e);
                QueueState::default()
            }
        };
        Self {
            state: tokio::sync::Mutex::new(state),
            path: Some(path),
            config,
        }
    }

    fn persist(&self, state: &QueueState) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_json_atomic(path, state) {
            tracing::warn!("Failed to persist queue to {:?}: {}", path, e);
        }
    }

    /// Add a request. Priority is clamped into 1..=10.
    pub async fn enqueue(
        &self,
        prompt: &str,
        task_type: TaskType,
        priority: u8,
        role: ModelRole,
    ) -> Uuid {
        let item = QueueItem {
            id: Uuid::now_v7(),
            prompt: prompt.to_string(),
            task_type,
            role,
            priority: priority.clamp(1, 10),
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let id = item.id;
        let priority = item.priority;

        let mut state = self.state.lock().await;
        state.items.push(item);
        self.persist(&state);
        tracing::debug!("Enqueued request {} at priority {}", id, priority);
        id
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letter.clone()
    }

    /// Acquire the consumer lease, reclaiming a stale one. A live lease
    /// held by someone else is surfaced as ResourceExhausted.
    pub async fn acquire_lease(&self) -> Result<Uuid, FleetError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(lease) = &state.lease {
            if lease.expires_at > now {
                return Err(FleetError::ResourceExhausted(format!(
                    "queue lease {} held until {}",
                    lease.owner, lease.expires_at
                )));
            }
            tracing::warn!(
                "Reclaiming stale queue lease {} (expired {})",
                lease.owner,
                lease.expires_at
            );
        }
        let owner = Uuid::now_v7();
        state.lease = Some(Lease {
            owner,
            expires_at: now + self.config.lease_ttl,
        });
        self.persist(&state);
        Ok(owner)
    }

    /// Release the lease if still held by `owner`.
    pub async fn release_lease(&self, owner: Uuid) {
        let mut state = self.state.lock().await;
        if state.lease.as_ref().is_some_and(|l| l.owner == owner) {
            state.lease = None;
            self.persist(&state);
        }
    }

    /// The next `batch_size` items in (priority, enqueued_at) order,
    /// without removing them from the store.
    async fn peek_batch(&self, batch_size: usize) -> Vec<QueueItem> {
        let mut state = self.state.lock().await;
        state
            .items
            .sort_by(|a, b| (a.priority, a.enqueued_at).cmp(&(b.priority, b.enqueued_at)));
        state.items.iter().take(batch_size).cloned().collect()
    }

    /// Apply one item's terminal (or retry) outcome to the store.
    async fn settle(&self, item: &QueueItem, result: &Result<String, FleetError>) -> ItemStatus {
        let mut state = self.state.lock().await;
        let status = match result {
            Ok(text) => {
                state.items.retain(|i| i.id != item.id);
                ItemStatus::Completed(text.clone())
            }
            Err(e) => {
                let hopeless = matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Auth);
                let attempts = item.attempts + 1;
                if hopeless || attempts >= self.config.max_attempts {
                    state.items.retain(|i| i.id != item.id);
                    let mut dead = item.clone();
                    dead.attempts = attempts;
                    let reason = format!("{}", e);
                    state.dead_letter.push(DeadLetter {
                        item: dead,
                        reason: reason.clone(),
                        failed_at: Utc::now(),
                    });
                    // Bounded: oldest entries fall off first.
                    while state.dead_letter.len() > self.config.dead_letter_cap {
                        state.dead_letter.remove(0);
                    }
                    tracing::warn!("Request {} dead-lettered: {}", item.id, reason);
                    ItemStatus::DeadLettered { reason }
                } else {
                    if let Some(stored) = state.items.iter_mut().find(|i| i.id == item.id) {
                        stored.attempts = attempts;
                    }
                    tracing::debug!(
                        "Request {} failed attempt {}/{}, requeued",
                        item.id,
                        attempts,
                        self.config.max_attempts
                    );
                    ItemStatus::Requeued { attempts }
                }
            }
        };
        self.persist(&state);
        status
    }

    /// Process up to `batch_size` items under the consumer lease. Each
    /// item goes through `handler`; items are removed only on a terminal
    /// outcome. Per-item failures never abort the batch.
    pub async fn process_batch<F, Fut>(
        &self,
        batch_size: usize,
        strategy: BatchStrategy,
        handler: F,
    ) -> Result<Vec<ItemOutcome>, FleetError>
    where
        F: Fn(QueueItem) -> Fut,
        Fut: Future<Output = Result<String, FleetError>> + Send + 'static,
    {
        let owner = self.acquire_lease().await?;
        let batch = self.peek_batch(batch_size).await;
        tracing::info!("Processing {} queued request(s)", batch.len());

        let mut outcomes = Vec::with_capacity(batch.len());
        match strategy {
            BatchStrategy::Sequential => {
                for item in batch {
                    let result = handler(item.clone()).await;
                    let status = self.settle(&item, &result).await;
                    outcomes.push(ItemOutcome {
                        id: item.id,
                        status,
                    });
                }
            }
            BatchStrategy::Concurrent => {
                let handles: Vec<(QueueItem, tokio::task::JoinHandle<_>)> = batch
                    .into_iter()
                    .map(|item| {
                        let fut = handler(item.clone());
                        (item, tokio::spawn(fut))
                    })
                    .collect();
                for (item, handle) in handles {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(FleetError::Unknown(format!(
                            "{}: batch task failed: {}",
                            item.id, e
                        ))),
                    };
                    let status = self.settle(&item, &result).await;
                    outcomes.push(ItemOutcome {
                        id: item.id,
                        status,
                    });
                }
            }
        }

        self.release_lease(owner).await;
        Ok(outcomes)
    }
}
