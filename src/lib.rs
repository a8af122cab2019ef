//! fleetrs
//!
//! Orchestrates a small fleet of local language models sharing one
//! machine's memory budget: residency monitoring with usage-based
//! eviction, deterministic task routing, adaptive parameter tuning,
//! staged prompt compression, a durable priority request queue and
//! multi-model ensemble execution. Inference itself happens in an
//! external execution service; this crate manages the process-local
//! knowledge of residency, usage and queued work.

pub mod config;
pub mod context;
pub mod ensemble;
pub mod exec;
pub mod fleet;
pub mod queue;
pub mod residency;
pub mod routing;
pub mod storage;
pub mod system;
pub mod tuning;
pub mod types;

pub use config::FleetConfig;
pub use ensemble::CombineStrategy;
pub use fleet::{FleetService, FleetStats};
pub use queue::BatchStrategy;
pub use types::{FleetError, ModelRole, TaskType, Tier};

/// Install a `RUST_LOG`-driven tracing subscriber. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
