//! System probing
//!
//! Best-effort memory probing used by the residency monitor's pressure
//! estimator.

pub mod memory;

pub use memory::MemorySnapshot;
