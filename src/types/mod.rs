//! Shared type definitions
//!
//! Model catalog entries, hardware tiers, task classification and the
//! crate-wide error taxonomy.

pub mod error;
pub mod model;

pub use error::{ErrorKind, FleetError};
pub use model::{ModelCatalog, ModelDescriptor, ModelRole, TaskCategory, TaskType, Tier};
