//! Model types
//!
//! Defines the static model catalog, hardware tiers and task
//! classification used by routing and tuning.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Role a model can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelRole {
    Agent,
    Chat,
    Edit,
    Autocomplete,
    Embed,
    Rerank,
    NextEdit,
}

impl ModelRole {
    /// Base sampling temperature for this role.
    pub fn base_temperature(&self) -> f32 {
        match self {
            ModelRole::Agent => 0.7,
            ModelRole::Chat => 0.8,
            ModelRole::Edit => 0.4,
            ModelRole::Autocomplete => 0.2,
            ModelRole::Embed => 0.0,
            ModelRole::Rerank => 0.0,
            ModelRole::NextEdit => 0.3,
        }
    }

    /// Base nucleus-sampling cutoff for this role.
    pub fn base_top_p(&self) -> f32 {
        match self {
            ModelRole::Autocomplete => 0.95,
            _ => 0.9,
        }
    }
}

/// Hardware capability class. Gates model eligibility and sets the
/// per-invocation resource defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    S,
    A,
    B,
    C,
}

impl Tier {
    /// Base context window for the tier. Task scaling never exceeds this.
    pub fn context_base(&self) -> u32 {
        match self {
            Tier::S => 32768,
            Tier::A => 16384,
            Tier::B => 8192,
            Tier::C => 4096,
        }
    }

    /// Largest model (by RAM estimate) the tier is allowed to run.
    pub fn max_model_ram_gb(&self) -> f64 {
        match self {
            Tier::S => 48.0,
            Tier::A => 24.0,
            Tier::B => 12.0,
            Tier::C => 6.0,
        }
    }

    pub fn gpu_layers(&self) -> u32 {
        match self {
            Tier::S | Tier::A => 99,
            Tier::B => 32,
            Tier::C => 0,
        }
    }

    pub fn num_threads(&self) -> u32 {
        match self {
            Tier::S => 12,
            Tier::A => 8,
            Tier::B => 6,
            Tier::C => 4,
        }
    }
}

/// Kind of work a request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Autocomplete,
    Chat,
    Coding,
    Review,
    Testing,
    Documentation,
    Refactoring,
    Creative,
}

/// Coarse effort class derived from the task type. Drives context scaling
/// and model-size preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Simple,
    Moderate,
    Complex,
    Refactoring,
}

impl TaskType {
    pub fn category(&self) -> TaskCategory {
        match self {
            TaskType::Autocomplete => TaskCategory::Simple,
            TaskType::Chat | TaskType::Review | TaskType::Testing | TaskType::Documentation => {
                TaskCategory::Moderate
            }
            TaskType::Coding | TaskType::Creative => TaskCategory::Complex,
            TaskType::Refactoring => TaskCategory::Refactoring,
        }
    }
}

/// Catalog entry for an installable model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique model name, may carry a tag (e.g. `qwen2.5-coder:7b`).
    pub name: String,
    /// Approximate resident memory when loaded, in GB.
    pub ram_estimate_gb: f64,
    /// Roles this model is suited for.
    pub roles: Vec<ModelRole>,
}

impl ModelDescriptor {
    pub fn new(name: &str, ram_estimate_gb: f64, roles: &[ModelRole]) -> Self {
        Self {
            name: name.to_string(),
            ram_estimate_gb,
            roles: roles.to_vec(),
        }
    }
}

/// Static model catalog, loaded once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    /// Load a catalog from a JSON file. A missing file yields the built-in
    /// defaults; a corrupt file is logged and also falls back to defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("No catalog at {:?}, using built-in defaults", path);
            return Self::default();
        }
        match std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!("Failed to load catalog from {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    /// RAM estimate for a model, 0.0 when the model is not in the catalog.
    pub fn ram_estimate(&self, name: &str) -> f64 {
        self.get(name).map(|m| m.ram_estimate_gb).unwrap_or(0.0)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        use ModelRole::*;
        Self {
            models: vec![
                ModelDescriptor::new("qwen2.5-coder:1.5b", 1.0, &[Autocomplete, NextEdit]),
                ModelDescriptor::new("llama3.2:1b", 1.3, &[Chat, Autocomplete]),
                ModelDescriptor::new("llama3.2:3b", 2.0, &[Chat, Edit]),
                ModelDescriptor::new("qwen2.5-coder:7b", 4.7, &[Agent, Edit, Chat]),
                ModelDescriptor::new("llama3.1:8b", 4.9, &[Agent, Chat]),
                ModelDescriptor::new("qwen2.5:14b", 9.0, &[Agent, Chat, Edit]),
                ModelDescriptor::new("qwen2.5-coder:32b", 20.0, &[Agent, Edit]),
                ModelDescriptor::new("llama3.3:70b", 43.0, &[Agent, Chat]),
                ModelDescriptor::new("nomic-embed-text", 0.3, &[Embed]),
                ModelDescriptor::new("bge-reranker-base", 0.3, &[Rerank]),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_context_bases() {
        assert_eq!(Tier::S.context_base(), 32768);
        assert_eq!(Tier::A.context_base(), 16384);
        assert_eq!(Tier::B.context_base(), 8192);
        assert_eq!(Tier::C.context_base(), 4096);
    }

    #[test]
    fn test_task_categories() {
        assert_eq!(TaskType::Autocomplete.category(), TaskCategory::Simple);
        assert_eq!(TaskType::Chat.category(), TaskCategory::Moderate);
        assert_eq!(TaskType::Coding.category(), TaskCategory::Complex);
        assert_eq!(TaskType::Refactoring.category(), TaskCategory::Refactoring);
    }

    #[test]
    fn test_default_catalog_lookup() {
        let catalog = ModelCatalog::default();
        assert!(catalog.get("qwen2.5-coder:7b").is_some());
        assert!(catalog.get("no-such-model").is_none());
        assert!(catalog.ram_estimate("llama3.3:70b") > 40.0);
        assert_eq!(catalog.ram_estimate("no-such-model"), 0.0);
    }

    #[test]
    fn test_catalog_serialization_round_trip() {
        let catalog = ModelCatalog::default();
        let json = serde_json::to_string(&catalog).unwrap();
        let loaded: ModelCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(catalog.models.len(), loaded.models.len());
        assert_eq!(loaded.get("llama3.2:3b").unwrap().ram_estimate_gb, 2.0);
    }

    #[test]
    fn test_role_serde_kebab_case() {
        let json = serde_json::to_string(&ModelRole::NextEdit).unwrap();
        assert_eq!(json, "\"next-edit\"");
    }
}
