//! The syncable-model registry.
//!
//! The host application's ORM is outside this crate; what the engine needs
//! to know about each domain model is captured in a [`ModelDescriptor`]:
//! its name, its foreign keys, whether it has a self-referential FK, and
//! which models it depends on. Descriptors are registered per profile at
//! startup, in insertion order refined to foreign-key dependency order, and
//! the registry is frozen once built.

use std::collections::HashMap;

/// A foreign key on an app model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDescriptor {
    /// The field on the serialized record holding the referenced id.
    pub field: String,
    /// The model the FK points at.
    pub target_model: String,
}

/// What the engine knows about one syncable app model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub model_name: String,
    pub profile: String,
    /// Foreign keys checked during deserialization validation.
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    /// The FK field pointing at this same model, for tree-shaped data.
    pub self_ref_field: Option<String>,
    /// Extra dependency model names beyond the foreign keys.
    pub dependencies: Vec<String>,
}

impl ModelDescriptor {
    /// All model names this model depends on.
    fn dependency_names(&self) -> Vec<&str> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.target_model.as_str())
            .chain(self.dependencies.iter().map(String::as_str))
            .filter(|name| *name != self.model_name)
            .collect()
    }
}

/// Per-profile model descriptors in foreign-key dependency order.
#[derive(Debug, Default)]
pub struct SyncableModelRegistry {
    profiles: HashMap<String, Vec<ModelDescriptor>>,
}

impl SyncableModelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model, inserting it just after the last of its
    /// dependencies already present, but never after a model that depends
    /// on it, so iteration respects FK order.
    pub fn register(&mut self, descriptor: ModelDescriptor) {
        let models = self.profiles.entry(descriptor.profile.clone()).or_default();
        let after_dependencies = descriptor
            .dependency_names()
            .iter()
            .filter_map(|dep| models.iter().position(|m| m.model_name == *dep))
            .max()
            .map_or(models.len(), |i| i + 1);
        let before_dependents = models
            .iter()
            .position(|m| {
                m.dependency_names()
                    .contains(&descriptor.model_name.as_str())
            })
            .unwrap_or(models.len());
        let index = after_dependencies.min(before_dependents).min(models.len());
        models.insert(index, descriptor);
    }

    /// All models for a profile, in dependency order.
    #[must_use]
    pub fn get_models(&self, profile: &str) -> &[ModelDescriptor] {
        self.profiles.get(profile).map_or(&[], Vec::as_slice)
    }

    /// Look up one model descriptor.
    #[must_use]
    pub fn get_model(&self, profile: &str, model_name: &str) -> Option<&ModelDescriptor> {
        self.get_models(profile)
            .iter()
            .find(|m| m.model_name == model_name)
    }

    #[must_use]
    pub fn profiles(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}
