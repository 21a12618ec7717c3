// src/registry.rs
//! Source registry: providers ordered by priority. Pure data.

use std::sync::Arc;

use crate::config::{AppConfig, ProviderConfig};

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    providers: Vec<Arc<ProviderConfig>>,
}

impl SourceRegistry {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.providers.clone())
    }

    pub fn new(mut providers: Vec<ProviderConfig>) -> Self {
        // Equal priorities are ordered by id so iteration is deterministic.
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
        }
    }

    /// Providers in ascending priority order (1 first).
    pub fn ordered(&self) -> &[Arc<ProviderConfig>] {
        &self.providers
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ProviderConfig>> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn priority_of(&self, id: &str) -> Option<u32> {
        self.get(id).map(|p| p.priority)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
