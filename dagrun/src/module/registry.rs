//! In-memory module source.

use dashmap::DashMap;
use std::sync::Arc;

use super::{Module, ModuleSource};
use crate::graph::Node;

type ModuleFactory = Arc<dyn Fn() -> Vec<Node> + Send + Sync>;

/// Module source backed by registered factories.
///
/// Registering a name again replaces its factory, which is how a changed
/// module source is modelled: the next fresh load picks up the new nodes,
/// while already-cached instances keep the old ones.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    factories: Arc<DashMap<String, ModuleFactory>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Vec<Node> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(module = %name, "Registered module factory");
        self.factories.insert(name, Arc::new(factory));
    }

    /// Remove a registered module. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl ModuleSource for ModuleRegistry {
    fn load(&self, name: &str) -> Option<Module> {
        // Clone the factory out so the shard lock is not held while it runs.
        let factory = self.factories.get(name).map(|f| f.value().clone())?;
        Some(Module::new(name, factory()))
    }

    fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
