//! Module resolution with a resolver-owned cache.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Module, ModuleReference, ModuleSource};
use crate::{Error, Result};

/// Namespace searched after the bare name.
pub const DEFAULT_NAMESPACE: &str = "pipelines";

/// Maximum edit distance for "did you mean" suggestions.
const SUGGESTION_MAX_DISTANCE: usize = 2;

/// Resolves module references into loaded modules.
///
/// Name lookups are cached per resolver. The cache is never shared between
/// resolvers and is invalidated explicitly, either by [`reload`] or
/// [`invalidate`].
///
/// [`reload`]: ModuleResolver::reload
/// [`invalidate`]: ModuleResolver::invalidate
pub struct ModuleResolver {
    source: Arc<dyn ModuleSource>,
    namespaces: Vec<String>,
    cache: DashMap<String, Arc<Module>>,
}

impl ModuleResolver {
    /// Create a resolver searching the default namespace.
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self::with_namespaces(source, vec![DEFAULT_NAMESPACE.to_string()])
    }

    /// Create a resolver with custom search namespaces, tried in order after
    /// the bare name.
    pub fn with_namespaces(source: Arc<dyn ModuleSource>, namespaces: Vec<String>) -> Self {
        Self {
            source,
            namespaces,
            cache: DashMap::new(),
        }
    }

    /// Resolve a reference, reusing a cached module when one exists.
    pub fn resolve(&self, reference: &ModuleReference) -> Result<Arc<Module>> {
        match reference {
            ModuleReference::ByHandle(module) => Ok(module.clone()),
            ModuleReference::ByName(name) => {
                if let Some(module) = self.cache.get(name) {
                    return Ok(module.clone());
                }
                let module = self.load_fresh(name)?;
                // Another caller may have raced us; keep whichever landed first
                // so repeated resolution stays idempotent.
                let entry = self.cache.entry(name.clone()).or_insert(module);
                Ok(entry.value().clone())
            }
        }
    }

    /// Force a fresh resolution, replacing any cached module.
    ///
    /// Handles pass through unchanged; there is nothing to re-import.
    pub fn reload(&self, reference: &ModuleReference) -> Result<Arc<Module>> {
        match reference {
            ModuleReference::ByHandle(module) => Ok(module.clone()),
            ModuleReference::ByName(name) => {
                let module = self.load_fresh(name)?;
                self.cache.insert(name.clone(), module.clone());
                info!(
                    module = %name,
                    instance_id = %module.instance_id(),
                    "Reloaded module"
                );
                Ok(module)
            }
        }
    }

    /// Drop the cached module for `name`. Returns true if one was cached.
    pub fn invalidate(&self, name: &str) -> bool {
        self.cache.remove(name).is_some()
    }

    /// Drop every cached module.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached modules.
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn load_fresh(&self, name: &str) -> Result<Arc<Module>> {
        for candidate in self.candidates(name) {
            if let Some(module) = self.source.load(&candidate) {
                debug!(
                    module = %name,
                    resolved_as = %candidate,
                    instance_id = %module.instance_id(),
                    "Resolved module"
                );
                return Ok(Arc::new(module));
            }
        }

        Err(Error::Resolution {
            name: name.to_string(),
            suggestions: self.suggestions(name),
        })
    }

    fn candidates(&self, name: &str) -> Vec<String> {
        let mut candidates = vec![name.to_string()];
        for ns in &self.namespaces {
            let prefix = format!("{}.", ns);
            if !name.starts_with(&prefix) {
                candidates.push(format!("{}{}", prefix, name));
            }
        }
        candidates
    }

    fn suggestions(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |s: String| {
            if s != name && !out.contains(&s) {
                out.push(s);
            }
        };

        // Registered names that look like what was asked for.
        let wanted = normalize(strip_namespace(name, &self.namespaces));
        for available in self.source.available() {
            let have = normalize(strip_namespace(&available, &self.namespaces));
            if have == wanted || edit_distance(&have, &wanted) <= SUGGESTION_MAX_DISTANCE {
                push(available);
            }
        }

        // Hyphen/underscore normalization of the attempted name.
        if name.contains('-') {
            push(name.replace('-', "_"));
        } else if name.contains('_') {
            push(name.replace('_', "-"));
        }

        // Namespaced variant, or the bare name if it was already namespaced.
        let bare = strip_namespace(name, &self.namespaces);
        if bare != name {
            push(bare.to_string());
        } else {
            let ns = self
                .namespaces
                .first()
                .map(String::as_str)
                .unwrap_or(DEFAULT_NAMESPACE);
            push(format!("{}.{}", ns, name));
        }

        out
    }
}

fn strip_namespace<'a>(name: &'a str, namespaces: &[String]) -> &'a str {
    for ns in namespaces {
        if let Some(rest) = name.strip_prefix(ns.as_str())
            && let Some(rest) = rest.strip_prefix('.')
        {
            return rest;
        }
    }
    name
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
