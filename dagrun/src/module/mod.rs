//! Computation modules and their resolution.
//!
//! A module is a named bag of [`Node`]s. Modules are referenced either by
//! logical name, resolved at run time through a [`ModuleSource`], or by an
//! already-loaded handle that passes through untouched.

mod registry;
mod resolver;

pub use registry::ModuleRegistry;
pub use resolver::{DEFAULT_NAMESPACE, ModuleResolver};

use std::fmt;
use std::sync::Arc;

use crate::graph::Node;

/// A loaded computation module.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    nodes: Vec<Node>,
    instance_id: String,
}

impl Module {
    /// Create a new module instance.
    ///
    /// Every instance gets its own `instance_id`, so two loads of the same
    /// source are distinguishable.
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            nodes,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Add a node, builder style.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Reference to a module, either late-bound or already loaded.
#[derive(Clone)]
pub enum ModuleReference {
    /// Resolve by logical name at run time.
    ByName(String),
    /// Use this already-loaded module as is.
    ByHandle(Arc<Module>),
}

impl ModuleReference {
    pub fn name(name: impl Into<String>) -> Self {
        Self::ByName(name.into())
    }

    pub fn handle(module: Module) -> Self {
        Self::ByHandle(Arc::new(module))
    }

    /// Logical name of the referenced module.
    pub fn module_name(&self) -> &str {
        match self {
            Self::ByName(name) => name,
            Self::ByHandle(module) => module.name(),
        }
    }
}

impl fmt::Debug for ModuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName(name) => f.debug_tuple("ByName").field(name).finish(),
            Self::ByHandle(module) => f
                .debug_tuple("ByHandle")
                .field(&module.name())
                .field(&module.instance_id())
                .finish(),
        }
    }
}

impl From<&str> for ModuleReference {
    fn from(name: &str) -> Self {
        Self::ByName(name.to_string())
    }
}

impl From<String> for ModuleReference {
    fn from(name: String) -> Self {
        Self::ByName(name)
    }
}

impl From<Module> for ModuleReference {
    fn from(module: Module) -> Self {
        Self::handle(module)
    }
}

impl From<Arc<Module>> for ModuleReference {
    fn from(module: Arc<Module>) -> Self {
        Self::ByHandle(module)
    }
}

/// Source of importable modules.
///
/// Each successful `load` must return a fresh, independent module object.
pub trait ModuleSource: Send + Sync {
    /// Load the module registered under exactly `name`.
    fn load(&self, name: &str) -> Option<Module>;

    /// Names this source can load, used for resolution suggestions.
    fn available(&self) -> Vec<String>;
}
