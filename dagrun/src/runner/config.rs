//! Run configuration: everything one execution request needs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::module::ModuleReference;
use crate::{Error, Result};

/// How the runner walks the execution plan.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One node at a time, in plan order.
    #[default]
    Sync,
    /// Every node of a plan level concurrently.
    Async,
}

/// Immutable parameters of one pipeline execution.
///
/// Built once through [`RunConfig::builder`]; there are no setters.
#[derive(Debug, Clone)]
pub struct RunConfig {
    main_module: ModuleReference,
    targets: Vec<String>,
    inputs: BTreeMap<String, Value>,
    additional_modules: Vec<ModuleReference>,
    reload: bool,
    mode: ExecutionMode,
}

impl RunConfig {
    /// Start building a configuration for `main_module`.
    pub fn builder(main_module: impl Into<ModuleReference>) -> RunConfigBuilder {
        RunConfigBuilder {
            main_module: main_module.into(),
            targets: Vec::new(),
            inputs: BTreeMap::new(),
            additional_modules: Vec::new(),
            reload: false,
            mode: ExecutionMode::default(),
        }
    }

    pub fn main_module(&self) -> &ModuleReference {
        &self.main_module
    }

    /// Requested output names, deduplicated, in request order.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Input overrides.
    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    pub fn additional_modules(&self) -> &[ModuleReference] {
        &self.additional_modules
    }

    /// `[main, *additional]`, the order composition uses.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleReference> {
        std::iter::once(&self.main_module).chain(self.additional_modules.iter())
    }

    pub fn reload(&self) -> bool {
        self.reload
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Convert to the persisted form. Handles are stored by module name.
    pub fn to_record(&self) -> RunConfigRecord {
        RunConfigRecord {
            main_module: self.main_module.module_name().to_string(),
            targets: self.targets.clone(),
            inputs: self
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            additional_modules: self
                .additional_modules
                .iter()
                .map(|m| m.module_name().to_string())
                .collect(),
            reload: self.reload,
            mode: self.mode,
        }
    }
}

/// Builder for [`RunConfig`].
#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    main_module: ModuleReference,
    targets: Vec<String>,
    inputs: BTreeMap<String, Value>,
    additional_modules: Vec<ModuleReference>,
    reload: bool,
    mode: ExecutionMode,
}

impl RunConfigBuilder {
    /// Request an output.
    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.targets.push(name.into());
        self
    }

    /// Request several outputs.
    pub fn targets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets.extend(names.into_iter().map(Into::into));
        self
    }

    /// Override (or supply) an input value.
    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Override several inputs.
    pub fn inputs<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        self.inputs
            .extend(values.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Append an additional module. Later modules win name collisions.
    pub fn additional_module(mut self, module: impl Into<ModuleReference>) -> Self {
        self.additional_modules.push(module.into());
        self
    }

    pub fn reload(mut self, reload: bool) -> Self {
        self.reload = reload;
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<RunConfig> {
        let mut targets = Vec::with_capacity(self.targets.len());
        for target in self.targets {
            if target.trim().is_empty() {
                return Err(Error::validation("target output names must not be empty"));
            }
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        if targets.is_empty() {
            return Err(Error::validation(
                "a run configuration needs at least one target output",
            ));
        }
        if self.main_module.module_name().is_empty() {
            return Err(Error::validation("main module name must not be empty"));
        }

        Ok(RunConfig {
            main_module: self.main_module,
            targets,
            inputs: self.inputs,
            additional_modules: self.additional_modules,
            reload: self.reload,
            mode: self.mode,
        })
    }
}

/// Serialized run configuration, as stored in job and schedule records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfigRecord {
    pub main_module: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub additional_modules: Vec<String>,
    #[serde(default)]
    pub reload: bool,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl RunConfigRecord {
    /// Rebuild a run configuration. Every module becomes a by-name reference.
    pub fn into_run_config(self) -> Result<RunConfig> {
        RunConfig::builder(ModuleReference::ByName(self.main_module))
            .targets(self.targets)
            .inputs(self.inputs)
            .reload(self.reload)
            .mode(self.mode)
            .additional_modules(self.additional_modules)
            .build()
    }
}

impl RunConfigBuilder {
    fn additional_modules(mut self, names: Vec<String>) -> Self {
        self.additional_modules
            .extend(names.into_iter().map(ModuleReference::ByName));
        self
    }
}
