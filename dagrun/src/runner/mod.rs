//! Pipeline runner: resolve, compose, plan and execute.

mod config;

pub use config::{ExecutionMode, RunConfig, RunConfigBuilder, RunConfigRecord};

use dashmap::DashMap;
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::graph::{ComposedGraph, ExecutionPlan, NodeInputs, compose};
use crate::module::{Module, ModuleResolver};
use crate::{Error, Result};

/// Ordered module names of one composition.
type GraphKey = Vec<String>;

/// A composed graph and the module instances it was built from.
struct CachedGraph {
    instance_ids: Vec<String>,
    graph: Arc<ComposedGraph>,
}

/// Values computed for the requested targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RunOutputs {
    values: BTreeMap<String, Value>,
}

impl RunOutputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.values
    }

    /// Outputs as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Executes run configurations.
///
/// The runner owns its resolver and a graph cache keyed by the ordered list
/// of module names. A cached graph is reused only while every module in the
/// list resolves to the same instance that built it. Rebuilt graphs replace
/// the cache entry in one insert, so a concurrent run observes either the
/// old graph or the new one.
pub struct PipelineRunner {
    resolver: ModuleResolver,
    graphs: DashMap<GraphKey, Arc<CachedGraph>>,
}

impl PipelineRunner {
    pub fn new(resolver: ModuleResolver) -> Self {
        Self {
            resolver,
            graphs: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &ModuleResolver {
        &self.resolver
    }

    /// Number of cached graphs.
    pub fn cached_graph_count(&self) -> usize {
        self.graphs.len()
    }

    /// Drop every cached graph. Resolved modules stay cached in the resolver.
    pub fn clear_graph_cache(&self) {
        self.graphs.clear();
    }

    /// Resolve and compose the graph for `config`, reusing the cache when
    /// possible.
    pub fn graph(&self, config: &RunConfig) -> Result<Arc<ComposedGraph>> {
        let modules = self.resolve_modules(config)?;
        let key: GraphKey = modules.iter().map(|m| m.name().to_string()).collect();
        let instance_ids: Vec<String> = modules
            .iter()
            .map(|m| m.instance_id().to_string())
            .collect();

        if let Some(cached) = self.graphs.get(&key)
            && cached.instance_ids == instance_ids
        {
            return Ok(cached.graph.clone());
        }

        let (main, additional) = modules
            .split_first()
            .ok_or_else(|| Error::validation("no modules to compose"))?;
        let additional: Vec<&Module> = additional.iter().map(|m| m.as_ref()).collect();
        let graph = Arc::new(compose(main, &additional)?);

        debug!(
            modules = ?key,
            nodes = graph.len(),
            fingerprint = graph.fingerprint(),
            "Composed graph"
        );
        self.graphs.insert(
            key,
            Arc::new(CachedGraph {
                instance_ids,
                graph: graph.clone(),
            }),
        );
        Ok(graph)
    }

    /// Compute the execution plan for `config` without running anything.
    pub fn plan(&self, config: &RunConfig) -> Result<ExecutionPlan> {
        let graph = self.graph(config)?;
        let overrides: HashSet<String> = config.inputs().keys().cloned().collect();
        graph.plan(config.targets(), &overrides)
    }

    /// Execute `config`, returning exactly the requested targets.
    ///
    /// `cancel` is observed before each node (sync mode) or each level
    /// (async mode); a node already running is never interrupted.
    #[instrument(
        skip(self, config, cancel),
        fields(module = %config.main_module().module_name(), mode = %config.mode())
    )]
    pub async fn run(&self, config: &RunConfig, cancel: &CancellationToken) -> Result<RunOutputs> {
        let started = Instant::now();
        let graph = self.graph(config)?;
        let overrides: HashSet<String> = config.inputs().keys().cloned().collect();
        let plan = graph.plan(config.targets(), &overrides)?;

        info!(
            targets = ?config.targets(),
            nodes = plan.node_count(),
            levels = plan.levels.len(),
            "Starting pipeline run"
        );

        let mut values: HashMap<String, Value> = config
            .inputs()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        match config.mode() {
            ExecutionMode::Sync => {
                for name in plan.ordered() {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let value = execute_node(&graph, name, &values).await?;
                    values.insert(name.to_string(), value);
                }
            }
            ExecutionMode::Async => {
                for level in &plan.levels {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    let results = try_join_all(
                        level
                            .iter()
                            .map(|name| execute_node(&graph, name, &values)),
                    )
                    .await?;
                    values.extend(level.iter().cloned().zip(results));
                }
            }
        }

        let mut outputs = BTreeMap::new();
        for target in config.targets() {
            let value = values.remove(target).ok_or_else(|| Error::MissingInputs {
                node: target.clone(),
                inputs: vec![target.clone()],
            })?;
            outputs.insert(target.clone(), value);
        }

        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );
        Ok(RunOutputs { values: outputs })
    }

    /// Blocking variant of [`run`](Self::run).
    ///
    /// Drives the run on a private current-thread runtime. Must not be called
    /// from within an async context.
    pub fn run_blocking(&self, config: &RunConfig) -> Result<RunOutputs> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(config, &CancellationToken::new()))
    }

    fn resolve_modules(&self, config: &RunConfig) -> Result<Vec<Arc<Module>>> {
        config
            .modules()
            .map(|reference| {
                if config.reload() {
                    self.resolver.reload(reference)
                } else {
                    self.resolver.resolve(reference)
                }
            })
            .collect()
    }
}

async fn execute_node(
    graph: &ComposedGraph,
    name: &str,
    values: &HashMap<String, Value>,
) -> Result<Value> {
    let node = graph
        .node(name)
        .ok_or_else(|| Error::not_found("node", name))?;

    let mut args = BTreeMap::new();
    let mut missing = Vec::new();
    for input in node.inputs() {
        match values.get(input) {
            Some(v) => {
                args.insert(input.clone(), v.clone());
            }
            None => missing.push(input.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(Error::MissingInputs {
            node: name.to_string(),
            inputs: missing,
        });
    }

    let started = Instant::now();
    let value = node
        .call(NodeInputs::new(args))
        .await
        .map_err(|e| Error::Execution {
            node: name.to_string(),
            cause: format!("{:#}", e),
        })?;
    debug!(
        node = %name,
        provider = graph.provider(name).unwrap_or_default(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Node completed"
    );
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::module::ModuleRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner_with(registry: &Arc<ModuleRegistry>) -> PipelineRunner {
        PipelineRunner::new(ModuleResolver::new(registry.clone()))
    }

    fn arithmetic() -> Vec<Node> {
        vec![
            Node::new("a", &[], |_| Ok(json!(2))),
            Node::new("b", &["a"], |args| Ok(json!(args.i64("a")? * 10))),
            Node::new("c", &["a", "b"], |args| {
                Ok(json!(args.i64("a")? + args.i64("b")?))
            }),
            Node::new("unused", &[], |_| anyhow::bail!("should not run")),
        ]
    }

    #[tokio::test]
    async fn test_runs_only_required_subgraph() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register("arith", arithmetic);
        let runner = runner_with(&registry);

        for mode in [ExecutionMode::Sync, ExecutionMode::Async] {
            let config = RunConfig::builder("arith")
                .target("c")
                .mode(mode)
                .build()
                .unwrap();
            let outputs = runner.run(&config, &CancellationToken::new()).await.unwrap();
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs.get("c"), Some(&json!(22)));
        }
    }

    #[tokio::test]
    async fn test_override_skips_node_and_its_upstream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ModuleRegistry::new());
        let counter = calls.clone();
        registry.register("m", move || {
            let counter = counter.clone();
            vec![
                Node::new("expensive", &[], move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                }),
                Node::new("double", &["expensive"], |args| {
                    Ok(json!(args.i64("expensive")? * 2))
                }),
            ]
        });
        let runner = runner_with(&registry);

        let config = RunConfig::builder("m")
            .target("double")
            .input("expensive", json!(50))
            .build()
            .unwrap();
        let outputs = runner.run(&config, &CancellationToken::new()).await.unwrap();
        assert_eq!(outputs.get("double"), Some(&json!(100)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_node_failure_names_node_and_cause() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register("m", || {
            vec![
                Node::new("ok", &[], |_| Ok(json!(1))),
                Node::new("bad", &["ok"], |_| {
                    Err(anyhow::anyhow!("division by zero").context("computing bad"))
                }),
                Node::new("out", &["ok", "bad"], |_| Ok(json!(0))),
            ]
        });
        let runner = runner_with(&registry);
        let config = RunConfig::builder("m")
            .targets(["ok", "out"])
            .build()
            .unwrap();

        match runner.run(&config, &CancellationToken::new()).await {
            Err(Error::Execution { node, cause }) => {
                assert_eq!(node, "bad");
                assert!(cause.contains("division by zero"));
                assert!(cause.contains("computing bad"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_first_node() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register("arith", arithmetic);
        let runner = runner_with(&registry);
        let config = RunConfig::builder("arith").target("c").build().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = runner.run(&config, &token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_graph_cache_reused_until_reload() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register("arith", arithmetic);
        let runner = runner_with(&registry);

        let config = RunConfig::builder("arith").target("c").build().unwrap();
        let first = runner.graph(&config).unwrap();
        let second = runner.graph(&config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runner.cached_graph_count(), 1);

        let reload = RunConfig::builder("arith")
            .target("c")
            .reload(true)
            .build()
            .unwrap();
        let third = runner.graph(&reload).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.fingerprint(), third.fingerprint());
        assert_eq!(runner.cached_graph_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_fails_before_computation() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register("arith", arithmetic);
        let runner = runner_with(&registry);
        let config = RunConfig::builder("arith").target("nope").build().unwrap();

        let err = runner.run(&config, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownOutputs { .. }));
    }

    #[test]
    fn test_run_blocking() {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register("arith", arithmetic);
        let runner = runner_with(&registry);
        let config = RunConfig::builder("arith").target("b").build().unwrap();

        let outputs = runner.run_blocking(&config).unwrap();
        assert_eq!(outputs.to_json(), json!({ "b": 20 }));
    }
}
