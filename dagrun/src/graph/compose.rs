//! Merging module node sets into a single execution graph.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

use super::node::Node;
use crate::module::Module;
use crate::{Error, Result};

/// A node together with the module that contributed it.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub node: Node,
    /// Name of the contributing module.
    pub provider: String,
}

/// The merged DAG of one ordered module list.
#[derive(Debug, Clone)]
pub struct ComposedGraph {
    nodes: BTreeMap<String, GraphNode>,
    modules: Vec<String>,
}

/// Merge the nodes of `[main, *additional]` into one graph.
///
/// When several modules define a node with the same name, the module that
/// appears **last** in the list wins, so an additional module
/// can redefine any node of the main module. Collisions are logged, never
/// rejected. Cycles, which may only appear after merging, are a hard error.
pub fn compose(main: &Module, additional: &[&Module]) -> Result<ComposedGraph> {
    let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
    let mut modules = Vec::with_capacity(additional.len() + 1);

    for module in std::iter::once(main).chain(additional.iter().copied()) {
        modules.push(module.name().to_string());
        for node in module.nodes() {
            let replaced = nodes.insert(
                node.name().to_string(),
                GraphNode {
                    node: node.clone(),
                    provider: module.name().to_string(),
                },
            );
            if let Some(previous) = replaced {
                debug!(
                    node = %node.name(),
                    previous = %previous.provider,
                    winner = %module.name(),
                    "Node redefined by later module"
                );
            }
        }
    }

    let graph = ComposedGraph { nodes, modules };
    graph.validate()?;
    Ok(graph)
}

impl ComposedGraph {
    /// Get a node by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name).map(|n| &n.node)
    }

    /// Name of the module that contributed `name`.
    pub fn provider(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).map(|n| n.provider.as_str())
    }

    /// All node names, sorted.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Module names in composition order.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Input names that no node defines and must be supplied by the caller.
    pub fn external_inputs(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .flat_map(|n| n.node.inputs().iter())
            .filter(|input| !self.nodes.contains_key(*input))
            .cloned()
            .collect()
    }

    /// Stable hash of the graph shape: node names, inputs and providers.
    ///
    /// SHA-256 based, so the value is the same across processes and builds.
    /// Module order only matters where it changes a provider.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        for (name, gn) in &self.nodes {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            for input in gn.node.inputs() {
                hasher.update(input.as_bytes());
                hasher.update([0u8]);
            }
            hasher.update([1u8]);
            hasher.update(gn.provider.as_bytes());
            hasher.update([2u8]);
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Compute the minimal execution plan for `targets`.
    ///
    /// Names in `overrides` are taken as given: an overridden node is not
    /// computed and its upstream is only visited if something else needs it.
    /// Fails before any computation when a target is unknown or a required
    /// external input is missing.
    pub fn plan(&self, targets: &[String], overrides: &HashSet<String>) -> Result<ExecutionPlan> {
        let unknown: Vec<String> = targets
            .iter()
            .filter(|t| !self.nodes.contains_key(*t) && !overrides.contains(*t))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(Error::UnknownOutputs {
                requested: unknown,
                available: self.node_names(),
            });
        }

        // Walk upstream from the targets, stopping at overrides.
        let mut required: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<&str> = targets.iter().map(String::as_str).collect();
        while let Some(name) = stack.pop() {
            if overrides.contains(name) || required.contains(name) {
                continue;
            }
            let Some(gn) = self.nodes.get(name) else {
                continue;
            };
            required.insert(name.to_string());

            let missing: Vec<String> = gn
                .node
                .inputs()
                .iter()
                .filter(|i| !self.nodes.contains_key(*i) && !overrides.contains(*i))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(Error::MissingInputs {
                    node: name.to_string(),
                    inputs: missing,
                });
            }
            stack.extend(gn.node.inputs().iter().map(String::as_str));
        }

        // Kahn's algorithm over the required subgraph, one level at a time.
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for name in &required {
            let deps = self.computed_deps(name, &required, overrides);
            indegree.insert(name.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(name.as_str());
            }
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        while !ready.is_empty() {
            ready.sort_unstable();
            let mut next = Vec::new();
            for name in &ready {
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(d) = indegree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            levels.push(ready.iter().map(|s| s.to_string()).collect());
            ready = next;
        }

        Ok(ExecutionPlan {
            levels,
            targets: targets.to_vec(),
        })
    }

    /// Dependencies of `name` that will actually be computed in this plan.
    fn computed_deps<'a>(
        &'a self,
        name: &str,
        required: &BTreeSet<String>,
        overrides: &HashSet<String>,
    ) -> Vec<&'a str> {
        self.nodes
            .get(name)
            .map(|gn| {
                let mut deps: Vec<&str> = gn
                    .node
                    .inputs()
                    .iter()
                    .map(String::as_str)
                    .filter(|i| required.contains(*i) && !overrides.contains(*i))
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        for (name, gn) in &self.nodes {
            if name.is_empty() {
                return Err(Error::composition(
                    format!("module '{}' defines a node with an empty name", gn.provider),
                    vec![],
                ));
            }
            if gn.node.inputs().iter().any(|i| i == name) {
                return Err(Error::composition(
                    format!("node '{}' depends on itself", name),
                    vec![name.clone()],
                ));
            }
        }

        let mut visited = HashSet::new();
        let mut rec_stack = Vec::new();
        for name in self.nodes.keys() {
            if !visited.contains(name.as_str())
                && let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack)
            {
                return Err(Error::composition(
                    format!("cycle detected after merging: {}", cycle.join(" -> ")),
                    cycle,
                ));
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(name);
        rec_stack.push(name);

        if let Some(gn) = self.nodes.get(name) {
            for dep in gn.node.inputs() {
                if !self.nodes.contains_key(dep) {
                    continue;
                }
                if let Some(pos) = rec_stack.iter().position(|n| *n == dep.as_str()) {
                    let mut cycle: Vec<String> =
                        rec_stack[pos..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                if !visited.contains(dep.as_str())
                    && let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack)
                {
                    return Some(cycle);
                }
            }
        }

        rec_stack.pop();
        None
    }
}

/// Ordered execution levels for one run.
///
/// Every node in a level depends only on nodes from earlier levels (or on
/// overrides), so the nodes of one level may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub levels: Vec<Vec<String>>,
    pub targets: Vec<String>,
}

impl ExecutionPlan {
    /// Number of nodes that will be computed.
    pub fn node_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// All nodes in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(name: &str, value: i64) -> Node {
        Node::new(name, &[], move |_| Ok(json!(value)))
    }

    fn passthrough(name: &str, input: &str) -> Node {
        let input_name = input.to_string();
        Node::new(name, &[input], move |args| Ok(args.get(&input_name)?.clone()))
    }

    #[test]
    fn test_last_definition_wins() {
        let a = Module::new("a", vec![constant("x", 1), constant("y", 1)]);
        let b = Module::new("b", vec![constant("x", 2)]);
        let c = Module::new("c", vec![constant("x", 3)]);

        let graph = compose(&a, &[&b, &c]).unwrap();
        assert_eq!(graph.provider("x"), Some("c"));
        assert_eq!(graph.provider("y"), Some("a"));

        let graph = compose(&c, &[&b, &a]).unwrap();
        assert_eq!(graph.provider("x"), Some("a"));
        assert_eq!(graph.modules(), &["c", "b", "a"]);
    }

    #[test]
    fn test_cycle_only_after_merge() {
        // a: x <- y, y is a constant. b redefines y <- x, closing a loop.
        let a = Module::new("a", vec![passthrough("x", "y"), constant("y", 1)]);
        let b = Module::new("b", vec![passthrough("y", "x")]);

        assert!(compose(&a, &[]).is_ok());
        let err = compose(&a, &[&b]).unwrap_err();
        match err {
            Error::Composition { nodes, message } => {
                assert!(nodes.contains(&"x".to_string()) || nodes.contains(&"y".to_string()));
                assert!(message.contains("->"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Reversed order lets a's constant `y` win, which breaks the loop.
        assert!(compose(&b, &[&a]).is_ok());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let a = Module::new("a", vec![passthrough("x", "x")]);
        assert!(matches!(
            compose(&a, &[]),
            Err(Error::Composition { .. })
        ));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let build = || {
            (
                Module::new("a", vec![constant("x", 1), passthrough("y", "x")]),
                Module::new("b", vec![passthrough("z", "y")]),
            )
        };
        let (a1, b1) = build();
        let (a2, b2) = build();
        let g1 = compose(&a1, &[&b1]).unwrap();
        let g2 = compose(&a2, &[&b2]).unwrap();
        assert_eq!(g1.fingerprint(), g2.fingerprint());

        // Disjoint node names: order changes no provider.
        let g3 = compose(&b1, &[&a1]).unwrap();
        assert_eq!(g1.fingerprint(), g3.fingerprint());

        let base = Module::new("base", vec![constant("x", 1)]);
        let patch = Module::new("patch", vec![constant("x", 2)]);
        let patched = compose(&base, &[&patch]).unwrap();
        let reversed = compose(&patch, &[&base]).unwrap();
        assert_eq!(patched.provider("x"), Some("patch"));
        assert_eq!(reversed.provider("x"), Some("base"));
        assert_ne!(patched.fingerprint(), reversed.fingerprint());
    }

    #[test]
    fn test_plan_only_includes_needed_nodes() {
        let a = Module::new(
            "a",
            vec![
                constant("base", 1),
                passthrough("mid", "base"),
                passthrough("top", "mid"),
                constant("unrelated", 9),
            ],
        );
        let graph = compose(&a, &[]).unwrap();
        let plan = graph.plan(&["top".to_string()], &HashSet::new()).unwrap();
        assert_eq!(
            plan.levels,
            vec![
                vec!["base".to_string()],
                vec!["mid".to_string()],
                vec!["top".to_string()]
            ]
        );
        assert_eq!(plan.node_count(), 3);
    }

    #[test]
    fn test_plan_override_prunes_upstream() {
        let a = Module::new(
            "a",
            vec![
                constant("base", 1),
                passthrough("mid", "base"),
                passthrough("top", "mid"),
            ],
        );
        let graph = compose(&a, &[]).unwrap();
        let overrides: HashSet<String> = ["mid".to_string()].into();
        let plan = graph.plan(&["top".to_string()], &overrides).unwrap();
        assert_eq!(plan.levels, vec![vec!["top".to_string()]]);
    }

    #[test]
    fn test_plan_unknown_target_and_missing_input() {
        let a = Module::new("a", vec![passthrough("y", "external")]);
        let graph = compose(&a, &[]).unwrap();
        assert_eq!(
            graph.external_inputs().into_iter().collect::<Vec<_>>(),
            vec!["external".to_string()]
        );

        assert!(matches!(
            graph.plan(&["nope".to_string()], &HashSet::new()),
            Err(Error::UnknownOutputs { .. })
        ));
        assert!(matches!(
            graph.plan(&["y".to_string()], &HashSet::new()),
            Err(Error::MissingInputs { .. })
        ));
        let overrides: HashSet<String> = ["external".to_string()].into();
        assert!(graph.plan(&["y".to_string()], &overrides).is_ok());
    }

    #[test]
    fn test_plan_levels_group_independent_nodes() {
        let a = Module::new(
            "a",
            vec![
                constant("l", 1),
                constant("r", 2),
                Node::new("sum", &["l", "r"], |args| {
                    Ok(json!(args.i64("l")? + args.i64("r")?))
                }),
            ],
        );
        let graph = compose(&a, &[]).unwrap();
        let plan = graph.plan(&["sum".to_string()], &HashSet::new()).unwrap();
        assert_eq!(plan.levels[0], vec!["l".to_string(), "r".to_string()]);
        assert_eq!(plan.levels[1], vec!["sum".to_string()]);
    }
}
