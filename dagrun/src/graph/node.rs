//! Computation nodes.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Values handed to a node computation, keyed by declared input name.
#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    values: BTreeMap<String, Value>,
}

impl NodeInputs {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Get an input value by name.
    pub fn get(&self, name: &str) -> anyhow::Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("input '{}' was not provided", name))
    }

    /// Get an input as `f64`.
    pub fn f64(&self, name: &str) -> anyhow::Result<f64> {
        self.get(name)?
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("input '{}' is not a number", name))
    }

    /// Get an input as `i64`.
    pub fn i64(&self, name: &str) -> anyhow::Result<i64> {
        self.get(name)?
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("input '{}' is not an integer", name))
    }

    /// Get an input as a string slice.
    pub fn str(&self, name: &str) -> anyhow::Result<&str> {
        self.get(name)?
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("input '{}' is not a string", name))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Type-erased node computation.
pub type NodeFn =
    Arc<dyn Fn(NodeInputs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A named computation unit with declared inputs.
///
/// Nodes are cheap to clone; the computation is shared.
#[derive(Clone)]
pub struct Node {
    name: String,
    inputs: Vec<String>,
    compute: NodeFn,
}

impl Node {
    /// Create a node from a synchronous closure.
    pub fn new<F>(name: impl Into<String>, inputs: &[&str], f: F) -> Self
    where
        F: Fn(&NodeInputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::from_fn(
            name,
            inputs,
            Arc::new(move |args: NodeInputs| {
                let f = f.clone();
                async move { f(&args) }.boxed()
            }),
        )
    }

    /// Create a node from an async closure.
    pub fn new_async<F, Fut>(name: impl Into<String>, inputs: &[&str], f: F) -> Self
    where
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::from_fn(name, inputs, Arc::new(move |args| f(args).boxed()))
    }

    /// Create a node whose computation runs on the blocking thread pool.
    ///
    /// Use this for CPU-heavy work so async runs are not starved.
    pub fn blocking<F>(name: impl Into<String>, inputs: &[&str], f: F) -> Self
    where
        F: Fn(&NodeInputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::from_fn(
            name,
            inputs,
            Arc::new(move |args: NodeInputs| {
                let f = f.clone();
                async move {
                    tokio::task::spawn_blocking(move || f(&args))
                        .await
                        .map_err(|e| anyhow::anyhow!("blocking computation panicked: {}", e))?
                }
                .boxed()
            }),
        )
    }

    fn from_fn(name: impl Into<String>, inputs: &[&str], compute: NodeFn) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            compute,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared input names, in declaration order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Run the computation.
    pub fn call(&self, inputs: NodeInputs) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.compute)(inputs)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> NodeInputs {
        NodeInputs::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_sync_node() {
        let node = Node::new("double", &["x"], |args| Ok(json!(args.i64("x")? * 2)));
        assert_eq!(node.inputs(), &["x".to_string()]);
        let out = node.call(inputs(&[("x", json!(21))])).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn test_async_node() {
        let node = Node::new_async("greet", &["who"], |args| async move {
            tokio::task::yield_now().await;
            Ok(json!(format!("hello {}", args.str("who")?)))
        });
        let out = node.call(inputs(&[("who", json!("world"))])).await.unwrap();
        assert_eq!(out, json!("hello world"));
    }

    #[tokio::test]
    async fn test_blocking_node() {
        let node = Node::blocking("sum", &["a", "b"], |args| {
            Ok(json!(args.f64("a")? + args.f64("b")?))
        });
        let out = node
            .call(inputs(&[("a", json!(1.5)), ("b", json!(2.5))]))
            .await
            .unwrap();
        assert_eq!(out, json!(4.0));
    }

    #[tokio::test]
    async fn test_missing_input_is_an_error() {
        let node = Node::new("double", &["x"], |args| Ok(json!(args.i64("x")? * 2)));
        let err = node.call(NodeInputs::default()).await.unwrap_err();
        assert!(err.to_string().contains("'x'"));
    }
}
