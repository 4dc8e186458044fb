//! Node definitions and graph composition.

mod compose;
mod node;

pub use compose::{ComposedGraph, ExecutionPlan, GraphNode, compose};
pub use node::{Node, NodeFn, NodeInputs};
