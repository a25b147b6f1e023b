// SPDX-License-Identifier: MIT

//! Graph-based workflow execution
//!
//! Nodes are async steps over the workflow state, edges are either direct or
//! routed by a `Router`. A `GraphBuilder` validates the whole topology when
//! compiling: every label a router declares must map to a branch. A compiled
//! graph can itself run as a node through `SubgraphNode`.

pub mod builder;
pub mod executor;
pub mod subgraph;
pub mod types;

pub use builder::GraphBuilder;
pub use executor::{CompiledGraph, ExecutionResult};
pub use subgraph::SubgraphNode;
pub use types::{Edge, FnNode, FnRouter, Node, NodeContext, NodeOutcome, Router, END};
