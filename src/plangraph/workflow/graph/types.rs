// SPDX-License-Identifier: MIT

//! Graph building blocks: nodes, routers, and edges

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::adk::error::EngineError;
use crate::plangraph::workflow::checkpoint::Checkpoint;
use crate::plangraph::workflow::state::{StateUpdate, WorkflowState};

/// Terminal edge target
pub const END: &str = "__end__";

/// Information handed to a node alongside the state
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub thread_id: String,
    pub node: String,
    /// 1-based count of node executions in the current invocation
    pub execution: u32,
}

/// Result of running a node
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Merge the update and follow the node's outgoing edge
    Update(StateUpdate),
    /// Merge the update, checkpoint, and wait for the host to resume
    Suspend { update: StateUpdate, reason: String },
}

impl NodeOutcome {
    pub fn update(&self) -> &StateUpdate {
        match self {
            NodeOutcome::Update(update) => update,
            NodeOutcome::Suspend { update, .. } => update,
        }
    }
}

impl From<StateUpdate> for NodeOutcome {
    fn from(update: StateUpdate) -> Self {
        NodeOutcome::Update(update)
    }
}

/// A unit of work in the graph.
///
/// Nodes read the state and return a partial update; they never write
/// checkpoints or mutate state directly.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, state: &WorkflowState, ctx: &NodeContext)
        -> Result<NodeOutcome, EngineError>;

    /// Validate a resume patch for a thread suspended at this node.
    ///
    /// Returns extra bookkeeping merged after the patch. Rejecting the patch
    /// leaves the thread suspended and untouched.
    fn on_resume(
        &self,
        _state: &WorkflowState,
        _patch: &StateUpdate,
    ) -> Result<StateUpdate, EngineError> {
        Ok(StateUpdate::new())
    }

    /// Check that continuing after this node from `state` does not repeat
    /// work already done on another branch of the thread.
    ///
    /// `elsewhere` holds every checkpoint of the thread outside the lineage
    /// the run continues from. Called before `resume` and `edit_and_resume`
    /// write anything.
    fn on_branch(
        &self,
        _state: &WorkflowState,
        _elsewhere: &[Checkpoint],
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Picks the next branch label from the state
pub trait Router: Send + Sync {
    /// Every label `route` may return
    fn labels(&self) -> Vec<String>;

    fn route(&self, state: &WorkflowState) -> String;
}

/// Node backed by a synchronous closure
pub struct FnNode<F> {
    f: F,
}

impl<F> FnNode<F>
where
    F: Fn(&WorkflowState) -> Result<NodeOutcome, EngineError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Node for FnNode<F>
where
    F: Fn(&WorkflowState) -> Result<NodeOutcome, EngineError> + Send + Sync,
{
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        (self.f)(state)
    }
}

/// Router backed by a closure and a fixed label set
pub struct FnRouter<F> {
    labels: Vec<String>,
    f: F,
}

impl<F> FnRouter<F>
where
    F: Fn(&WorkflowState) -> String + Send + Sync,
{
    pub fn new(labels: &[&str], f: F) -> Self {
        Self {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            f,
        }
    }
}

impl<F> Router for FnRouter<F>
where
    F: Fn(&WorkflowState) -> String + Send + Sync,
{
    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn route(&self, state: &WorkflowState) -> String {
        (self.f)(state)
    }
}

/// Outgoing edge of a node
#[derive(Clone)]
pub enum Edge {
    /// Always continue to the target
    Direct(String),
    /// Ask the router for a label and follow the mapped branch
    Conditional {
        router: Arc<dyn Router>,
        branches: HashMap<String, String>,
    },
}

impl Edge {
    /// Every node this edge can lead to
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Edge::Direct(target) => vec![target.as_str()],
            Edge::Conditional { branches, .. } => branches.values().map(|t| t.as_str()).collect(),
        }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct(target) => f.debug_tuple("Direct").field(target).finish(),
            Edge::Conditional { branches, .. } => f
                .debug_struct("Conditional")
                .field("branches", branches)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plangraph::workflow::state::{FieldType, ReducerType, StateSchema};
    use serde_json::json;

    fn state() -> WorkflowState {
        let schema = StateSchema::default().field(
            "flag",
            FieldType::Boolean,
            ReducerType::Overwrite,
            Some(json!(true)),
        );
        WorkflowState::from_schema(Arc::new(schema))
    }

    #[tokio::test]
    async fn test_fn_node_runs_closure() {
        let node = FnNode::new(|_state: &WorkflowState| {
            Ok(StateUpdate::new().with("flag", json!(false)).into())
        });
        let ctx = NodeContext {
            thread_id: "t".to_string(),
            node: "n".to_string(),
            execution: 1,
        };

        let outcome = node.run(&state(), &ctx).await.unwrap();
        assert_eq!(outcome.update().get("flag"), Some(&json!(false)));
        assert!(node
            .on_resume(&state(), &StateUpdate::new())
            .unwrap()
            .is_empty());
        assert!(node.on_branch(&state(), &[]).is_ok());
    }

    #[test]
    fn test_fn_router() {
        let router = FnRouter::new(&["yes", "no"], |s: &WorkflowState| {
            if s.get_bool("flag") == Some(true) {
                "yes".to_string()
            } else {
                "no".to_string()
            }
        });
        assert_eq!(router.labels(), vec!["yes", "no"]);
        assert_eq!(router.route(&state()), "yes");
    }

    #[test]
    fn test_edge_targets() {
        let edge = Edge::Direct("b".to_string());
        assert_eq!(edge.targets(), vec!["b"]);

        let router: Arc<dyn Router> = Arc::new(FnRouter::new(&["x"], |_: &WorkflowState| "x".to_string()));
        let edge = Edge::Conditional {
            router,
            branches: HashMap::from([("x".to_string(), END.to_string())]),
        };
        assert_eq!(edge.targets(), vec![END]);
    }
}
