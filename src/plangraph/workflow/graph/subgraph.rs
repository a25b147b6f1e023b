// SPDX-License-Identifier: MIT

//! A compiled graph running as a single node of another graph
//!
//! The child runs over the parent's state and schema on a private in-memory
//! checkpoint store. Its intermediate checkpoints are discarded; the parent
//! records one checkpoint for the whole child run.

use async_trait::async_trait;
use std::sync::Arc;

use crate::adk::error::EngineError;
use crate::plangraph::workflow::checkpoint::{
    CheckpointMeta, CheckpointSource, CheckpointStore, MemoryCheckpointStore, ThreadStatus,
    INPUT_NODE,
};
use crate::plangraph::workflow::state::{StateUpdate, WorkflowState};

use super::executor::CompiledGraph;
use super::types::{Node, NodeContext, NodeOutcome};

pub struct SubgraphNode {
    graph: Arc<CompiledGraph>,
}

impl SubgraphNode {
    pub fn new(graph: Arc<CompiledGraph>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl Node for SubgraphNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let store = MemoryCheckpointStore::new();
        let thread_id = format!("{}/{}#{}", ctx.thread_id, ctx.node, ctx.execution);
        let entry = self.graph.entry().to_string();
        let input = store
            .append(
                &thread_id,
                state,
                CheckpointMeta {
                    node: INPUT_NODE.to_string(),
                    source: CheckpointSource::Input,
                    next: Some(entry.clone()),
                    status: ThreadStatus::Running,
                },
            )
            .await?;

        let result = self
            .graph
            .run_from(&thread_id, &store, state.clone(), entry, input)
            .await?;
        if result.is_suspended() {
            return Err(EngineError::node(
                &ctx.node,
                "subgraph suspended; interrupts are only supported in the outer graph",
            ));
        }

        // The child already applied its reducers, so changed fields are
        // copied over as they are.
        let mut update = StateUpdate::new();
        for key in result.state.keys() {
            let value = result.state.get(key);
            if value != state.get(key) {
                if let Some(value) = value {
                    update = update.replace(key, value.clone());
                }
            }
        }
        log::debug!(
            "Subgraph {} changed {} field(s)",
            thread_id,
            update.entries().len()
        );
        Ok(NodeOutcome::Update(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plangraph::workflow::graph::types::FnNode;
    use crate::plangraph::workflow::graph::{GraphBuilder, END};
    use crate::plangraph::workflow::state::{FieldType, ReducerType, StateSchema};
    use serde_json::json;

    fn schema() -> Arc<StateSchema> {
        Arc::new(
            StateSchema::default()
                .field("count", FieldType::Number, ReducerType::Sum, Some(json!(0)))
                .field("trail", FieldType::Array, ReducerType::Append, Some(json!([])))
                .field("untouched", FieldType::String, ReducerType::Overwrite, None),
        )
    }

    fn step(name: &'static str) -> Arc<dyn Node> {
        Arc::new(FnNode::new(move |_: &WorkflowState| {
            Ok(NodeOutcome::Update(
                StateUpdate::new()
                    .with("count", json!(1))
                    .with("trail", json!([name])),
            ))
        }))
    }

    fn ctx() -> NodeContext {
        NodeContext {
            thread_id: "t1".to_string(),
            node: "child".to_string(),
            execution: 1,
        }
    }

    #[tokio::test]
    async fn test_child_changes_apply_once() {
        let child = GraphBuilder::new()
            .add_node("a", step("a"))
            .add_node("b", step("b"))
            .add_edge("a", "b")
            .add_edge("b", END)
            .set_entry("a")
            .compile()
            .unwrap();
        let node = SubgraphNode::new(Arc::new(child));

        let state = WorkflowState::from_schema(schema())
            .apply(
                &StateUpdate::new()
                    .with("count", json!(5))
                    .with("trail", json!(["parent"]))
                    .with("untouched", json!("keep")),
            )
            .unwrap();
        let outcome = node.run(&state, &ctx()).await.unwrap();

        assert!(outcome.update().get("untouched").is_none());
        let next = state.apply(outcome.update()).unwrap();
        assert_eq!(next.get("count"), Some(&json!(7)));
        assert_eq!(next.get("trail"), Some(&json!(["parent", "a", "b"])));
        assert_eq!(next.get_str("untouched"), Some("keep"));
    }

    #[tokio::test]
    async fn test_child_suspension_is_an_error() {
        let gate: Arc<dyn Node> = Arc::new(FnNode::new(|_: &WorkflowState| {
            Ok(NodeOutcome::Suspend {
                update: StateUpdate::new(),
                reason: "needs input".to_string(),
            })
        }));
        let child = GraphBuilder::new()
            .add_node("gate", gate)
            .add_edge("gate", END)
            .set_entry("gate")
            .compile()
            .unwrap();
        let node = SubgraphNode::new(Arc::new(child));

        let state = WorkflowState::from_schema(schema());
        let err = node.run(&state, &ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::Node { .. }));
    }
}
