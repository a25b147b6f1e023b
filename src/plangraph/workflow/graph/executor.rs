// SPDX-License-Identifier: MIT

//! Graph executor - drives nodes and records a checkpoint after each one

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::types::{Edge, Node, NodeContext, NodeOutcome, END};
use crate::adk::error::EngineError;
use crate::plangraph::workflow::checkpoint::{
    CheckpointMeta, CheckpointSource, CheckpointStore, ThreadStatus,
};
use crate::plangraph::workflow::state::WorkflowState;

/// Where a thread stands after an invocation returns
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub thread_id: String,
    pub status: ThreadStatus,
    pub state: WorkflowState,
    /// Head checkpoint written by this invocation
    pub checkpoint_id: Uuid,
}

impl ExecutionResult {
    pub fn is_suspended(&self) -> bool {
        self.status.is_suspended()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ThreadStatus::Completed
    }
}

/// A validated graph ready for execution
pub struct CompiledGraph {
    nodes: HashMap<String, Arc<dyn Node>>,
    edges: HashMap<String, Edge>,
    entry: String,
    recursion_limit: u32,
}

impl CompiledGraph {
    pub(super) fn new(
        nodes: HashMap<String, Arc<dyn Node>>,
        edges: HashMap<String, Edge>,
        entry: String,
        recursion_limit: u32,
    ) -> Self {
        Self {
            nodes,
            edges,
            entry,
            recursion_limit,
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn recursion_limit(&self) -> u32 {
        self.recursion_limit
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    /// Node names, sorted
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.nodes.keys().map(|n| n.as_str()).collect();
        names.sort();
        names
    }

    /// Follow the outgoing edge of `node` for `state`
    pub fn next_after(&self, node: &str, state: &WorkflowState) -> Result<String, EngineError> {
        let edge = self
            .edges
            .get(node)
            .ok_or_else(|| EngineError::config(format!("Node '{}' has no outgoing edge", node)))?;

        match edge {
            Edge::Direct(target) => Ok(target.clone()),
            Edge::Conditional { router, branches } => {
                let label = router.route(state);
                let target =
                    branches
                        .get(&label)
                        .cloned()
                        .ok_or_else(|| EngineError::UnknownLabel {
                            node: node.to_string(),
                            label: label.clone(),
                        })?;
                log::info!("Routing after '{}': {} -> {}", node, label, target);
                Ok(target)
            }
        }
    }

    /// Run nodes starting at `next` until END or a suspension.
    ///
    /// `state` is the state recorded by `last_checkpoint`, the thread's head.
    pub async fn run_from(
        &self,
        thread_id: &str,
        store: &dyn CheckpointStore,
        mut state: WorkflowState,
        mut next: String,
        mut last_checkpoint: Uuid,
    ) -> Result<ExecutionResult, EngineError> {
        let mut executions: u32 = 0;

        loop {
            if next == END {
                log::info!("Thread {} completed", thread_id);
                return Ok(ExecutionResult {
                    thread_id: thread_id.to_string(),
                    status: ThreadStatus::Completed,
                    state,
                    checkpoint_id: last_checkpoint,
                });
            }

            executions += 1;
            if executions > self.recursion_limit {
                log::error!(
                    "Thread {} exceeded the recursion limit of {}",
                    thread_id,
                    self.recursion_limit
                );
                return Err(EngineError::RecursionLimit {
                    limit: self.recursion_limit,
                });
            }

            let node = self
                .nodes
                .get(&next)
                .ok_or_else(|| EngineError::config(format!("Unknown node '{}'", next)))?;
            let ctx = NodeContext {
                thread_id: thread_id.to_string(),
                node: next.clone(),
                execution: executions,
            };

            log::info!("Executing node: {} (thread {})", next, thread_id);
            match node.run(&state, &ctx).await? {
                NodeOutcome::Update(update) => {
                    state = state.apply(&update)?;
                    let target = self.next_after(&next, &state)?;
                    let status = if target == END {
                        ThreadStatus::Completed
                    } else {
                        ThreadStatus::Running
                    };
                    last_checkpoint = store
                        .append(
                            thread_id,
                            &state,
                            CheckpointMeta {
                                node: next.clone(),
                                source: CheckpointSource::Step,
                                next: Some(target.clone()),
                                status,
                            },
                        )
                        .await?;
                    next = target;
                }
                NodeOutcome::Suspend { update, reason } => {
                    state = state.apply(&update)?;
                    let status = ThreadStatus::Suspended {
                        node: next.clone(),
                        reason,
                    };
                    let checkpoint_id = store
                        .append(
                            thread_id,
                            &state,
                            CheckpointMeta {
                                node: next.clone(),
                                source: CheckpointSource::Step,
                                next: None,
                                status: status.clone(),
                            },
                        )
                        .await?;
                    log::info!("Thread {} suspended at node {}", thread_id, next);
                    return Ok(ExecutionResult {
                        thread_id: thread_id.to_string(),
                        status,
                        state,
                        checkpoint_id,
                    });
                }
            }
        }
    }
}
