// SPDX-License-Identifier: MIT

//! Checkpoint persistence
//!
//! Every node execution produces exactly one checkpoint holding the full
//! state snapshot. Checkpoints of a thread form a tree: appends extend the
//! current head, forks start a new branch from any historical checkpoint.
//! Only the runtime writes checkpoints; nodes never see the store.

mod memory;

pub use memory::MemoryCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adk::error::{CheckpointError, EngineError};
use crate::plangraph::workflow::state::{StateUpdate, WorkflowState};

/// Node name recorded on the checkpoint holding the initial input
pub const INPUT_NODE: &str = "__input__";

/// Execution status of a thread as of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThreadStatus {
    /// More nodes will run
    Running,
    /// Waiting for the host to resume
    Suspended { node: String, reason: String },
    /// A terminal edge was reached
    Completed,
}

impl ThreadStatus {
    pub fn is_suspended(&self) -> bool {
        matches!(self, ThreadStatus::Suspended { .. })
    }
}

/// What produced a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Initial input supplied by `start`
    Input,
    /// A node execution
    Step,
    /// A resume patch merged into a suspended thread
    Resume,
    /// A patched copy of a historical checkpoint
    Fork,
}

/// Bookkeeping written alongside a state snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Node whose outgoing edges continue the run from this checkpoint
    pub node: String,
    pub source: CheckpointSource,
    /// Node routed to next, `__end__`, or `None` while suspended
    pub next: Option<String>,
    pub status: ThreadStatus,
}

/// Immutable snapshot of a thread's state after one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub thread_id: String,
    /// Monotonic per thread, across all branches
    pub sequence_no: u64,
    pub parent_id: Option<Uuid>,
    #[serde(flatten)]
    pub meta: CheckpointMeta,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Render the checkpoint for export
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Storage backend for per-thread checkpoint history
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint after the thread's current head and make it the new head
    async fn append(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        meta: CheckpointMeta,
    ) -> Result<Uuid, CheckpointError>;

    /// Active branch of the thread, most recent first
    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Every checkpoint of the thread across all branches, in sequence order
    async fn all(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    async fn get(&self, thread_id: &str, id: Uuid) -> Result<Checkpoint, CheckpointError>;

    /// Current head; `None` if the thread has no checkpoints
    async fn head(&self, thread_id: &str) -> Option<Checkpoint>;

    /// Apply `patch` to the state at `id` and append the result as a new head
    /// whose parent is `id`. Existing checkpoints are left untouched.
    async fn fork(
        &self,
        thread_id: &str,
        id: Uuid,
        patch: &StateUpdate,
        meta: CheckpointMeta,
    ) -> Result<Uuid, EngineError>;

    /// Drop every checkpoint of the thread. Returns whether it existed.
    async fn delete_thread(&self, thread_id: &str) -> bool;

    /// Known thread ids, sorted
    async fn threads(&self) -> Vec<String>;
}
