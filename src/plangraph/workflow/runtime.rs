// SPDX-License-Identifier: MIT

//! Host-facing runtime
//!
//! Owns a compiled graph and a checkpoint store. Calls for the same thread id
//! are serialized by a per-thread lock; distinct threads run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::adk::error::{CheckpointError, EngineError};
use crate::plangraph::workflow::checkpoint::{
    Checkpoint, CheckpointMeta, CheckpointSource, CheckpointStore, MemoryCheckpointStore,
    ThreadStatus, INPUT_NODE,
};
use crate::plangraph::workflow::graph::{CompiledGraph, ExecutionResult, END};
use crate::plangraph::workflow::state::{StateSchema, StateUpdate, WorkflowState};

fn thread_error(err: CheckpointError) -> EngineError {
    match err {
        CheckpointError::ThreadNotFound(id) => EngineError::ThreadNotFound(id),
        other => EngineError::Checkpoint(other),
    }
}

fn status_for(next: &str) -> ThreadStatus {
    if next == END {
        ThreadStatus::Completed
    } else {
        ThreadStatus::Running
    }
}

pub struct WorkflowRuntime {
    graph: Arc<CompiledGraph>,
    schema: Arc<StateSchema>,
    store: Arc<dyn CheckpointStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowRuntime {
    /// Runtime backed by an in-memory checkpoint store
    pub fn new(graph: Arc<CompiledGraph>, schema: Arc<StateSchema>) -> Self {
        Self::with_store(graph, schema, Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn with_store(
        graph: Arc<CompiledGraph>,
        schema: Arc<StateSchema>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            graph,
            schema,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    async fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry of a thread that does not exist once no other call
    /// holds or waits on it
    async fn release(&self, thread_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().await;
        let idle = locks
            .get(thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle && self.store.head(thread_id).await.is_none() {
            locks.remove(thread_id);
        }
    }

    /// Checkpoints of the thread that are not `base` or one of its ancestors
    async fn outside_lineage(
        &self,
        thread_id: &str,
        base: &Checkpoint,
    ) -> Result<Vec<Checkpoint>, EngineError> {
        let all = self.store.all(thread_id).await.map_err(thread_error)?;
        let parents: HashMap<Uuid, Option<Uuid>> =
            all.iter().map(|cp| (cp.id, cp.parent_id)).collect();

        let mut lineage = HashSet::new();
        let mut cursor = Some(base.id);
        while let Some(id) = cursor {
            if !lineage.insert(id) {
                break;
            }
            cursor = parents.get(&id).copied().flatten();
        }

        Ok(all
            .into_iter()
            .filter(|cp| !lineage.contains(&cp.id))
            .collect())
    }

    /// Create a thread from `input` and run it until it completes or suspends
    pub async fn start(
        &self,
        thread_id: &str,
        input: StateUpdate,
    ) -> Result<ExecutionResult, EngineError> {
        let lock = self.thread_lock(thread_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(thread_id, input).await
        };
        self.release(thread_id, lock).await;
        result
    }

    async fn start_locked(
        &self,
        thread_id: &str,
        input: StateUpdate,
    ) -> Result<ExecutionResult, EngineError> {
        if self.store.head(thread_id).await.is_some() {
            return Err(EngineError::ThreadExists(thread_id.to_string()));
        }

        let state = WorkflowState::from_schema(self.schema.clone()).apply(&input)?;
        let entry = self.graph.entry().to_string();
        let id = self
            .store
            .append(
                thread_id,
                &state,
                CheckpointMeta {
                    node: INPUT_NODE.to_string(),
                    source: CheckpointSource::Input,
                    next: Some(entry.clone()),
                    status: ThreadStatus::Running,
                },
            )
            .await?;
        log::info!("Started thread {}", thread_id);

        self.graph
            .run_from(thread_id, self.store.as_ref(), state, entry, id)
            .await
    }

    /// Merge `patch` into a suspended thread and continue after the
    /// suspending node without running it again
    pub async fn resume(
        &self,
        thread_id: &str,
        patch: StateUpdate,
    ) -> Result<ExecutionResult, EngineError> {
        let lock = self.thread_lock(thread_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.resume_locked(thread_id, patch).await
        };
        self.release(thread_id, lock).await;
        result
    }

    async fn resume_locked(
        &self,
        thread_id: &str,
        patch: StateUpdate,
    ) -> Result<ExecutionResult, EngineError> {
        let head = self
            .store
            .head(thread_id)
            .await
            .ok_or_else(|| EngineError::ThreadNotFound(thread_id.to_string()))?;
        let ThreadStatus::Suspended { node, .. } = &head.meta.status else {
            return Err(EngineError::NotSuspended {
                thread_id: thread_id.to_string(),
            });
        };
        let node = node.clone();

        let handler = self
            .graph
            .node(&node)
            .ok_or_else(|| EngineError::config(format!("Unknown node '{}'", node)))?;
        let extra = handler.on_resume(&head.state, &patch)?;
        let state = head.state.apply(&patch)?.apply(&extra)?;
        handler.on_branch(&state, &self.outside_lineage(thread_id, &head).await?)?;
        let next = self.graph.next_after(&node, &state)?;

        let id = self
            .store
            .append(
                thread_id,
                &state,
                CheckpointMeta {
                    node,
                    source: CheckpointSource::Resume,
                    next: Some(next.clone()),
                    status: status_for(&next),
                },
            )
            .await?;
        log::info!("Resumed thread {}", thread_id);

        self.graph
            .run_from(thread_id, self.store.as_ref(), state, next, id)
            .await
    }

    /// Branch from a historical checkpoint with `patch` applied and run the
    /// branch. Earlier history is kept; the new branch becomes the head.
    pub async fn edit_and_resume(
        &self,
        thread_id: &str,
        checkpoint_id: Uuid,
        patch: StateUpdate,
    ) -> Result<ExecutionResult, EngineError> {
        let lock = self.thread_lock(thread_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.edit_and_resume_locked(thread_id, checkpoint_id, patch)
                .await
        };
        self.release(thread_id, lock).await;
        result
    }

    async fn edit_and_resume_locked(
        &self,
        thread_id: &str,
        checkpoint_id: Uuid,
        patch: StateUpdate,
    ) -> Result<ExecutionResult, EngineError> {
        let base = self
            .store
            .get(thread_id, checkpoint_id)
            .await
            .map_err(thread_error)?;
        let handler = match base.meta.node.as_str() {
            INPUT_NODE => None,
            node => Some(
                self.graph
                    .node(node)
                    .ok_or_else(|| EngineError::config(format!("Unknown node '{}'", node)))?,
            ),
        };

        // A suspended checkpoint is answered the same way `resume` would
        let patch = match (&base.meta.status, handler) {
            (ThreadStatus::Suspended { .. }, Some(handler)) => {
                let extra = handler.on_resume(&base.state, &patch)?;
                patch.merge(extra)
            }
            _ => patch,
        };

        let preview = base.state.apply(&patch)?;
        if let Some(handler) = handler {
            handler.on_branch(&preview, &self.outside_lineage(thread_id, &base).await?)?;
        }
        let next = match handler {
            None => self.graph.entry().to_string(),
            Some(_) => self.graph.next_after(&base.meta.node, &preview)?,
        };

        let id = self
            .store
            .fork(
                thread_id,
                checkpoint_id,
                &patch,
                CheckpointMeta {
                    node: base.meta.node.clone(),
                    source: CheckpointSource::Fork,
                    next: Some(next.clone()),
                    status: status_for(&next),
                },
            )
            .await?;
        log::info!(
            "Forked thread {} at checkpoint {} (sequence {})",
            thread_id,
            checkpoint_id,
            base.sequence_no
        );

        self.graph
            .run_from(thread_id, self.store.as_ref(), preview, next, id)
            .await
    }

    /// State at the thread's head
    pub async fn get_state(&self, thread_id: &str) -> Result<WorkflowState, EngineError> {
        self.store
            .head(thread_id)
            .await
            .map(|head| head.state)
            .ok_or_else(|| EngineError::ThreadNotFound(thread_id.to_string()))
    }

    /// Checkpoints of the active branch, oldest first
    pub async fn get_history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, EngineError> {
        let mut history = self.store.history(thread_id).await.map_err(thread_error)?;
        history.reverse();
        Ok(history)
    }

    pub async fn status(&self, thread_id: &str) -> Result<ThreadStatus, EngineError> {
        self.store
            .head(thread_id)
            .await
            .map(|head| head.meta.status)
            .ok_or_else(|| EngineError::ThreadNotFound(thread_id.to_string()))
    }

    /// Remove a thread and its history. Returns whether it existed.
    pub async fn delete_thread(&self, thread_id: &str) -> bool {
        let lock = self.thread_lock(thread_id).await;
        let existed = {
            let _guard = lock.lock().await;
            self.store.delete_thread(thread_id).await
        };
        self.locks.lock().await.remove(thread_id);
        if existed {
            log::info!("Deleted thread {}", thread_id);
        }
        existed
    }

    pub async fn threads(&self) -> Vec<String> {
        self.store.threads().await
    }
}
