// SPDX-License-Identifier: MIT

//! In-memory checkpoint store

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{Checkpoint, CheckpointMeta, CheckpointSource, CheckpointStore};
use crate::adk::error::{CheckpointError, EngineError};
use crate::plangraph::workflow::state::{StateUpdate, WorkflowState};

/// Checkpoints of one thread
#[derive(Default)]
struct ThreadLog {
    /// All checkpoints in sequence order
    checkpoints: Vec<Checkpoint>,
    /// Checkpoint id -> position in `checkpoints`
    index: HashMap<Uuid, usize>,
    head: Option<usize>,
}

impl ThreadLog {
    fn push(
        &mut self,
        thread_id: &str,
        parent_id: Option<Uuid>,
        state: WorkflowState,
        meta: CheckpointMeta,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let sequence_no = self.checkpoints.len() as u64 + 1;
        self.index.insert(id, self.checkpoints.len());
        self.checkpoints.push(Checkpoint {
            id,
            thread_id: thread_id.to_string(),
            sequence_no,
            parent_id,
            meta,
            state,
            created_at: Utc::now(),
        });
        self.head = Some(self.checkpoints.len() - 1);
        id
    }

    fn get(&self, id: Uuid) -> Option<&Checkpoint> {
        self.index.get(&id).map(|&i| &self.checkpoints[i])
    }

    fn head_id(&self) -> Option<Uuid> {
        self.head.map(|i| self.checkpoints[i].id)
    }
}

/// Process-local store; threads are isolated behind their own lock so
/// distinct thread ids never contend beyond the map lookup.
#[derive(Default, Clone)]
pub struct MemoryCheckpointStore {
    threads: Arc<RwLock<HashMap<String, Arc<Mutex<ThreadLog>>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn thread(&self, thread_id: &str) -> Option<Arc<Mutex<ThreadLog>>> {
        self.threads.read().await.get(thread_id).cloned()
    }

    async fn thread_or_create(&self, thread_id: &str) -> Arc<Mutex<ThreadLog>> {
        if let Some(log) = self.thread(thread_id).await {
            return log;
        }
        let mut threads = self.threads.write().await;
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ThreadLog::default())))
            .clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn append(
        &self,
        thread_id: &str,
        state: &WorkflowState,
        meta: CheckpointMeta,
    ) -> Result<Uuid, CheckpointError> {
        let log = self.thread_or_create(thread_id).await;
        let mut log = log.lock().await;
        let parent = log.head_id();
        let id = log.push(thread_id, parent, state.clone(), meta);
        log::debug!(
            "Checkpoint {} appended to thread {} (seq {})",
            id,
            thread_id,
            log.checkpoints.len()
        );
        Ok(id)
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let log = self
            .thread(thread_id)
            .await
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))?;
        let log = log.lock().await;

        let mut history = Vec::new();
        let mut cursor = log.head_id();
        while let Some(id) = cursor {
            let Some(checkpoint) = log.get(id) else {
                break;
            };
            history.push(checkpoint.clone());
            cursor = checkpoint.parent_id;
        }
        Ok(history)
    }

    async fn all(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let log = self
            .thread(thread_id)
            .await
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))?;
        let log = log.lock().await;
        Ok(log.checkpoints.clone())
    }

    async fn get(&self, thread_id: &str, id: Uuid) -> Result<Checkpoint, CheckpointError> {
        let log = self
            .thread(thread_id)
            .await
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))?;
        let log = log.lock().await;
        log.get(id)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound {
                thread_id: thread_id.to_string(),
                id,
            })
    }

    async fn head(&self, thread_id: &str) -> Option<Checkpoint> {
        let log = self.thread(thread_id).await?;
        let log = log.lock().await;
        log.head.map(|i| log.checkpoints[i].clone())
    }

    async fn fork(
        &self,
        thread_id: &str,
        id: Uuid,
        patch: &StateUpdate,
        meta: CheckpointMeta,
    ) -> Result<Uuid, EngineError> {
        let log = self
            .thread(thread_id)
            .await
            .ok_or_else(|| CheckpointError::ThreadNotFound(thread_id.to_string()))?;
        let mut log = log.lock().await;

        let source = log.get(id).ok_or_else(|| CheckpointError::NotFound {
            thread_id: thread_id.to_string(),
            id,
        })?;
        let state = source.state.apply(patch)?;
        let meta = CheckpointMeta {
            source: CheckpointSource::Fork,
            ..meta
        };

        let new_id = log.push(thread_id, Some(id), state, meta);
        log::info!(
            "Forked thread {} from checkpoint {} as {}",
            thread_id,
            id,
            new_id
        );
        Ok(new_id)
    }

    async fn delete_thread(&self, thread_id: &str) -> bool {
        self.threads.write().await.remove(thread_id).is_some()
    }

    async fn threads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.threads.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
