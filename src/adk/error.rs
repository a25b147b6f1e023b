// SPDX-License-Identifier: MIT

//! Typed error handling for plangraph-rs
//!
//! Expected step failures never show up here: nodes record them in state
//! (`step_success = false` plus an `errors` entry) and let the retry/replan
//! loop deal with them. What remains are faults that must reach the host.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::plangraph::workflow::state::FieldType;

/// Top-level error type surfaced by the engine and the host API
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph or schema misconfiguration, detected when compiling
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A state update violated the schema
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Checkpoint lookup or write failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The host asked for a thread that has never been started
    #[error("Thread '{0}' not found")]
    ThreadNotFound(String),

    /// `start` was called with a thread id that already has history
    #[error("Thread '{0}' already exists")]
    ThreadExists(String),

    /// `resume` was called on a thread that is not waiting for input
    #[error("Thread '{thread_id}' is not awaiting input")]
    NotSuspended { thread_id: String },

    /// A resume patch was rejected by the suspended node
    #[error("Invalid resume: {0}")]
    InvalidResume(String),

    /// A router returned a label it never declared
    #[error("Router after '{node}' returned unknown label '{label}'")]
    UnknownLabel { node: String, label: String },

    /// A node hit an unrecoverable fault
    #[error("Node '{node}' failed: {message}")]
    Node { node: String, message: String },

    /// Too many node executions in one invocation
    #[error("Recursion limit of {limit} node executions reached")]
    RecursionLimit { limit: u32 },

    /// External call failure that could not be absorbed as a step failure
    #[error(transparent)]
    External(#[from] ExternalError),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a node fault
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Node {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create an invalid resume error
    pub fn invalid_resume(message: impl Into<String>) -> Self {
        Self::InvalidResume(message.into())
    }
}

/// Errors raised while merging an update into workflow state
#[derive(Debug, Error)]
pub enum StateError {
    /// The update names a field the schema does not declare
    #[error("Unknown state field '{0}'")]
    UnknownField(String),

    /// The value does not match the declared field type
    #[error("Field '{field}' expects {expected:?}, got {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: String,
    },

    /// A field could not be decoded into the requested Rust type
    #[error("Field '{field}' could not be decoded: {source}")]
    Decode {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Checkpoint store errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// No checkpoints exist for the thread
    #[error("No checkpoints for thread '{0}'")]
    ThreadNotFound(String),

    /// The checkpoint id is not part of the thread's history
    #[error("Checkpoint {id} not found in thread '{thread_id}'")]
    NotFound { thread_id: String, id: Uuid },
}

/// Failures of calls that leave the process (reasoner, capabilities, embeddings)
#[derive(Debug, Clone, Error)]
pub enum ExternalError {
    /// The call did not finish within its time budget
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Connection or server-side failure; worth retrying
    #[error("{operation} failed: {message}")]
    Network { operation: String, message: String },

    /// The remote side refused the request; retrying will not help
    #[error("{operation} rejected: {message}")]
    Rejected { operation: String, message: String },
}

impl ExternalError {
    /// Create a transient network error
    pub fn network(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a permanent rejection
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Network { .. })
    }
}

impl From<reqwest::Error> for ExternalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: "http request".to_string(),
                after: Duration::ZERO,
            }
        } else if err.is_connect() || err.status().map_or(true, |s| s.is_server_error()) {
            Self::network("http request", err.to_string())
        } else {
            Self::rejected("http request", err.to_string())
        }
    }
}
