// SPDX-License-Identifier: MIT

//! Reasoner module - the opaque decision-making call
//!
//! The engine never looks inside a reasoner. It hands over the conversation
//! so far plus the capabilities selected for the current step, and gets back
//! a message and (optionally) capability calls to perform.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::adk::capability::{Capability, CapabilityCall};
use crate::adk::error::ExternalError;

/// Author of a message in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Answer to a capability call
    Capability,
}

/// A message in the conversation / audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Calls requested alongside this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_calls: Vec<CapabilityCall>,
    /// For `Role::Capability` messages, the call being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            capability_calls: Vec::new(),
            call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Assistant message that requests capability calls
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<CapabilityCall>) -> Self {
        Self {
            capability_calls: calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Answer to the capability call `call_id`
    pub fn capability(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: Some(call_id.into()),
            ..Self::with_role(Role::Capability, content)
        }
    }
}

/// What the reasoner decided for the current step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Message content (answer, or commentary for the calls)
    pub content: String,
    /// Capability calls to perform before asking again
    #[serde(default)]
    pub capability_calls: Vec<CapabilityCall>,
    /// Whether the step's success criteria are met; ignored while calls are pending
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

impl Decision {
    /// A final answer that satisfies the step
    pub fn answer(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            capability_calls: Vec::new(),
            success: true,
        }
    }

    /// A final answer that does not satisfy the step's success criteria
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            content: reason.into(),
            capability_calls: Vec::new(),
            success: false,
        }
    }

    /// Request capability calls
    pub fn call(content: impl Into<String>, calls: Vec<CapabilityCall>) -> Self {
        Self {
            content: content.into(),
            capability_calls: calls,
            success: true,
        }
    }
}

/// Core trait for the external reasoning step
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn decide(
        &self,
        context: &[Message],
        available: &[Arc<dyn Capability>],
    ) -> Result<Decision, ExternalError>;
}
