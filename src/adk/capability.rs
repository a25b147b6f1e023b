// SPDX-License-Identifier: MIT

//! Capabilities - named external actions the engine may invoke
//!
//! Capabilities are supplied by the host. The engine only looks at their
//! metadata: the name and description feed the ranker, and
//! `side_effecting` decides whether the approval gate must intercept a call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::adk::error::{EngineError, ExternalError};

/// Trait for actions and queries the engine can call on the host's behalf.
///
/// `name()` and `description()` return `&str`; implementations should keep
/// them in struct fields.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Returns the capability name (unique within a pool)
    fn name(&self) -> &str;

    /// Returns a human-readable description used for ranking
    fn description(&self) -> &str;

    /// Whether invoking this capability changes the outside world
    fn side_effecting(&self) -> bool {
        false
    }

    /// Invoke the capability with JSON arguments
    async fn invoke(&self, args: Value) -> Result<Value, ExternalError>;
}

/// A capability call requested by the reasoner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCall {
    /// Call identifier, answered by exactly one capability message
    pub id: String,
    /// Target capability name
    pub name: String,
    /// Arguments
    #[serde(default)]
    pub args: Value,
}

impl CapabilityCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// Ordered, read-only set of capabilities exposed to a workflow.
///
/// Declaration order is kept because the ranker breaks score ties by it.
#[derive(Clone, Default)]
pub struct CapabilityPool {
    capabilities: Vec<Arc<dyn Capability>>,
    /// Name -> position, for O(1) lookups
    index: HashMap<String, usize>,
}

impl CapabilityPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from capabilities in declaration order
    pub fn from_capabilities(
        capabilities: impl IntoIterator<Item = Arc<dyn Capability>>,
    ) -> Result<Self, EngineError> {
        let mut pool = Self::new();
        for capability in capabilities {
            pool.register(capability)?;
        }
        Ok(pool)
    }

    /// Add a capability; duplicate names are a configuration error
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), EngineError> {
        let name = capability.name().to_string();
        if self.index.contains_key(&name) {
            return Err(EngineError::config(format!(
                "capability '{}' registered twice",
                name
            )));
        }
        self.index.insert(name, self.capabilities.len());
        self.capabilities.push(capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.index.get(name).map(|&i| &self.capabilities[i])
    }

    /// All capabilities in declaration order
    pub fn all(&self) -> &[Arc<dyn Capability>] {
        &self.capabilities
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}
