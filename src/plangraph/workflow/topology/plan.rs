// SPDX-License-Identifier: MIT

//! Plans, steps, and the host planner

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::adk::capability::Capability;
use crate::adk::error::ExternalError;

/// Kind of work a step performs. Adding a kind forces every match below to
/// handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Analyze,
    Search,
    Calculate,
    Validate,
    Transform,
    Lookup,
    FactCheck,
}

impl StepKind {
    /// Scratch key the step's result is written to
    pub fn scratch_key(&self) -> &'static str {
        match self {
            StepKind::Analyze => "analysis",
            StepKind::Search => "search_data",
            StepKind::Calculate => "calc_result",
            StepKind::Validate => "validation_passed",
            StepKind::Transform => "transform_result",
            StepKind::Lookup => "lookup_data",
            StepKind::FactCheck => "fact_check_passed",
        }
    }

    /// Scratch value for a completed step; checks record the verdict
    pub fn scratch_value(&self, content: &str, success: bool) -> Value {
        match self {
            StepKind::Validate | StepKind::FactCheck => json!(success),
            StepKind::Analyze
            | StepKind::Search
            | StepKind::Calculate
            | StepKind::Transform
            | StepKind::Lookup => json!(content),
        }
    }

    fn framing(&self) -> &'static str {
        match self {
            StepKind::Analyze => "Analyze the request and state what information is needed.",
            StepKind::Search => "Search for the information this step needs and report what you found.",
            StepKind::Calculate => "Perform the calculation and reply with the numeric result.",
            StepKind::Validate => {
                "Check the information gathered so far for accuracy and consistency."
            }
            StepKind::Transform => "Transform the data gathered so far into the required format.",
            StepKind::Lookup => "Look up additional reference context for the request.",
            StepKind::FactCheck => "Verify the claims made so far against reliable sources.",
        }
    }
}

/// A single step in the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,
    pub kind: StepKind,
    #[serde(default)]
    pub success_criteria: String,
    /// Suspend for approval before performing the step
    #[serde(default)]
    pub requires_interrupt: bool,
}

impl Step {
    pub fn new(description: impl Into<String>, kind: StepKind) -> Self {
        Self {
            description: description.into(),
            kind,
            success_criteria: String::new(),
            requires_interrupt: false,
        }
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = criteria.into();
        self
    }

    pub fn with_interrupt(mut self) -> Self {
        self.requires_interrupt = true;
        self
    }

    /// Instruction handed to the reasoner for this step
    pub fn instruction(&self, position: usize, total: usize) -> String {
        let mut text = format!(
            "Step {} of {}: {}\n{}",
            position + 1,
            total,
            self.description,
            self.kind.framing()
        );
        if !self.success_criteria.is_empty() {
            text.push_str(&format!("\nSuccess criteria: {}", self.success_criteria));
        }
        text
    }
}

/// Ordered steps; replaced wholesale by replanning, never edited in place
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Single-step plan used when planning fails or a plan is exhausted.
    ///
    /// The failed step, when known, is named so the reasoner has context.
    pub fn fallback(input: &str, failed: Option<&Step>) -> Self {
        let description = match failed {
            Some(step) => format!(
                "Step '{}' could not be completed. Answer the request directly: {}",
                step.description, input
            ),
            None => format!("Answer the request directly: {}", input),
        };
        Self::new(vec![Step::new(description, StepKind::Analyze)
            .with_criteria("The request is answered")])
    }

    /// Parse a plan from YAML (`steps: [...]`)
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}

/// Produces the initial plan for a request
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        input: &str,
        capabilities: &[Arc<dyn Capability>],
    ) -> Result<Plan, ExternalError>;
}

/// Planner that always returns the same plan
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    plan: Plan,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(
        &self,
        _input: &str,
        _capabilities: &[Arc<dyn Capability>],
    ) -> Result<Plan, ExternalError> {
        Ok(self.plan.clone())
    }
}
