// SPDX-License-Identifier: MIT

//! Supervisor topology
//!
//! ```text
//!             ┌───────────────────┐
//!             ▼                   │
//! supervisor ─┬─▶ specialist ─────┘
//!             ├─▶ terminal specialist ─▶ finish ─▶ END
//!             └─▶ finish ─▶ END
//! ```
//!
//! A `Supervisor` picks the next specialist after every specialist run.
//! Specialists are plain nodes or whole compiled graphs (`SubgraphNode`).
//! `iteration` counts supervisor decisions; once it reaches
//! `max_iterations` the run ends with a termination message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::adk::error::{EngineError, ExternalError};
use crate::adk::reasoner::{Message, Role};
use crate::adk::retry::{retry_with_backoff, RetryPolicy};
use crate::plangraph::workflow::checkpoint::{Checkpoint, CheckpointStore};
use crate::plangraph::workflow::graph::builder::DEFAULT_RECURSION_LIMIT;
use crate::plangraph::workflow::graph::{
    CompiledGraph, GraphBuilder, Node, NodeContext, NodeOutcome, Router, SubgraphNode, END,
};
use crate::plangraph::workflow::runtime::WorkflowRuntime;
use crate::plangraph::workflow::state::{
    FieldType, ReducerType, StateSchema, StateUpdate, WorkflowState,
};

/// State field names
pub mod fields {
    pub const INPUT: &str = "input";
    pub const MESSAGES: &str = "messages";
    pub const ROUTE: &str = "route";
    pub const ITERATION: &str = "iteration";
    /// Runs per specialist, keyed by name
    pub const COMPLETED: &str = "completed";
    pub const SCRATCH: &str = "scratch";
    pub const ERRORS: &str = "errors";
    pub const METRICS: &str = "metrics";
    pub const OUTPUT: &str = "output";
    pub const STAGE: &str = "stage";
}

/// Values of the `stage` field
pub mod stages {
    pub const RUNNING: &str = "running";
    pub const COMPLETE: &str = "complete";
    pub const ITERATION_LIMIT: &str = "iteration_limit";
}

pub const SUPERVISOR: &str = "supervisor";
/// Route label and node name that ends the run
pub const FINISH: &str = "finish";
/// `scratch` key carrying the supervisor's instructions for the next specialist
pub const SPECIALIST_TASK_KEY: &str = "specialist_task";
/// `metrics` key holding the most recent route
pub const LAST_ROUTE_KEY: &str = "supervisor_last_route";

pub const ITERATION_LIMIT_ERROR: &str = "Maximum iterations reached";
pub const ITERATION_LIMIT_MESSAGE: &str = "Maximum iterations reached. The workflow has been \
     terminated. Please restart with a clearer or simpler request.";
const NO_ANSWER: &str = "No specialist produced an answer.";
const SUPERVISOR_PREFIX: &str = "[Supervisor]";

/// Limits for a supervisor runtime. Every field is optional in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Supervisor decisions allowed per thread
    pub max_iterations: u64,
    pub recursion_limit: u32,
    pub retry: RetryPolicy,
    pub supervisor_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            retry: RetryPolicy::default(),
            supervisor_timeout_secs: 60,
        }
    }
}

impl SupervisorConfig {
    pub fn supervisor_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_iterations == 0 {
            return Err(EngineError::config("max_iterations must be at least 1"));
        }
        if self.recursion_limit == 0 {
            return Err(EngineError::config("recursion_limit must be at least 1"));
        }
        if self.supervisor_timeout_secs == 0 {
            return Err(EngineError::config("supervisor_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// One supervisor decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    /// Specialist name, or `FINISH`
    pub next: String,
    /// Recorded in the audit log as `[Supervisor] <summary>`
    #[serde(default)]
    pub summary: String,
    /// Instructions for the chosen specialist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
}

impl Routing {
    pub fn to(next: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            next: next.into(),
            summary: summary.into(),
            task: None,
        }
    }

    pub fn finish(summary: impl Into<String>) -> Self {
        Self::to(FINISH, summary)
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }
}

/// Picks the specialist that works next
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// `specialists` are in registration order; `FINISH` ends the run
    async fn route(
        &self,
        state: &WorkflowState,
        specialists: &[String],
    ) -> Result<Routing, ExternalError>;
}

/// Base schema of the supervisor topology; extend it with
/// `SupervisorTopology::with_field`
pub fn supervisor_schema() -> StateSchema {
    use FieldType::*;
    use ReducerType::*;

    StateSchema::default()
        .field(fields::INPUT, String, Overwrite, None)
        .field(fields::MESSAGES, Array, Append, Some(json!([])))
        .field(fields::ROUTE, String, Overwrite, None)
        .field(fields::ITERATION, Number, Sum, Some(json!(0)))
        .field(fields::COMPLETED, Object, Merge, Some(json!({})))
        .field(fields::SCRATCH, Object, Merge, Some(json!({})))
        .field(fields::ERRORS, Array, Append, Some(json!([])))
        .field(fields::METRICS, Object, Merge, Some(json!({})))
        .field(fields::OUTPUT, String, Overwrite, None)
        .field(fields::STAGE, String, Overwrite, Some(json!(stages::RUNNING)))
}

/// Initial input for `WorkflowRuntime::start`
pub fn supervisor_input(input: &str) -> StateUpdate {
    StateUpdate::new()
        .with(fields::INPUT, json!(input))
        .with(fields::MESSAGES, json!([Message::user(input)]))
}

struct SupervisorNode {
    supervisor: Arc<dyn Supervisor>,
    specialists: Vec<String>,
    config: SupervisorConfig,
}

impl SupervisorNode {
    fn iteration_limit(&self) -> StateUpdate {
        log::warn!(
            "Supervisor reached {} iterations; terminating",
            self.config.max_iterations
        );
        StateUpdate::new()
            .with(fields::ROUTE, json!(FINISH))
            .with(fields::STAGE, json!(stages::ITERATION_LIMIT))
            .with(fields::ERRORS, json!([ITERATION_LIMIT_ERROR]))
            .with(fields::OUTPUT, json!(ITERATION_LIMIT_MESSAGE))
            .with(
                fields::MESSAGES,
                json!([Message::assistant(ITERATION_LIMIT_MESSAGE)]),
            )
            .with(fields::METRICS, json!({ LAST_ROUTE_KEY: FINISH }))
    }
}

#[async_trait]
impl Node for SupervisorNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let iteration = state.get_u64(fields::ITERATION);
        if iteration >= self.config.max_iterations {
            return Ok(self.iteration_limit().into());
        }

        let mut errors = Vec::new();
        let routing = match retry_with_backoff(
            &self.config.retry,
            "supervisor",
            self.config.supervisor_timeout(),
            || self.supervisor.route(state, &self.specialists),
        )
        .await
        {
            Ok(routing) if routing.next == FINISH || self.specialists.contains(&routing.next) => {
                routing
            }
            Ok(routing) => {
                log::warn!("Supervisor chose unknown specialist '{}'", routing.next);
                errors.push(format!("Supervisor chose unknown specialist '{}'", routing.next));
                Routing::finish(routing.summary)
            }
            Err(e) => {
                log::error!("Supervisor failed: {}", e);
                errors.push(format!("Supervisor failed: {}", e));
                Routing::finish("")
            }
        };

        log::info!("Supervisor decision {}: {}", iteration + 1, routing.next);
        let mut update = StateUpdate::new()
            .with(fields::ROUTE, json!(routing.next))
            .with(fields::ITERATION, json!(1))
            .with(fields::SCRATCH, json!({ SPECIALIST_TASK_KEY: routing.task }))
            .with(fields::METRICS, json!({ LAST_ROUTE_KEY: routing.next }));
        if !routing.summary.is_empty() {
            let note = format!("{} {}", SUPERVISOR_PREFIX, routing.summary);
            update = update.with(fields::MESSAGES, json!([Message::assistant(note)]));
        }
        if !errors.is_empty() {
            update = update.with(fields::ERRORS, json!(errors));
        }
        Ok(update.into())
    }
}

/// Follows the `route` written by the supervisor
struct SupervisorRouter {
    labels: Vec<String>,
}

impl Router for SupervisorRouter {
    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn route(&self, state: &WorkflowState) -> String {
        match state.get_str(fields::ROUTE) {
            Some(route) if self.labels.iter().any(|l| l == route) => route.to_string(),
            _ => FINISH.to_string(),
        }
    }
}

/// Counts runs of the wrapped specialist in `completed`
struct SpecialistNode {
    name: String,
    inner: Arc<dyn Node>,
}

impl SpecialistNode {
    fn completion(&self, state: &WorkflowState) -> StateUpdate {
        let runs = state
            .get(fields::COMPLETED)
            .and_then(|c| c.get(&self.name))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        StateUpdate::new().with(fields::COMPLETED, json!({ self.name.clone(): runs + 1 }))
    }
}

#[async_trait]
impl Node for SpecialistNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        match self.inner.run(state, ctx).await? {
            NodeOutcome::Update(update) => {
                Ok(NodeOutcome::Update(update.merge(self.completion(state))))
            }
            // Counted once the host resumes
            suspended => Ok(suspended),
        }
    }

    fn on_resume(
        &self,
        state: &WorkflowState,
        patch: &StateUpdate,
    ) -> Result<StateUpdate, EngineError> {
        Ok(self
            .inner
            .on_resume(state, patch)?
            .merge(self.completion(state)))
    }

    fn on_branch(
        &self,
        state: &WorkflowState,
        elsewhere: &[Checkpoint],
    ) -> Result<(), EngineError> {
        self.inner.on_branch(state, elsewhere)
    }
}

/// Records the final answer
struct FinishNode;

fn last_specialist_answer(state: &WorkflowState) -> Result<Option<String>, EngineError> {
    let messages = state
        .get_as::<Vec<Message>>(fields::MESSAGES)?
        .unwrap_or_default();
    Ok(messages
        .into_iter()
        .rev()
        .find(|m| m.role == Role::Assistant && !m.content.starts_with(SUPERVISOR_PREFIX))
        .map(|m| m.content))
}

#[async_trait]
impl Node for FinishNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let mut update = StateUpdate::new();
        if state.get_str(fields::OUTPUT).is_none() {
            let output = last_specialist_answer(state)?.unwrap_or_else(|| NO_ANSWER.to_string());
            update = update.with(fields::OUTPUT, json!(output));
        }
        if state.get_str(fields::STAGE) != Some(stages::ITERATION_LIMIT) {
            update = update.with(fields::STAGE, json!(stages::COMPLETE));
        }
        Ok(update.into())
    }
}

/// Supervisor, specialists, and limits for a supervisor graph
pub struct SupervisorTopology {
    supervisor: Arc<dyn Supervisor>,
    specialists: Vec<(String, Arc<dyn Node>, bool)>,
    schema: StateSchema,
    config: SupervisorConfig,
}

impl SupervisorTopology {
    pub fn new(supervisor: Arc<dyn Supervisor>) -> Self {
        Self {
            supervisor,
            specialists: Vec::new(),
            schema: supervisor_schema(),
            config: SupervisorConfig::default(),
        }
    }

    /// Specialist that hands control back to the supervisor
    pub fn add_specialist(mut self, name: &str, node: Arc<dyn Node>) -> Self {
        self.specialists.push((name.to_string(), node, false));
        self
    }

    /// Specialist whose run ends the thread
    pub fn add_terminal_specialist(mut self, name: &str, node: Arc<dyn Node>) -> Self {
        self.specialists.push((name.to_string(), node, true));
        self
    }

    /// Specialist backed by a compiled graph over this topology's schema
    pub fn add_subgraph(self, name: &str, graph: Arc<CompiledGraph>) -> Self {
        self.add_specialist(name, Arc::new(SubgraphNode::new(graph)))
    }

    /// Declare an extra state field for the specialists
    pub fn with_field(
        mut self,
        name: &str,
        field_type: FieldType,
        reducer: ReducerType,
        default: Option<Value>,
    ) -> Self {
        self.schema = self.schema.field(name, field_type, reducer, default);
        self
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_iterations(mut self, max: u64) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn schema(&self) -> Arc<StateSchema> {
        Arc::new(self.schema.clone())
    }

    pub fn compile(&self) -> Result<CompiledGraph, EngineError> {
        self.config.validate()?;
        if self.specialists.is_empty() {
            return Err(EngineError::config("supervisor needs at least one specialist"));
        }

        let mut seen = HashSet::new();
        for (name, _, _) in &self.specialists {
            if name == SUPERVISOR || name == FINISH || name == END {
                return Err(EngineError::config(format!(
                    "'{}' is reserved and cannot name a specialist",
                    name
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(EngineError::config(format!("Duplicate specialist '{}'", name)));
            }
        }

        let names: Vec<String> = self.specialists.iter().map(|(n, _, _)| n.clone()).collect();
        let mut labels = names.clone();
        labels.push(FINISH.to_string());
        let router = Arc::new(SupervisorRouter {
            labels: labels.clone(),
        });
        let branches: Vec<(&str, &str)> = labels.iter().map(|l| (l.as_str(), l.as_str())).collect();

        let supervisor = SupervisorNode {
            supervisor: self.supervisor.clone(),
            specialists: names,
            config: self.config.clone(),
        };

        let mut builder = GraphBuilder::new()
            .add_node(SUPERVISOR, Arc::new(supervisor))
            .add_node(FINISH, Arc::new(FinishNode))
            .set_entry(SUPERVISOR)
            .add_conditional_edges(SUPERVISOR, router, &branches)
            .add_edge(FINISH, END)
            .recursion_limit(self.config.recursion_limit);
        for (name, node, terminal) in &self.specialists {
            let wrapped = SpecialistNode {
                name: name.clone(),
                inner: node.clone(),
            };
            let target = if *terminal { FINISH } else { SUPERVISOR };
            builder = builder
                .add_node(name, Arc::new(wrapped))
                .add_edge(name, target);
        }
        builder.compile()
    }

    /// Compile and wrap in a runtime backed by an in-memory checkpoint store
    pub fn into_runtime(self) -> Result<WorkflowRuntime, EngineError> {
        let graph = self.compile()?;
        Ok(WorkflowRuntime::new(Arc::new(graph), self.schema()))
    }

    /// Compile and wrap in a runtime backed by `store`
    pub fn into_runtime_with_store(
        self,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<WorkflowRuntime, EngineError> {
        let graph = self.compile()?;
        Ok(WorkflowRuntime::with_store(
            Arc::new(graph),
            self.schema(),
            store,
        ))
    }
}
