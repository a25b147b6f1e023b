// SPDX-License-Identifier: MIT

//! Nodes of the plan-execute topology
//!
//! Each node reads the state and returns a partial update. Step failures are
//! recorded in `step_success` and `errors`; only misconfiguration and broken
//! state surface as `EngineError`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::adk::capability::{CapabilityCall, CapabilityPool};
use crate::adk::error::EngineError;
use crate::adk::reasoner::{Message, Reasoner, Role};
use crate::adk::retry::{retry_with_backoff, RetryPolicy};
use crate::plangraph::workflow::checkpoint::Checkpoint;
use crate::plangraph::workflow::graph::{Node, NodeContext, NodeOutcome};
use crate::plangraph::workflow::ranker::CapabilityRanker;
use crate::plangraph::workflow::state::{StateUpdate, WorkflowState};

use super::approval::{
    self, ApprovalKind, ApprovalRequest, ApprovalStatus, APPROVAL_ID_KEY, APPROVED_KEY,
    APPROVED_STEP_KEY,
};
use super::budget::now_ms;
use super::config::EngineConfig;
use super::plan::{Plan, Planner, Step, StepKind};
use super::{fields, names, stages};

/// Collaborators shared by the nodes of one compiled graph
pub struct Shared {
    pub planner: Arc<dyn Planner>,
    pub reasoner: Arc<dyn Reasoner>,
    pub capabilities: Arc<CapabilityPool>,
    pub ranker: CapabilityRanker,
    pub config: EngineConfig,
}

fn messages(state: &WorkflowState) -> Result<Vec<Message>, EngineError> {
    Ok(state
        .get_as::<Vec<Message>>(fields::MESSAGES)?
        .unwrap_or_default())
}

fn current_plan(state: &WorkflowState, node: &str) -> Result<Plan, EngineError> {
    state
        .get_as::<Plan>(fields::PLAN)?
        .ok_or_else(|| EngineError::node(node, "no plan has been installed"))
}

fn pending_calls(state: &WorkflowState) -> Result<Vec<CapabilityCall>, EngineError> {
    Ok(state
        .get_as::<Vec<CapabilityCall>>(fields::PENDING_CALLS)?
        .unwrap_or_default())
}

fn input(state: &WorkflowState) -> String {
    state.get_str(fields::INPUT).unwrap_or_default().to_string()
}

fn append(messages: Vec<Message>) -> StateUpdate {
    StateUpdate::new().with(fields::MESSAGES, json!(messages))
}

/// `step_success = false` plus an `errors` entry naming the step
fn step_failure(step_idx: u64, step: Option<&Step>, reason: &str) -> StateUpdate {
    let label = match step {
        Some(step) => format!("Step {} ({})", step_idx + 1, step.description),
        None => format!("Step {}", step_idx + 1),
    };
    log::warn!("{} failed: {}", label, reason);
    StateUpdate::new()
        .with(fields::STEP_SUCCESS, json!(false))
        .with(fields::ERRORS, json!([format!("{}: {}", label, reason)]))
}

fn failure_for_current_step(state: &WorkflowState, reason: &str) -> StateUpdate {
    let step_idx = state.get_u64(fields::STEP_IDX);
    let plan = state.get_as::<Plan>(fields::PLAN).ok().flatten();
    let step = plan
        .as_ref()
        .and_then(|p| p.steps.get(step_idx as usize));
    step_failure(step_idx, step, reason)
}

/// Clears the approval bookkeeping of the step that is being left
fn clear_step_approval() -> StateUpdate {
    StateUpdate::new()
        .with(
            fields::SCRATCH,
            json!({ APPROVED_STEP_KEY: null, APPROVED_KEY: null, APPROVAL_ID_KEY: null }),
        )
        .with(fields::APPROVAL_REQUEST, Value::Null)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Asks the host planner for a plan, falling back to a single-step plan
pub struct PlannerNode {
    shared: Arc<Shared>,
}

impl PlannerNode {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Node for PlannerNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let input = input(state);
        let config = &self.shared.config;
        let capabilities = self.shared.capabilities.all();

        let result = retry_with_backoff(
            &config.retry,
            "planner",
            config.reasoner_timeout(),
            || self.shared.planner.plan(&input, capabilities),
        )
        .await;

        let mut update = StateUpdate::new();
        let plan = match result {
            Ok(plan) if !plan.is_empty() => plan,
            Ok(_) => {
                log::warn!("Planner returned an empty plan, using fallback");
                update = update.with(fields::ERRORS, json!(["Planner returned an empty plan"]));
                Plan::fallback(&input, None)
            }
            Err(e) => {
                log::error!("Planning failed: {}", e);
                update = update.with(fields::ERRORS, json!([format!("Planning failed: {}", e)]));
                Plan::fallback(&input, None)
            }
        };
        log::info!("Plan has {} step(s)", plan.len());

        let listing = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step.description))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(update
            .with(fields::STARTED_AT, json!(now_ms()))
            .with(fields::STAGE, json!(stages::RUNNING))
            .with(fields::PLAN, json!(plan))
            .with(fields::STEP_IDX, json!(0))
            .replace(fields::RETRIES, json!(0))
            .with(fields::STEP_SUCCESS, Value::Null)
            .merge(append(vec![
                Message::user(&input),
                Message::assistant(format!("Plan:\n{}", listing)),
            ]))
            .into())
    }
}

/// Performs the current step through the reasoner
pub struct ExecutorNode {
    shared: Arc<Shared>,
}

impl ExecutorNode {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Node for ExecutorNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let plan = current_plan(state, &ctx.node)?;
        let step_idx = state.get_u64(fields::STEP_IDX);
        let step = plan.steps.get(step_idx as usize).ok_or_else(|| {
            EngineError::node(
                &ctx.node,
                format!("step {} is outside a plan of {} step(s)", step_idx, plan.len()),
            )
        })?;

        if step.requires_interrupt && !approval::step_approved(state, step_idx) {
            log::info!("Step {} requires approval", step_idx + 1);
            let request = ApprovalRequest::for_step(step_idx, step);
            return Ok(request
                .open()
                .with(fields::STEP_SUCCESS, Value::Null)
                .into());
        }

        let config = &self.shared.config;
        let ranking = self
            .shared
            .ranker
            .rank(&step.description, self.shared.capabilities.all(), config.top_k)
            .await;
        log::debug!(
            "Capabilities for step {} ({:?}): {:?}",
            step_idx + 1,
            ranking.method,
            ranking.names()
        );

        let mut context = vec![Message::system(
            step.instruction(step_idx as usize, plan.len()),
        )];
        context.extend(messages(state)?);

        let result = retry_with_backoff(
            &config.retry,
            "reasoner",
            config.reasoner_timeout(),
            || self.shared.reasoner.decide(&context, &ranking.selected),
        )
        .await;

        let counted = StateUpdate::new().with(fields::REASONER_CALLS, json!(1));
        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                log::error!("Reasoner failed on step {}: {}", step_idx + 1, e);
                return Ok(counted
                    .merge(step_failure(step_idx, Some(step), &e.to_string()))
                    .into());
            }
        };

        if decision.capability_calls.is_empty() {
            let mut update = counted
                .merge(append(vec![Message::assistant(&decision.content)]))
                .with(fields::STEP_SUCCESS, json!(decision.success))
                .with(
                    fields::SCRATCH,
                    json!({
                        step.kind.scratch_key():
                            step.kind.scratch_value(&decision.content, decision.success)
                    }),
                );
            if !decision.success {
                update = update.merge(step_failure(step_idx, Some(step), &decision.content));
            }
            return Ok(update.into());
        }

        let calls: Vec<CapabilityCall> = decision
            .capability_calls
            .into_iter()
            .map(|mut call| {
                if call.id.is_empty() {
                    call.id = Uuid::new_v4().to_string();
                }
                call
            })
            .collect();

        let selected = ranking.names();
        if let Some(call) = calls.iter().find(|c| !selected.contains(&c.name.as_str())) {
            let reason = format!(
                "requested capability '{}' which is not available for this step",
                call.name
            );
            return Ok(counted
                .merge(append(vec![Message::assistant(&decision.content)]))
                .merge(step_failure(step_idx, Some(step), &reason))
                .into());
        }

        let side_effecting = calls.iter().any(|call| {
            self.shared
                .capabilities
                .get(&call.name)
                .is_some_and(|c| c.side_effecting())
        });
        log::info!(
            "Step {} requested {} capability call(s)",
            step_idx + 1,
            calls.len()
        );

        let mut update = counted
            .merge(append(vec![Message::assistant_with_calls(
                &decision.content,
                calls.clone(),
            )]))
            .with(fields::PENDING_CALLS, json!(calls))
            .with(fields::STEP_SUCCESS, Value::Null);
        if side_effecting {
            update = update.merge(ApprovalRequest::for_calls(calls).open());
        }
        Ok(update.into())
    }
}

/// Invokes the pending capability calls
pub struct ActNode {
    shared: Arc<Shared>,
}

impl ActNode {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Whether the open request approves exactly `calls`
    fn authorized(state: &WorkflowState, calls: &[CapabilityCall]) -> Result<Option<String>, EngineError> {
        let Some(request) = approval::current_request(state)? else {
            return Ok(None);
        };
        match (&request.kind, approval::status_of(state, &request.id)) {
            (ApprovalKind::Calls { calls: approved }, Some(ApprovalStatus::Approved))
                if approved.as_slice() == calls =>
            {
                Ok(Some(request.id))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Node for ActNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let calls = pending_calls(state)?;
        let pool = &self.shared.capabilities;
        let config = &self.shared.config;

        let side_effecting = calls
            .iter()
            .any(|call| pool.get(&call.name).is_some_and(|c| c.side_effecting()));

        let mut update = StateUpdate::new().with(fields::PENDING_CALLS, json!([]));
        if side_effecting {
            match Self::authorized(state, &calls)? {
                Some(request_id) => {
                    update = update
                        .with(
                            fields::APPROVALS,
                            json!({ request_id: ApprovalStatus::Executed.as_str() }),
                        )
                        .with(fields::APPROVAL_REQUEST, Value::Null);
                }
                None => {
                    log::warn!("Refusing side-effecting calls without a matching approval");
                    let refusals = calls
                        .iter()
                        .map(|call| {
                            Message::capability(
                                &call.id,
                                format!("Refused: {} requires an approval that was not granted", call.name),
                            )
                        })
                        .collect();
                    return Ok(update
                        .merge(append(refusals))
                        .merge(failure_for_current_step(
                            state,
                            "side-effecting capability calls were not approved",
                        ))
                        .into());
                }
            }
        }

        let mut answers = Vec::with_capacity(calls.len());
        let mut invoked = 0u64;
        let mut failed: Option<String> = None;

        for call in &calls {
            if failed.is_some() {
                answers.push(Message::capability(
                    &call.id,
                    "Skipped: an earlier call in this batch failed",
                ));
                continue;
            }

            let Some(capability) = pool.get(&call.name) else {
                let reason = format!("unknown capability '{}'", call.name);
                answers.push(Message::capability(&call.id, format!("Error: {}", reason)));
                failed = Some(reason);
                continue;
            };

            // Side effects are never repeated on a transient failure
            let policy = if capability.side_effecting() {
                RetryPolicy::none()
            } else {
                config.retry.clone()
            };
            let operation = format!("capability {}", call.name);

            log::info!("Invoking capability {}", call.name);
            invoked += 1;
            let result = retry_with_backoff(
                &policy,
                &operation,
                config.capability_timeout(),
                || capability.invoke(call.args.clone()),
            )
            .await;

            match result {
                Ok(value) => answers.push(Message::capability(&call.id, render(&value))),
                Err(e) => {
                    log::error!("Capability {} failed: {}", call.name, e);
                    answers.push(Message::capability(&call.id, format!("Error: {}", e)));
                    failed = Some(format!("{} failed: {}", call.name, e));
                }
            }
        }

        update = update
            .merge(append(answers))
            .with(fields::CAPABILITY_CALLS, json!(invoked));
        match failed {
            Some(reason) => update = update.merge(failure_for_current_step(state, &reason)),
            None => update = update.with(fields::STEP_SUCCESS, Value::Null),
        }
        Ok(update.into())
    }
}

/// Suspends until the host answers the open approval request
pub struct ApprovalNode;

#[async_trait]
impl Node for ApprovalNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let request = approval::current_request(state)?
            .ok_or_else(|| EngineError::node(&ctx.node, "no approval request is open"))?;
        log::info!("Suspending for approval request {}", request.id);

        Ok(NodeOutcome::Suspend {
            update: append(vec![Message::assistant(format!(
                "Awaiting approval: {}",
                request.summary
            ))]),
            reason: request.summary,
        })
    }

    fn on_resume(
        &self,
        state: &WorkflowState,
        patch: &StateUpdate,
    ) -> Result<StateUpdate, EngineError> {
        approval::resolve(state, patch)
    }

    fn on_branch(
        &self,
        state: &WorkflowState,
        elsewhere: &[Checkpoint],
    ) -> Result<(), EngineError> {
        approval::check_other_branches(state, elsewhere)
    }
}

/// Records a denied request and continues without performing it
pub struct CancelNode;

#[async_trait]
impl Node for CancelNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let request = approval::current_request(state)?;
        let calls = pending_calls(state)?;

        let mut out: Vec<Message> = calls
            .iter()
            .map(|call| {
                Message::capability(&call.id, format!("Denied: {} was not approved", call.name))
            })
            .collect();

        let update = StateUpdate::new()
            .with(fields::PENDING_CALLS, json!([]))
            .with(fields::PENDING_APPROVAL, json!(false))
            .with(fields::APPROVAL_REQUEST, Value::Null);

        let update = match request.map(|r| r.kind) {
            Some(ApprovalKind::Step { step_idx }) => {
                let description = state
                    .get_as::<Plan>(fields::PLAN)?
                    .and_then(|plan| plan.steps.get(step_idx as usize).cloned())
                    .map(|step| step.description)
                    .unwrap_or_default();
                log::info!("Step {} denied, skipping it", step_idx + 1);
                out.push(Message::assistant(format!(
                    "Approval denied: step {} was not performed ({}).",
                    step_idx + 1,
                    description
                )));
                update.with(fields::STEP_SUCCESS, json!(true))
            }
            Some(ApprovalKind::Calls { .. }) | None => {
                log::info!("Capability calls denied");
                out.push(Message::assistant(
                    "The requested action was not approved and was not performed.",
                ));
                update.with(fields::STEP_SUCCESS, Value::Null)
            }
        };
        Ok(update.merge(append(out)).into())
    }
}

/// Moves to the next step
pub struct AdvanceNode;

#[async_trait]
impl Node for AdvanceNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let next = state.get_u64(fields::STEP_IDX) + 1;
        log::info!("Advancing to step {}", next + 1);
        Ok(StateUpdate::new()
            .with(fields::STEP_IDX, json!(next))
            .replace(fields::RETRIES, json!(0))
            .with(fields::STEP_SUCCESS, Value::Null)
            .with(fields::ROUTE, json!(names::ADVANCE))
            .merge(clear_step_approval())
            .into())
    }
}

/// Tries the current step again
pub struct RetryNode;

#[async_trait]
impl Node for RetryNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        log::info!(
            "Retrying step {} (attempt {})",
            state.get_u64(fields::STEP_IDX) + 1,
            state.get_u64(fields::RETRIES) + 2
        );
        Ok(StateUpdate::new()
            .with(fields::RETRIES, json!(1))
            .with(fields::STEP_SUCCESS, Value::Null)
            .with(fields::ROUTE, json!(names::RETRY))
            .into())
    }
}

/// Replaces the plan with a single fallback step
pub struct ReplanNode;

#[async_trait]
impl Node for ReplanNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let plan = current_plan(state, &ctx.node)?;
        let step_idx = state.get_u64(fields::STEP_IDX);
        let failed = plan.steps.get(step_idx as usize);
        let fallback = Plan::fallback(&input(state), failed);

        let note = match failed {
            Some(step) => format!(
                "Step {} ({}) kept failing; replanning.",
                step_idx + 1,
                step.description
            ),
            None => "Replanning.".to_string(),
        };
        log::info!("{}", note);

        Ok(StateUpdate::new()
            .with(fields::PLAN, json!(fallback))
            .with(fields::STEP_IDX, json!(0))
            .replace(fields::RETRIES, json!(0))
            .with(fields::REPLANS, json!(1))
            .with(fields::STEP_SUCCESS, Value::Null)
            .with(fields::PENDING_CALLS, json!([]))
            .with(fields::ROUTE, json!(names::REPLAN))
            .merge(clear_step_approval())
            .merge(append(vec![Message::assistant(note)]))
            .into())
    }
}

/// Composes the final answer
pub struct FinalizeNode;

impl FinalizeNode {
    fn answer(state: &WorkflowState) -> Result<String, EngineError> {
        let plan = state.get_as::<Plan>(fields::PLAN)?.unwrap_or_default();
        let calculated = plan.steps.iter().any(|s| s.kind == StepKind::Calculate);
        let calc_path = format!("{}.{}", fields::SCRATCH, StepKind::Calculate.scratch_key());
        if let Some(result) = state.get_path(&calc_path).filter(|v| !v.is_null()) {
            if calculated {
                return Ok(format!("The result is {}.", render(result)));
            }
        }

        let last = messages(state)?.into_iter().rev().find(|m| {
            m.role == Role::Assistant && m.capability_calls.is_empty() && !m.content.is_empty()
        });
        Ok(match last {
            Some(message) => message.content,
            None => "Could you clarify what you'd like to do?".to_string(),
        })
    }
}

#[async_trait]
impl Node for FinalizeNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let answer = Self::answer(state)?;
        log::info!("Workflow complete");
        Ok(StateUpdate::new()
            .with(fields::STAGE, json!(stages::COMPLETE))
            .with(fields::ROUTE, json!(names::FINALIZE))
            .merge(append(vec![Message::assistant(answer)]))
            .into())
    }
}

/// Gives up after replanning is exhausted
pub struct AbortNode;

#[async_trait]
impl Node for AbortNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let errors = state
            .get_as::<Vec<String>>(fields::ERRORS)?
            .unwrap_or_default();
        let replans = state.get_u64(fields::REPLANS);
        let mut text = format!(
            "I could not complete the request after {} replan(s). Errors:",
            replans
        );
        for error in &errors {
            text.push_str(&format!("\n- {}", error));
        }
        log::error!("Workflow aborted with {} error(s)", errors.len());

        Ok(StateUpdate::new()
            .with(fields::STAGE, json!(stages::FAILED))
            .with(fields::ROUTE, json!(names::ABORT))
            .merge(append(vec![Message::assistant(text)]))
            .into())
    }
}

/// Stops the thread once a budget is exhausted
pub struct BudgetExitNode {
    shared: Arc<Shared>,
}

impl BudgetExitNode {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Node for BudgetExitNode {
    async fn run(
        &self,
        state: &WorkflowState,
        _ctx: &NodeContext,
    ) -> Result<NodeOutcome, EngineError> {
        let reason = self
            .shared
            .config
            .budget
            .first_exceeded(state, now_ms())
            .map(|exceeded| exceeded.to_string())
            .unwrap_or_else(|| "run budget exhausted".to_string());
        log::warn!("Stopping early: {}", reason);

        let mut out: Vec<Message> = pending_calls(state)?
            .iter()
            .map(|call| Message::capability(&call.id, format!("Cancelled: {}", reason)))
            .collect();
        out.push(Message::assistant(format!("Stopping early: {}.", reason)));

        Ok(StateUpdate::new()
            .with(fields::PENDING_CALLS, json!([]))
            .with(fields::PENDING_APPROVAL, json!(false))
            .with(fields::STAGE, json!(stages::BUDGET_EXCEEDED))
            .with(fields::ROUTE, json!(names::BUDGET_EXIT))
            .merge(append(out))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adk::capability::Capability;
    use crate::adk::error::ExternalError;
    use crate::adk::reasoner::Decision;
    use crate::plangraph::workflow::topology::approval::ApprovalDecision;
    use crate::plangraph::workflow::topology::plan::StaticPlanner;
    use crate::plangraph::workflow::topology::plan_execute_schema;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockCapability {
        name: String,
        side_effecting: bool,
        invocations: AtomicUsize,
        fail: bool,
    }

    impl MockCapability {
        fn new(name: &str, side_effecting: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                side_effecting,
                invocations: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                side_effecting: false,
                invocations: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Capability for MockCapability {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "mock capability"
        }

        fn side_effecting(&self) -> bool {
            self.side_effecting
        }

        async fn invoke(&self, _args: Value) -> Result<Value, ExternalError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExternalError::rejected(&self.name, "bad arguments"))
            } else {
                Ok(json!(format!("{} ok", self.name)))
            }
        }
    }

    /// Replies with queued decisions, then with a plain answer
    struct ScriptedReasoner {
        script: Mutex<Vec<Decision>>,
    }

    impl ScriptedReasoner {
        fn new(mut decisions: Vec<Decision>) -> Self {
            decisions.reverse();
            Self {
                script: Mutex::new(decisions),
            }
        }
    }

    #[async_trait]
    impl Reasoner for ScriptedReasoner {
        async fn decide(
            &self,
            _context: &[Message],
            _available: &[Arc<dyn Capability>],
        ) -> Result<Decision, ExternalError> {
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Decision::answer("answer")))
        }
    }

    fn shared(reasoner: ScriptedReasoner, capabilities: Vec<Arc<dyn Capability>>) -> Arc<Shared> {
        Arc::new(Shared {
            planner: Arc::new(StaticPlanner::new(Plan::default())),
            reasoner: Arc::new(reasoner),
            capabilities: Arc::new(CapabilityPool::from_capabilities(capabilities).unwrap()),
            ranker: CapabilityRanker::lexical(),
            config: EngineConfig::default(),
        })
    }

    fn ctx(node: &str) -> NodeContext {
        NodeContext {
            thread_id: "t".to_string(),
            node: node.to_string(),
            execution: 1,
        }
    }

    fn state_with_plan(steps: Vec<Step>) -> WorkflowState {
        WorkflowState::from_schema(plan_execute_schema())
            .apply(
                &StateUpdate::new()
                    .with(fields::INPUT, json!("what is 2 + 2"))
                    .with(fields::PLAN, json!(Plan::new(steps))),
            )
            .unwrap()
    }

    async fn run(node: &dyn Node, state: &WorkflowState, name: &str) -> WorkflowState {
        let outcome = node.run(state, &ctx(name)).await.unwrap();
        state.apply(outcome.update()).unwrap()
    }

    #[tokio::test]
    async fn test_planner_falls_back_on_empty_plan() {
        let node = PlannerNode::new(shared(ScriptedReasoner::new(vec![]), vec![]));
        let state = run(&node, &state_with_plan(vec![]), names::PLANNER).await;

        let plan: Plan = state.get_as(fields::PLAN).unwrap().unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(state.get_u64(fields::STEP_IDX), 0);
        assert_eq!(state.get_str(fields::STAGE), Some(stages::RUNNING));
        assert!(state.get(fields::STARTED_AT).is_some());
        assert_eq!(state.get_as::<Vec<String>>(fields::ERRORS).unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_executor_completes_step_into_scratch() {
        let node = ExecutorNode::new(shared(
            ScriptedReasoner::new(vec![Decision::answer("4")]),
            vec![],
        ));
        let state = state_with_plan(vec![Step::new("Add", StepKind::Calculate)]);
        let state = run(&node, &state, names::EXECUTOR).await;

        assert_eq!(state.get_bool(fields::STEP_SUCCESS), Some(true));
        assert_eq!(state.get_path("scratch.calc_result"), Some(&json!("4")));
        assert_eq!(state.get_u64(fields::REASONER_CALLS), 1);
    }

    #[tokio::test]
    async fn test_executor_records_failure() {
        let node = ExecutorNode::new(shared(
            ScriptedReasoner::new(vec![Decision::failed("no data")]),
            vec![],
        ));
        let state = state_with_plan(vec![Step::new("Search", StepKind::Search)]);
        let state = run(&node, &state, names::EXECUTOR).await;

        assert_eq!(state.get_bool(fields::STEP_SUCCESS), Some(false));
        let errors: Vec<String> = state.get_as(fields::ERRORS).unwrap().unwrap();
        assert_eq!(errors, vec!["Step 1 (Search): no data".to_string()]);
    }

    #[tokio::test]
    async fn test_executor_opens_step_approval() {
        let node = ExecutorNode::new(shared(ScriptedReasoner::new(vec![]), vec![]));
        let state = state_with_plan(vec![Step::new("Send", StepKind::Transform).with_interrupt()]);
        let state = run(&node, &state, names::EXECUTOR).await;

        assert_eq!(state.get_bool(fields::PENDING_APPROVAL), Some(true));
        assert_eq!(state.get_u64(fields::REASONER_CALLS), 0);
    }

    #[tokio::test]
    async fn test_executor_rejects_unknown_capability() {
        let call = CapabilityCall::new("c1", "teleport", json!({}));
        let node = ExecutorNode::new(shared(
            ScriptedReasoner::new(vec![Decision::call("", vec![call])]),
            vec![MockCapability::new("search", false)],
        ));
        let state = state_with_plan(vec![Step::new("Search", StepKind::Search)]);
        let state = run(&node, &state, names::EXECUTOR).await;

        assert_eq!(state.get_bool(fields::STEP_SUCCESS), Some(false));
        assert_eq!(state.get(fields::PENDING_CALLS), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_side_effecting_call_opens_approval() {
        let call = CapabilityCall::new("", "send_email", json!({"to": "a@b.c"}));
        let node = ExecutorNode::new(shared(
            ScriptedReasoner::new(vec![Decision::call("sending", vec![call])]),
            vec![MockCapability::new("send_email", true)],
        ));
        let state = state_with_plan(vec![Step::new("Send email", StepKind::Transform)]);
        let state = run(&node, &state, names::EXECUTOR).await;

        let calls = pending_calls(&state).unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].id.is_empty());
        assert_eq!(state.get_bool(fields::PENDING_APPROVAL), Some(true));
        assert!(state.get(fields::STEP_SUCCESS).unwrap().is_null());
    }

    #[tokio::test]
    async fn test_act_refuses_unapproved_side_effects() {
        let email = MockCapability::new("send_email", true);
        let node = ActNode::new(shared(ScriptedReasoner::new(vec![]), vec![email.clone()]));
        let call = CapabilityCall::new("c1", "send_email", json!({}));
        let state = state_with_plan(vec![Step::new("Send", StepKind::Transform)])
            .apply(&StateUpdate::new().with(fields::PENDING_CALLS, json!([call])))
            .unwrap();

        let state = run(&node, &state, names::ACT).await;
        assert_eq!(email.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(state.get_bool(fields::STEP_SUCCESS), Some(false));
        assert_eq!(state.get_u64(fields::CAPABILITY_CALLS), 0);
    }

    #[tokio::test]
    async fn test_act_invokes_approved_calls_once() {
        let email = MockCapability::new("send_email", true);
        let node = ActNode::new(shared(ScriptedReasoner::new(vec![]), vec![email.clone()]));
        let call = CapabilityCall::new("c1", "send_email", json!({}));
        let request = ApprovalRequest::for_calls(vec![call.clone()]);
        let patch = ApprovalDecision::approve(&request.id).into_patch();

        let opened = state_with_plan(vec![Step::new("Send", StepKind::Transform)])
            .apply(&StateUpdate::new().with(fields::PENDING_CALLS, json!([call])))
            .unwrap()
            .apply(&request.open())
            .unwrap();
        let approved = opened
            .apply(&patch)
            .unwrap()
            .apply(&approval::resolve(&opened, &patch).unwrap())
            .unwrap();

        let state = run(&node, &approved, names::ACT).await;
        assert_eq!(email.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(
            approval::status_of(&state, &request.id),
            Some(ApprovalStatus::Executed)
        );
        assert_eq!(state.get_u64(fields::CAPABILITY_CALLS), 1);
        assert!(state.get(fields::STEP_SUCCESS).unwrap().is_null());
    }

    #[tokio::test]
    async fn test_act_skips_after_failure() {
        let bad = MockCapability::failing("lookup");
        let search = MockCapability::new("search", false);
        let node = ActNode::new(shared(
            ScriptedReasoner::new(vec![]),
            vec![bad.clone(), search.clone()],
        ));
        let calls = vec![
            CapabilityCall::new("c1", "lookup", json!({})),
            CapabilityCall::new("c2", "search", json!({})),
        ];
        let state = state_with_plan(vec![Step::new("Lookup", StepKind::Lookup)])
            .apply(&StateUpdate::new().with(fields::PENDING_CALLS, json!(calls)))
            .unwrap();

        let state = run(&node, &state, names::ACT).await;
        assert_eq!(search.invocations.load(Ordering::SeqCst), 0);
        assert_eq!(state.get_bool(fields::STEP_SUCCESS), Some(false));

        let log = messages(&state).unwrap();
        let answers: Vec<_> = log.iter().filter(|m| m.role == Role::Capability).collect();
        assert_eq!(answers.len(), 2);
        assert!(answers[1].content.starts_with("Skipped"));
    }

    #[tokio::test]
    async fn test_advance_resets_retries() {
        let state = state_with_plan(vec![
            Step::new("a", StepKind::Analyze),
            Step::new("b", StepKind::Analyze),
        ])
        .apply(&StateUpdate::new().with(fields::RETRIES, json!(2)))
        .unwrap();

        let state = run(&AdvanceNode, &state, names::ADVANCE).await;
        assert_eq!(state.get_u64(fields::STEP_IDX), 1);
        assert_eq!(state.get_u64(fields::RETRIES), 0);
    }

    #[tokio::test]
    async fn test_replan_installs_fallback() {
        let state = state_with_plan(vec![
            Step::new("a", StepKind::Analyze),
            Step::new("Lookup rates", StepKind::Lookup),
        ])
        .apply(
            &StateUpdate::new()
                .with(fields::STEP_IDX, json!(1))
                .with(fields::RETRIES, json!(2)),
        )
        .unwrap();

        let state = run(&ReplanNode, &state, names::REPLAN).await;
        let plan: Plan = state.get_as(fields::PLAN).unwrap().unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.steps[0].description.contains("Lookup rates"));
        assert_eq!(state.get_u64(fields::STEP_IDX), 0);
        assert_eq!(state.get_u64(fields::RETRIES), 0);
        assert_eq!(state.get_u64(fields::REPLANS), 1);
    }

    #[tokio::test]
    async fn test_finalize_prefers_calculation() {
        let state = state_with_plan(vec![Step::new("Add", StepKind::Calculate)])
            .apply(&StateUpdate::new().with(fields::SCRATCH, json!({"calc_result": "4"})))
            .unwrap();
        let state = run(&FinalizeNode, &state, names::FINALIZE).await;

        let log = messages(&state).unwrap();
        assert_eq!(log.last().unwrap().content, "The result is 4.");
        assert_eq!(state.get_str(fields::STAGE), Some(stages::COMPLETE));
    }

    #[tokio::test]
    async fn test_finalize_without_answer_asks_for_clarification() {
        let state = state_with_plan(vec![Step::new("a", StepKind::Analyze)]);
        let state = run(&FinalizeNode, &state, names::FINALIZE).await;
        let log = messages(&state).unwrap();
        assert_eq!(
            log.last().unwrap().content,
            "Could you clarify what you'd like to do?"
        );
    }

    #[tokio::test]
    async fn test_budget_exit_answers_pending_calls() {
        let node = BudgetExitNode::new(shared(ScriptedReasoner::new(vec![]), vec![]));
        let call = CapabilityCall::new("c1", "search", json!({}));
        let state = state_with_plan(vec![Step::new("a", StepKind::Search)])
            .apply(&StateUpdate::new().with(fields::PENDING_CALLS, json!([call])))
            .unwrap();

        let state = run(&node, &state, names::BUDGET_EXIT).await;
        let log = messages(&state).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].call_id.as_deref(), Some("c1"));
        assert!(log[0].content.starts_with("Cancelled"));
        assert!(log[1].content.starts_with("Stopping early"));
        assert_eq!(state.get_str(fields::STAGE), Some(stages::BUDGET_EXCEEDED));
    }

    #[tokio::test]
    async fn test_cancel_denied_step_counts_as_done() {
        let step = Step::new("Delete records", StepKind::Transform).with_interrupt();
        let request = ApprovalRequest::for_step(0, &step);
        let state = state_with_plan(vec![step])
            .apply(&request.open())
            .unwrap();

        let state = run(&CancelNode, &state, names::CANCEL).await;
        assert_eq!(state.get_bool(fields::STEP_SUCCESS), Some(true));
        assert!(state.get(fields::APPROVAL_REQUEST).unwrap().is_null());
        let log = messages(&state).unwrap();
        assert!(log.last().unwrap().content.contains("Approval denied"));
    }
}
