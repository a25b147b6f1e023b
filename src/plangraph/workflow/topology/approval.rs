// SPDX-License-Identifier: MIT

//! Approval gate
//!
//! Side-effecting capability calls and steps marked `requires_interrupt`
//! suspend the thread until the host merges a decision for that specific
//! request. Each request carries its own id and resolution state in the
//! `approvals` map, so a decision can only be applied once.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::adk::capability::CapabilityCall;
use crate::adk::error::EngineError;
use crate::plangraph::workflow::checkpoint::Checkpoint;
use crate::plangraph::workflow::state::{StateUpdate, WorkflowState};

use super::fields;
use super::plan::Step;

/// Scratch key naming the request a decision answers
pub const APPROVAL_ID_KEY: &str = "approval_id";
/// Scratch key holding the boolean decision
pub const APPROVED_KEY: &str = "approved";
/// Scratch key holding the index of the step whose approval was granted
pub const APPROVED_STEP_KEY: &str = "approved_step";

/// What an approval request guards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalKind {
    /// A whole plan step flagged `requires_interrupt`
    Step { step_idx: u64 },
    /// Capability calls that include at least one side-effecting capability
    Calls { calls: Vec<CapabilityCall> },
}

/// Resolution state of a request, stored in `approvals`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    /// Approved calls that have been invoked
    Executed,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Executed => "executed",
        }
    }

    fn parse(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// An open question to the human operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub kind: ApprovalKind,
    /// Human-readable description of what will happen if approved
    pub summary: String,
}

impl ApprovalRequest {
    pub fn for_step(step_idx: u64, step: &Step) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ApprovalKind::Step { step_idx },
            summary: format!(
                "Step {} requires approval before it runs: {}",
                step_idx + 1,
                step.description
            ),
        }
    }

    pub fn for_calls(calls: Vec<CapabilityCall>) -> Self {
        let mut summary = format!(
            "Approval required for {} capability call(s):",
            calls.len()
        );
        for call in &calls {
            summary.push_str(&format!("\n- {}({})", call.name, call.args));
        }
        Self {
            id: Uuid::new_v4().to_string(),
            kind: ApprovalKind::Calls { calls },
            summary,
        }
    }

    /// State update that opens this request
    pub fn open(&self) -> StateUpdate {
        StateUpdate::new()
            .with(fields::APPROVAL_REQUEST, json!(self))
            .with(fields::PENDING_APPROVAL, json!(true))
            .with(fields::APPROVALS, json!({ &self.id: ApprovalStatus::Pending.as_str() }))
    }
}

/// The host's answer to an approval request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub approved: bool,
}

impl ApprovalDecision {
    pub fn approve(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: true,
        }
    }

    pub fn deny(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: false,
        }
    }

    /// Resume patch carrying the decision in `scratch`
    pub fn into_patch(self) -> StateUpdate {
        StateUpdate::new().with(
            fields::SCRATCH,
            json!({ APPROVAL_ID_KEY: self.request_id, APPROVED_KEY: self.approved }),
        )
    }
}

/// Active request recorded in the state, if any
pub fn current_request(state: &WorkflowState) -> Result<Option<ApprovalRequest>, EngineError> {
    Ok(state.get_as::<ApprovalRequest>(fields::APPROVAL_REQUEST)?)
}

/// Resolution state of request `id`
pub fn status_of(state: &WorkflowState, id: &str) -> Option<ApprovalStatus> {
    state
        .get(fields::APPROVALS)
        .and_then(|approvals| approvals.get(id))
        .and_then(ApprovalStatus::parse)
}

/// Whether the step at `step_idx` has a granted step-level approval
pub fn step_approved(state: &WorkflowState, step_idx: u64) -> bool {
    state
        .get_path(&format!("{}.{}", fields::SCRATCH, APPROVED_STEP_KEY))
        .and_then(Value::as_u64)
        == Some(step_idx)
}

/// Validate a resume patch against the open request.
///
/// Returns the bookkeeping that records the resolution. A patch for another
/// request, a patch without a boolean decision, or a decision for a request
/// that is no longer pending is rejected.
pub fn resolve(state: &WorkflowState, patch: &StateUpdate) -> Result<StateUpdate, EngineError> {
    let request = current_request(state)?
        .ok_or_else(|| EngineError::invalid_resume("no approval request is open"))?;

    let decision = patch.get(fields::SCRATCH).ok_or_else(|| {
        EngineError::invalid_resume(format!(
            "resume patch must set {}.{} and {}.{}",
            fields::SCRATCH,
            APPROVAL_ID_KEY,
            fields::SCRATCH,
            APPROVED_KEY
        ))
    })?;

    let request_id = decision.get(APPROVAL_ID_KEY).and_then(Value::as_str);
    if request_id != Some(request.id.as_str()) {
        return Err(EngineError::invalid_resume(format!(
            "decision is for request {:?}, but request {} is open",
            request_id, request.id
        )));
    }

    let approved = decision
        .get(APPROVED_KEY)
        .and_then(Value::as_bool)
        .ok_or_else(|| EngineError::invalid_resume("decision must be a boolean"))?;

    match status_of(state, &request.id) {
        Some(ApprovalStatus::Pending) => {}
        Some(status) => {
            return Err(EngineError::invalid_resume(format!(
                "request {} is already {}",
                request.id,
                status.as_str()
            )))
        }
        None => {
            return Err(EngineError::invalid_resume(format!(
                "request {} is unknown",
                request.id
            )))
        }
    }

    let status = if approved {
        ApprovalStatus::Approved
    } else {
        ApprovalStatus::Denied
    };
    log::info!("Approval request {} {}", request.id, status.as_str());

    let mut update = StateUpdate::new()
        .with(fields::APPROVALS, json!({ &request.id: status.as_str() }))
        .with(fields::PENDING_APPROVAL, json!(false));
    if let (true, ApprovalKind::Step { step_idx }) = (approved, &request.kind) {
        update = update.with(fields::SCRATCH, json!({ APPROVED_STEP_KEY: step_idx }));
    }
    Ok(update)
}

/// Reject continuing with an approved request that another branch of the
/// thread already approved or carried out.
///
/// Resolution state lives in each branch's own `approvals`, so a fork taken
/// before the decision would otherwise accept it a second time. A request
/// that was only ever denied elsewhere may still be approved.
pub fn check_other_branches(
    state: &WorkflowState,
    elsewhere: &[Checkpoint],
) -> Result<(), EngineError> {
    let Some(request) = current_request(state)? else {
        return Ok(());
    };
    if status_of(state, &request.id) != Some(ApprovalStatus::Approved) {
        return Ok(());
    }

    let settled = elsewhere
        .iter()
        .filter_map(|checkpoint| status_of(&checkpoint.state, &request.id))
        .find(|status| matches!(status, ApprovalStatus::Approved | ApprovalStatus::Executed));
    match settled {
        Some(status) => Err(EngineError::invalid_resume(format!(
            "request {} was already {} on another branch",
            request.id,
            status.as_str()
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plangraph::workflow::checkpoint::{CheckpointMeta, CheckpointSource, ThreadStatus};
    use crate::plangraph::workflow::topology::plan::StepKind;
    use crate::plangraph::workflow::topology::plan_execute_schema;

    fn step() -> Step {
        Step::new("Send the report", StepKind::Transform).with_interrupt()
    }

    fn with_open(request: &ApprovalRequest) -> WorkflowState {
        WorkflowState::from_schema(plan_execute_schema())
            .apply(&request.open())
            .unwrap()
    }

    #[test]
    fn test_request_serialization() {
        let request = ApprovalRequest::for_step(1, &step());
        let value = json!(request);
        assert_eq!(value["kind"]["type"], "step");
        assert_eq!(value["kind"]["step_idx"], 1);
        assert!(request.summary.contains("Step 2"));

        let calls = vec![CapabilityCall::new("c1", "send_email", json!({"to": "a@b.c"}))];
        let request = ApprovalRequest::for_calls(calls);
        assert!(request.summary.contains("send_email"));
        let back: ApprovalRequest = serde_json::from_value(json!(request)).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_open_marks_pending() {
        let request = ApprovalRequest::for_step(0, &step());
        let state = with_open(&request);

        assert_eq!(state.get_bool(fields::PENDING_APPROVAL), Some(true));
        assert_eq!(status_of(&state, &request.id), Some(ApprovalStatus::Pending));
        assert_eq!(current_request(&state).unwrap(), Some(request));
    }

    #[test]
    fn test_resolve_approved_step() {
        let request = ApprovalRequest::for_step(2, &step());
        let state = with_open(&request);
        let patch = ApprovalDecision::approve(&request.id).into_patch();

        let extra = resolve(&state, &patch).unwrap();
        let state = state.apply(&patch).unwrap().apply(&extra).unwrap();

        assert_eq!(status_of(&state, &request.id), Some(ApprovalStatus::Approved));
        assert_eq!(state.get_bool(fields::PENDING_APPROVAL), Some(false));
        assert!(step_approved(&state, 2));
        assert!(!step_approved(&state, 1));
    }

    #[test]
    fn test_resolve_rejects_mismatched_id() {
        let request = ApprovalRequest::for_step(0, &step());
        let state = with_open(&request);
        let patch = ApprovalDecision::approve("someone-else").into_patch();

        let err = resolve(&state, &patch).unwrap_err();
        assert!(matches!(err, EngineError::InvalidResume(_)));
    }

    #[test]
    fn test_resolve_rejects_missing_decision() {
        let request = ApprovalRequest::for_step(0, &step());
        let state = with_open(&request);

        let patch = StateUpdate::new().with(fields::SCRATCH, json!({ APPROVAL_ID_KEY: request.id }));
        assert!(resolve(&state, &patch).is_err());
        assert!(resolve(&state, &StateUpdate::new()).is_err());
    }

    #[test]
    fn test_resolve_twice_is_rejected() {
        let request = ApprovalRequest::for_calls(vec![CapabilityCall::new(
            "c1",
            "send_email",
            json!({}),
        )]);
        let state = with_open(&request);
        let patch = ApprovalDecision::deny(&request.id).into_patch();

        let extra = resolve(&state, &patch).unwrap();
        let state = state.apply(&patch).unwrap().apply(&extra).unwrap();
        assert_eq!(status_of(&state, &request.id), Some(ApprovalStatus::Denied));

        let err = resolve(&state, &patch).unwrap_err();
        assert!(err.to_string().contains("already denied"));
    }

    fn checkpoint(state: WorkflowState) -> Checkpoint {
        Checkpoint {
            id: Uuid::new_v4(),
            thread_id: "t".to_string(),
            sequence_no: 0,
            parent_id: None,
            meta: CheckpointMeta {
                node: "approval".to_string(),
                source: CheckpointSource::Resume,
                next: None,
                status: ThreadStatus::Running,
            },
            state,
            created_at: chrono::Utc::now(),
        }
    }

    fn decided(state: &WorkflowState, decision: ApprovalDecision) -> WorkflowState {
        let patch = decision.into_patch();
        let extra = resolve(state, &patch).unwrap();
        state.apply(&patch).unwrap().apply(&extra).unwrap()
    }

    #[test]
    fn test_other_branches_block_a_second_approval() {
        let request = ApprovalRequest::for_calls(vec![CapabilityCall::new(
            "c1",
            "send_email",
            json!({}),
        )]);
        let open = with_open(&request);
        let approved = decided(&open, ApprovalDecision::approve(&request.id));
        let executed = approved
            .apply(&StateUpdate::new().with(
                fields::APPROVALS,
                json!({ &request.id: ApprovalStatus::Executed.as_str() }),
            ))
            .unwrap();

        // Same decision taken again on a branch forked before it
        let err = check_other_branches(&approved, &[checkpoint(executed)]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidResume(_)));
        assert!(err.to_string().contains("already executed"));

        let err = check_other_branches(&approved, &[checkpoint(approved.clone())]).unwrap_err();
        assert!(err.to_string().contains("already approved"));

        // Nothing elsewhere, or the open request itself
        assert!(check_other_branches(&approved, &[]).is_ok());
        assert!(check_other_branches(&open, &[checkpoint(approved.clone())]).is_ok());
    }

    #[test]
    fn test_denied_elsewhere_may_be_approved() {
        let request = ApprovalRequest::for_step(0, &step());
        let open = with_open(&request);
        let denied = decided(&open, ApprovalDecision::deny(&request.id));
        let approved = decided(&open, ApprovalDecision::approve(&request.id));

        assert!(check_other_branches(&approved, &[checkpoint(denied)]).is_ok());

        // A denial never repeats work, whatever happened elsewhere
        let denied = decided(&open, ApprovalDecision::deny(&request.id));
        assert!(check_other_branches(&denied, &[checkpoint(approved)]).is_ok());
    }
}
