// SPDX-License-Identifier: MIT

//! Routers of the plan-execute topology
//!
//! Budgets are checked here, on every label that leads into a reasoner or
//! capability call, so the exit path is taken before the call is attempted.

use crate::adk::capability::CapabilityCall;
use crate::plangraph::workflow::graph::Router;
use crate::plangraph::workflow::state::WorkflowState;

use super::approval::{self, ApprovalKind, ApprovalStatus};
use super::budget::{now_ms, BudgetConfig};
use super::config::EngineConfig;
use super::{fields, labels};

fn pending_calls(state: &WorkflowState) -> usize {
    state
        .get(fields::PENDING_CALLS)
        .and_then(|v| v.as_array())
        .map_or(0, Vec::len)
}

fn plan_len(state: &WorkflowState) -> u64 {
    state
        .get_path(&format!("{}.steps", fields::PLAN))
        .and_then(|v| v.as_array())
        .map_or(0, |steps| steps.len() as u64)
}

fn to_labels(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|l| l.to_string()).collect()
}

/// Routes after `executor`, `act`, and `cancel`
pub struct StepRouter {
    max_retries: u64,
    max_replans: u64,
    budget: BudgetConfig,
}

impl StepRouter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_replans: config.max_replans,
            budget: config.budget.clone(),
        }
    }

    /// Route at a given wall-clock time
    pub fn route_at(&self, state: &WorkflowState, now_ms: i64) -> &'static str {
        if state.get_bool(fields::PENDING_APPROVAL) == Some(true) {
            return labels::APPROVAL;
        }

        let pending = pending_calls(state);
        if pending > 0 {
            return match self.budget.check_capabilities(state, pending as u64, now_ms) {
                Some(exceeded) => {
                    log::warn!("Budget exceeded before capability calls: {}", exceeded);
                    labels::EXIT
                }
                None => labels::ACT,
            };
        }

        match state.get_bool(fields::STEP_SUCCESS) {
            None => match self.budget.check_reasoner(state, now_ms) {
                Some(exceeded) => {
                    log::warn!("Budget exceeded before reasoning: {}", exceeded);
                    labels::EXIT
                }
                None => labels::REASON,
            },
            Some(true) => {
                if state.get_u64(fields::STEP_IDX) + 1 < plan_len(state) {
                    labels::ADVANCE
                } else {
                    labels::FINALIZE
                }
            }
            Some(false) => {
                if state.get_u64(fields::RETRIES) < self.max_retries {
                    labels::RETRY
                } else if state.get_u64(fields::REPLANS) < self.max_replans {
                    labels::REPLAN
                } else {
                    labels::ABORT
                }
            }
        }
    }
}

impl Router for StepRouter {
    fn labels(&self) -> Vec<String> {
        to_labels(&[
            labels::REASON,
            labels::ACT,
            labels::APPROVAL,
            labels::ADVANCE,
            labels::FINALIZE,
            labels::RETRY,
            labels::REPLAN,
            labels::ABORT,
            labels::EXIT,
        ])
    }

    fn route(&self, state: &WorkflowState) -> String {
        self.route_at(state, now_ms()).to_string()
    }
}

/// Budget check in front of `executor`
pub struct BudgetGuard {
    budget: BudgetConfig,
}

impl BudgetGuard {
    pub fn new(budget: BudgetConfig) -> Self {
        Self { budget }
    }
}

impl Router for BudgetGuard {
    fn labels(&self) -> Vec<String> {
        to_labels(&[labels::REASON, labels::EXIT])
    }

    fn route(&self, state: &WorkflowState) -> String {
        match self.budget.check_reasoner(state, now_ms()) {
            Some(exceeded) => {
                log::warn!("Budget exceeded: {}", exceeded);
                labels::EXIT.to_string()
            }
            None => labels::REASON.to_string(),
        }
    }
}

/// Routes after a resumed `approval` node
pub struct ApprovalRouter {
    budget: BudgetConfig,
}

impl ApprovalRouter {
    pub fn new(budget: BudgetConfig) -> Self {
        Self { budget }
    }

    pub fn route_at(&self, state: &WorkflowState, now_ms: i64) -> &'static str {
        let request = match approval::current_request(state) {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => {
                log::warn!("No approval request recorded, treating as denied");
                return labels::CANCEL;
            }
        };

        match (approval::status_of(state, &request.id), &request.kind) {
            (Some(ApprovalStatus::Approved), ApprovalKind::Calls { calls }) => {
                self.after_calls_approved(state, calls, now_ms)
            }
            (Some(ApprovalStatus::Approved), ApprovalKind::Step { .. }) => {
                match self.budget.check_reasoner(state, now_ms) {
                    Some(_) => labels::EXIT,
                    None => labels::REASON,
                }
            }
            _ => labels::CANCEL,
        }
    }

    fn after_calls_approved(
        &self,
        state: &WorkflowState,
        calls: &[CapabilityCall],
        now_ms: i64,
    ) -> &'static str {
        match self
            .budget
            .check_capabilities(state, calls.len() as u64, now_ms)
        {
            Some(_) => labels::EXIT,
            None => labels::ACT,
        }
    }
}

impl Router for ApprovalRouter {
    fn labels(&self) -> Vec<String> {
        to_labels(&[labels::ACT, labels::REASON, labels::CANCEL, labels::EXIT])
    }

    fn route(&self, state: &WorkflowState) -> String {
        self.route_at(state, now_ms()).to_string()
    }
}
