// SPDX-License-Identifier: MIT

//! Run budgets
//!
//! Checked by routers right before a transition that would call the reasoner
//! or a capability. Exceeding a budget is never retried; the graph routes to
//! its graceful exit instead.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plangraph::workflow::state::WorkflowState;

use super::fields;

/// Limits for a single thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_capability_calls: u64,
    pub max_reasoner_calls: u64,
    /// Wall-clock limit measured from `started_at`
    pub time_limit_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_capability_calls: 25,
            max_reasoner_calls: 50,
            time_limit_secs: 300,
        }
    }
}

/// Which budget ran out
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetExceeded {
    #[error("capability call limit of {limit} reached")]
    CapabilityCalls { limit: u64 },

    #[error("reasoner call limit of {limit} reached")]
    ReasonerCalls { limit: u64 },

    #[error("time limit of {limit_secs}s exceeded")]
    TimeLimit { limit_secs: u64 },
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl BudgetConfig {
    /// Check before asking the reasoner for another decision
    pub fn check_reasoner(&self, state: &WorkflowState, now_ms: i64) -> Option<BudgetExceeded> {
        self.check_time(state, now_ms).or_else(|| {
            (state.get_u64(fields::REASONER_CALLS) >= self.max_reasoner_calls).then_some(
                BudgetExceeded::ReasonerCalls {
                    limit: self.max_reasoner_calls,
                },
            )
        })
    }

    /// Check before invoking `pending` capability calls
    pub fn check_capabilities(
        &self,
        state: &WorkflowState,
        pending: u64,
        now_ms: i64,
    ) -> Option<BudgetExceeded> {
        self.check_time(state, now_ms).or_else(|| {
            let used = state.get_u64(fields::CAPABILITY_CALLS);
            (used + pending > self.max_capability_calls).then_some(
                BudgetExceeded::CapabilityCalls {
                    limit: self.max_capability_calls,
                },
            )
        })
    }

    pub fn check_time(&self, state: &WorkflowState, now_ms: i64) -> Option<BudgetExceeded> {
        let started_at = state.get(fields::STARTED_AT)?.as_i64()?;
        let limit_ms = self.time_limit_secs.saturating_mul(1000) as i64;
        (now_ms - started_at >= limit_ms).then_some(BudgetExceeded::TimeLimit {
            limit_secs: self.time_limit_secs,
        })
    }

    /// First exhausted budget, for the exit message
    pub fn first_exceeded(&self, state: &WorkflowState, now_ms: i64) -> Option<BudgetExceeded> {
        let pending = state
            .get(fields::PENDING_CALLS)
            .and_then(|v| v.as_array())
            .map_or(0, |calls| calls.len() as u64);

        self.check_time(state, now_ms)
            .or_else(|| {
                (pending > 0)
                    .then(|| self.check_capabilities(state, pending, now_ms))
                    .flatten()
            })
            .or_else(|| self.check_reasoner(state, now_ms))
    }
}
