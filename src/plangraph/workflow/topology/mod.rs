// SPDX-License-Identifier: MIT

//! Plan-Execute-Retry-Replan topology
//!
//! A concrete graph on top of the engine:
//!
//! ```text
//! planner ─▶ executor ─▶ act ──────┐
//!               ▲  │ └─▶ approval ─┼─▶ cancel
//!               │  ├─▶ advance ────┤
//!               │  ├─▶ retry ──────┤
//!               │  ├─▶ replan ─────┘
//!               │  ├─▶ finalize / abort ─▶ END
//!               └──┴─▶ budget_exit ─────▶ END
//! ```
//!
//! Every cycle back into `executor` carries a bounded counter: `step_idx`
//! (plan length), `retries` (`max_retries`), `replans` (`max_replans`), or a
//! call budget.

pub mod approval;
pub mod budget;
pub mod config;
pub mod nodes;
pub mod plan;
pub mod routing;

use once_cell::sync::Lazy;
use serde_json::json;
use std::sync::Arc;

use crate::adk::capability::CapabilityPool;
use crate::adk::error::EngineError;
use crate::adk::reasoner::Reasoner;
use crate::plangraph::workflow::checkpoint::CheckpointStore;
use crate::plangraph::workflow::graph::{CompiledGraph, GraphBuilder, END};
use crate::plangraph::workflow::ranker::CapabilityRanker;
use crate::plangraph::workflow::runtime::WorkflowRuntime;
use crate::plangraph::workflow::state::{FieldType, ReducerType, StateSchema, StateUpdate};

use config::EngineConfig;
use nodes::{
    AbortNode, ActNode, AdvanceNode, ApprovalNode, BudgetExitNode, CancelNode, ExecutorNode,
    FinalizeNode, PlannerNode, ReplanNode, RetryNode, Shared,
};
use plan::Planner;
use routing::{ApprovalRouter, BudgetGuard, StepRouter};

/// State field names
pub mod fields {
    pub const INPUT: &str = "input";
    pub const MESSAGES: &str = "messages";
    pub const PLAN: &str = "plan";
    pub const STEP_IDX: &str = "step_idx";
    pub const RETRIES: &str = "retries";
    pub const REPLANS: &str = "replans";
    pub const STEP_SUCCESS: &str = "step_success";
    pub const SCRATCH: &str = "scratch";
    pub const ERRORS: &str = "errors";
    pub const PENDING_CALLS: &str = "pending_calls";
    pub const PENDING_APPROVAL: &str = "pending_approval";
    pub const APPROVAL_REQUEST: &str = "approval_request";
    pub const APPROVALS: &str = "approvals";
    pub const CAPABILITY_CALLS: &str = "capability_calls";
    pub const REASONER_CALLS: &str = "reasoner_calls";
    pub const STARTED_AT: &str = "started_at";
    pub const STAGE: &str = "stage";
    pub const ROUTE: &str = "route";
}

/// Node names
pub mod names {
    pub const PLANNER: &str = "planner";
    pub const EXECUTOR: &str = "executor";
    pub const ACT: &str = "act";
    pub const APPROVAL: &str = "approval";
    pub const CANCEL: &str = "cancel";
    pub const ADVANCE: &str = "advance";
    pub const RETRY: &str = "retry";
    pub const REPLAN: &str = "replan";
    pub const FINALIZE: &str = "finalize";
    pub const ABORT: &str = "abort";
    pub const BUDGET_EXIT: &str = "budget_exit";
}

/// Routing labels
pub mod labels {
    pub const REASON: &str = "reason";
    pub const ACT: &str = "act";
    pub const APPROVAL: &str = "approval";
    pub const CANCEL: &str = "cancel";
    pub const ADVANCE: &str = "advance";
    pub const FINALIZE: &str = "finalize";
    pub const RETRY: &str = "retry";
    pub const REPLAN: &str = "replan";
    pub const ABORT: &str = "abort";
    pub const EXIT: &str = "exit";
}

/// Values of the `stage` field
pub mod stages {
    pub const RUNNING: &str = "running";
    pub const COMPLETE: &str = "complete";
    pub const BUDGET_EXCEEDED: &str = "budget_exceeded";
    pub const FAILED: &str = "failed";
}

static SCHEMA: Lazy<Arc<StateSchema>> = Lazy::new(|| {
    use FieldType::*;
    use ReducerType::*;

    Arc::new(
        StateSchema::default()
            .field(fields::INPUT, String, Overwrite, None)
            .field(fields::MESSAGES, Array, Append, Some(json!([])))
            .field(fields::PLAN, Object, Overwrite, None)
            .field(fields::STEP_IDX, Number, Overwrite, Some(json!(0)))
            .field(fields::RETRIES, Number, Sum, Some(json!(0)))
            .field(fields::REPLANS, Number, Sum, Some(json!(0)))
            .field(fields::STEP_SUCCESS, Boolean, Overwrite, None)
            .field(fields::SCRATCH, Object, Merge, Some(json!({})))
            .field(fields::ERRORS, Array, Append, Some(json!([])))
            .field(fields::PENDING_CALLS, Array, Overwrite, Some(json!([])))
            .field(fields::PENDING_APPROVAL, Boolean, Overwrite, Some(json!(false)))
            .field(fields::APPROVAL_REQUEST, Object, Overwrite, None)
            .field(fields::APPROVALS, Object, Merge, Some(json!({})))
            .field(fields::CAPABILITY_CALLS, Number, Sum, Some(json!(0)))
            .field(fields::REASONER_CALLS, Number, Sum, Some(json!(0)))
            .field(fields::STARTED_AT, Number, KeepFirst, None)
            .field(fields::STAGE, String, Overwrite, None)
            .field(fields::ROUTE, String, Overwrite, None),
    )
});

/// State schema of the plan-execute topology
pub fn plan_execute_schema() -> Arc<StateSchema> {
    SCHEMA.clone()
}

/// Initial input for `WorkflowRuntime::start`
pub fn initial_input(input: &str) -> StateUpdate {
    StateUpdate::new().with(fields::INPUT, json!(input))
}

/// Collaborators and limits for a plan-execute graph
pub struct PlanExecuteTopology {
    planner: Arc<dyn Planner>,
    reasoner: Arc<dyn Reasoner>,
    capabilities: Arc<CapabilityPool>,
    ranker: CapabilityRanker,
    config: EngineConfig,
}

impl PlanExecuteTopology {
    pub fn new(
        planner: Arc<dyn Planner>,
        reasoner: Arc<dyn Reasoner>,
        capabilities: CapabilityPool,
    ) -> Self {
        Self {
            planner,
            reasoner,
            capabilities: Arc::new(capabilities),
            ranker: CapabilityRanker::lexical(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_ranker(mut self, ranker: CapabilityRanker) -> Self {
        self.ranker = ranker;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Wire the nodes and routers into a compiled graph
    pub fn compile(&self) -> Result<CompiledGraph, EngineError> {
        self.config.validate()?;

        let shared = Arc::new(Shared {
            planner: self.planner.clone(),
            reasoner: self.reasoner.clone(),
            capabilities: self.capabilities.clone(),
            ranker: self.ranker.clone(),
            config: self.config.clone(),
        });

        let step_router = Arc::new(StepRouter::new(&self.config));
        let guard = Arc::new(BudgetGuard::new(self.config.budget.clone()));
        let approval_router = Arc::new(ApprovalRouter::new(self.config.budget.clone()));

        let step_branches = [
            (labels::REASON, names::EXECUTOR),
            (labels::ACT, names::ACT),
            (labels::APPROVAL, names::APPROVAL),
            (labels::ADVANCE, names::ADVANCE),
            (labels::FINALIZE, names::FINALIZE),
            (labels::RETRY, names::RETRY),
            (labels::REPLAN, names::REPLAN),
            (labels::ABORT, names::ABORT),
            (labels::EXIT, names::BUDGET_EXIT),
        ];
        let guard_branches = [
            (labels::REASON, names::EXECUTOR),
            (labels::EXIT, names::BUDGET_EXIT),
        ];

        GraphBuilder::new()
            .add_node(names::PLANNER, Arc::new(PlannerNode::new(shared.clone())))
            .add_node(names::EXECUTOR, Arc::new(ExecutorNode::new(shared.clone())))
            .add_node(names::ACT, Arc::new(ActNode::new(shared.clone())))
            .add_node(names::APPROVAL, Arc::new(ApprovalNode))
            .add_node(names::CANCEL, Arc::new(CancelNode))
            .add_node(names::ADVANCE, Arc::new(AdvanceNode))
            .add_node(names::RETRY, Arc::new(RetryNode))
            .add_node(names::REPLAN, Arc::new(ReplanNode))
            .add_node(names::FINALIZE, Arc::new(FinalizeNode))
            .add_node(names::ABORT, Arc::new(AbortNode))
            .add_node(names::BUDGET_EXIT, Arc::new(BudgetExitNode::new(shared)))
            .set_entry(names::PLANNER)
            .add_conditional_edges(names::PLANNER, guard.clone(), &guard_branches)
            .add_conditional_edges(names::EXECUTOR, step_router.clone(), &step_branches)
            .add_conditional_edges(names::ACT, step_router.clone(), &step_branches)
            .add_conditional_edges(names::CANCEL, step_router, &step_branches)
            .add_conditional_edges(
                names::APPROVAL,
                approval_router,
                &[
                    (labels::ACT, names::ACT),
                    (labels::REASON, names::EXECUTOR),
                    (labels::CANCEL, names::CANCEL),
                    (labels::EXIT, names::BUDGET_EXIT),
                ],
            )
            .add_conditional_edges(names::ADVANCE, guard.clone(), &guard_branches)
            .add_conditional_edges(names::RETRY, guard.clone(), &guard_branches)
            .add_conditional_edges(names::REPLAN, guard, &guard_branches)
            .add_edge(names::FINALIZE, END)
            .add_edge(names::ABORT, END)
            .add_edge(names::BUDGET_EXIT, END)
            .recursion_limit(self.config.recursion_limit)
            .compile()
    }

    /// Compile and wrap in a runtime backed by an in-memory checkpoint store
    pub fn into_runtime(self) -> Result<WorkflowRuntime, EngineError> {
        let graph = self.compile()?;
        Ok(WorkflowRuntime::new(Arc::new(graph), plan_execute_schema()))
    }

    /// Compile and wrap in a runtime backed by `store`
    pub fn into_runtime_with_store(
        self,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<WorkflowRuntime, EngineError> {
        let graph = self.compile()?;
        Ok(WorkflowRuntime::with_store(
            Arc::new(graph),
            plan_execute_schema(),
            store,
        ))
    }
}
