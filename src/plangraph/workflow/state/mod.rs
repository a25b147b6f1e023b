// SPDX-License-Identifier: MIT

//! State management for graph workflows
//!
//! This module provides:
//! - `StateSchema` - defines the shape, types and reducers of workflow state
//! - `WorkflowState` - immutable state snapshots with reducer-based merging
//! - `StateUpdate` - the partial updates nodes and hosts emit

mod schema;
mod store;
mod update;

pub use schema::{FieldType, ReducerType, StateFieldDef, StateSchema};
pub use store::WorkflowState;
pub use update::{StateUpdate, UpdateEntry, UpdateMode};
