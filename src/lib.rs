// SPDX-License-Identifier: MIT

//! Durable, resumable plan-execute workflows
//!
//! `adk` holds the primitives a host provides (capabilities, reasoner,
//! embedder) and the error taxonomy. `plangraph::workflow` holds the state
//! store, checkpointing, the graph engine, and the two topologies built on
//! top of it: plan-execute and supervisor.

pub mod adk;
pub mod plangraph;
