// SPDX-License-Identifier: MIT

pub mod checkpoint;
pub mod graph;
pub mod ranker;
pub mod runtime;
pub mod state;
pub mod supervisor;
pub mod topology;
