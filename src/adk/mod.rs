// SPDX-License-Identifier: MIT

//! Agent development kit - the primitives a host plugs into the engine
//!
//! - `capability` - named external actions and the capability pool
//! - `reasoner` - the opaque decision step and the message log types
//! - `embedding` - text embeddings used by the capability ranker
//! - `retry` - bounded exponential backoff around external calls
//! - `error` - the error taxonomy

pub mod capability;
pub mod embedding;
pub mod error;
pub mod reasoner;
pub mod retry;
