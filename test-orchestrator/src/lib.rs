// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Orchestrates test runs sharded across machines.
//!
//! `test-orchestrator create` discovers the tests of a run and stores them as a queue ordered
//! by expected duration. Any number of `test-orchestrator run` shards then drain that queue
//! concurrently, recording results and per-test history in the shared store. Failed tests of
//! a finished run are retried by starting another shard.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{OutputContext, OutputWriter, StderrStyles};
