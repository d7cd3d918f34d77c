// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable formats shared between the processes of a sharded test run.
//!
//! A run is created once (by `test-orchestrator create`), then consumed by any number of shard
//! processes. Every document that crosses a process boundary lives here:
//!
//! * the lifecycle vocabulary ([`RunStatus`], [`TestStatus`]) persisted by storage backends,
//! * the analyzer output consumed at creation time ([`TestRunInfo`]),
//! * the claimable unit of work ([`TestItem`]),
//! * the structured result printed by the test engine ([`TestReportResult`]),
//! * the aggregated report read back after a run ([`RunReport`]).

mod errors;
mod exit_codes;
mod identity;
mod lifecycle;
mod report;
mod result;
mod run_info;
mod test_item;

pub use errors::*;
pub use exit_codes::*;
pub use identity::*;
pub use lifecycle::*;
pub use report::*;
pub use result::*;
pub use run_info::*;
pub use test_item::*;
