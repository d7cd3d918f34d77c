// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for test-orchestrator.
//!
//! A run moves through three phases:
//!
//! 1. **Creation**: the engine's `list` subcommand is invoked through the
//!    [`analyzer`], the discovered tests are flattened and ordered by the [`scheduler`] using
//!    [`history`], and the queue is persisted through a [`storage`] backend.
//! 2. **Execution**: any number of shards, each a [`runner::ShardRunner`], claim items from
//!    the shared queue and execute them through the [`engine`] until none remain.
//! 3. **Reporting**: the [`report`] module renders what the shards recorded.

pub mod analyzer;
pub mod config;
pub mod engine;
pub mod errors;
pub mod helpers;
pub mod history;
pub mod report;
pub mod reporter;
pub mod runner;
pub mod scheduler;
pub mod storage;
