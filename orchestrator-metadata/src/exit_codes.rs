// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `test-orchestrator` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
///
/// Test failures are not reflected in the exit code of a shard: they are recorded in the store
/// and show up in the run report.
pub enum OrchestratorExitCode {}

impl OrchestratorExitCode {
    /// No errors occurred and the command exited normally.
    pub const OK: i32 = 0;

    /// A user issue happened while setting up an invocation: bad configuration, bad storage
    /// options or an unreadable argument.
    pub const SETUP_ERROR: i32 = 96;

    /// The referenced run does not exist in the store.
    pub const RUN_NOT_FOUND: i32 = 97;

    /// Two tests of the same run resolved to the same identity.
    pub const DUPLICATE_TEST_IDENTITY: i32 = 98;

    /// The storage backend returned an error that could not be recovered.
    pub const STORAGE_ERROR: i32 = 99;

    /// The test analyzer could not produce a test list.
    pub const TEST_LIST_CREATION_FAILED: i32 = 104;

    /// The test engine could not be invoked, or produced output that could not be parsed.
    pub const EXECUTION_INFRASTRUCTURE_FAILED: i32 = 105;

    /// Writing data to stdout or stderr produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
