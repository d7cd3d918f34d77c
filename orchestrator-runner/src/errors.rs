// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by test-orchestrator.

use crate::config::StorageKind;
use camino::Utf8PathBuf;
use config::ConfigError;
use orchestrator_metadata::{RunUuid, StatusCodeError, TestIdentity, TestStatus};
use std::time::Duration;
use thiserror::Error;

/// An error that occurred while parsing the orchestrator config.
#[derive(Debug, Error)]
#[error("failed to parse orchestrator config{}", display_config_file(.config_file))]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Option<Utf8PathBuf>,
    #[source]
    err: ConfigError,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: Option<Utf8PathBuf>, err: ConfigError) -> Self {
        Self { config_file, err }
    }

    /// Returns the config file that failed to parse, if the failure came from a file.
    pub fn config_file(&self) -> Option<&Utf8PathBuf> {
        self.config_file.as_ref()
    }
}

fn display_config_file(config_file: &Option<Utf8PathBuf>) -> String {
    match config_file {
        Some(path) => format!(" at `{path}`"),
        None => String::new(),
    }
}

/// The configured storage backend is incomplete.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageConfigError {
    /// No backend was selected.
    #[error("no storage backend configured: pass --storage or set `storage.kind`")]
    MissingKind,

    /// The selected backend is missing a required setting.
    #[error("the {kind} storage backend requires `storage.{key}` (--{key})")]
    MissingKey {
        /// The selected backend.
        kind: StorageKind,
        /// The missing key.
        key: &'static str,
    },
}

/// An error returned by a storage adapter.
///
/// Transient races (a lost claim, a lock held by another shard) are recovered inside the
/// adapters and never surface as a `StorageError`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The run does not exist in the store.
    #[error("run {run_id} not found")]
    RunNotFound {
        /// The run that was looked up.
        run_id: RunUuid,
    },

    /// Two test items of the same run resolved to the same identity.
    #[error(
        "test {first} has the same identity as {second} (`{identity}`): \
         give one of them a unique `id` annotation"
    )]
    DuplicateTestIdentity {
        /// The shared identity.
        identity: TestIdentity,
        /// The first test with this identity, as `[project] file:line:column`.
        first: String,
        /// The second test with this identity.
        second: String,
    },

    /// A result was recorded for a test item that does not exist in the run.
    #[error("test item {order} not found in run {run_id}")]
    TestItemNotFound {
        /// The run.
        run_id: RunUuid,
        /// The order number of the item.
        order: u32,
    },

    /// A result was recorded for a test item that is not currently claimed by a shard.
    #[error("test item {order} in run {run_id} is {status}, not ongoing")]
    TestItemNotStarted {
        /// The run.
        run_id: RunUuid,
        /// The order number of the item.
        order: u32,
        /// The status the item was found in.
        status: TestStatus,
    },

    /// A record kept changing underneath a conditional write.
    #[error("`{key}` was modified concurrently {attempts} times in a row")]
    OptimisticWriteConflict {
        /// The key of the record that could not be updated.
        key: String,
        /// The number of attempts made.
        attempts: usize,
    },

    /// The SQLite table-name prefix contains characters other than ASCII alphanumerics and `_`.
    #[error("invalid table prefix `{prefix}`: only ASCII letters, digits and `_` are allowed")]
    InvalidTablePrefix {
        /// The rejected prefix.
        prefix: String,
    },

    /// A SQLite operation failed.
    #[error("sqlite error while {context}")]
    Sqlite {
        /// What the adapter was doing.
        context: &'static str,
        /// The underlying error.
        #[source]
        error: rusqlite::Error,
    },

    /// A stored status code could not be interpreted.
    #[error("corrupt record in store")]
    CorruptStatus(#[from] StatusCodeError),

    /// A stored timestamp is out of range.
    #[error("corrupt record in store: timestamp {millis}ms is out of range")]
    CorruptTimestamp {
        /// The stored value, in milliseconds since the Unix epoch.
        millis: i64,
    },

    /// Creating a storage directory failed.
    #[error("failed to create storage directory `{path}`")]
    DirCreate {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Acquiring a file lock failed.
    #[error("failed to acquire lock on `{path}`")]
    FileLock {
        /// The lock file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A file lock was held by other shards for longer than the configured budget.
    #[error("timed out after {}s waiting for lock on `{path}`", .timeout.as_secs_f64())]
    FileLockTimeout {
        /// The lock file.
        path: Utf8PathBuf,
        /// How long the adapter waited.
        timeout: Duration,
    },

    /// Reading a storage file failed.
    #[error("failed to read `{path}`")]
    FileRead {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Atomically replacing a storage file failed.
    #[error("failed to write `{path}`")]
    FileWrite {
        /// The file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: atomicwrites::Error<std::io::Error>,
    },

    /// A stored document could not be deserialized.
    #[error("failed to deserialize {what}")]
    Deserialize {
        /// What was being deserialized.
        what: String,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },

    /// A document could not be serialized.
    #[error("failed to serialize {what}")]
    Serialize {
        /// What was being serialized.
        what: &'static str,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

impl StorageError {
    pub(crate) fn sqlite(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |error| Self::Sqlite { context, error }
    }
}

/// The test engine could not be invoked, or produced output that could not be interpreted.
///
/// This is distinct from a test failure: it means the shard cannot tell whether the test
/// passed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The engine process could not be spawned.
    #[error("failed to spawn test engine `{program}`")]
    Spawn {
        /// The engine program.
        program: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// Waiting for the engine process failed.
    #[error("failed to wait for test engine running {locator}")]
    Wait {
        /// The test being executed.
        locator: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The engine's standard output was not a valid result document.
    #[error("failed to parse test engine output for {locator} (exit code {exit_code:?})")]
    OutputParse {
        /// The test being executed.
        locator: String,
        /// The engine's exit code.
        exit_code: Option<i32>,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error that occurred while running the test analyzer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AnalyzerError {
    /// The analyzer could not be executed.
    #[error("failed to execute `{command}`")]
    Exec {
        /// The command line.
        command: String,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// The analyzer exited with a failure.
    #[error("`{command}` failed with exit code {exit_code:?}")]
    Failed {
        /// The command line.
        command: String,
        /// The exit code, if any.
        exit_code: Option<i32>,
        /// Standard error of the analyzer.
        stderr: String,
    },

    /// The analyzer's output was not a valid test list.
    #[error("failed to parse output of `{command}`")]
    Parse {
        /// The command line.
        command: String,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error that aborted a shard.
///
/// Test failures never produce a `ShardError`. When a shard aborts, the items it had claimed
/// stay `Ongoing` in the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShardError {
    /// Creating the shard's async runtime failed.
    #[error("error creating tokio runtime")]
    RuntimeCreate(#[source] std::io::Error),

    /// Clearing the shard's output directory failed.
    #[error("failed to remove previous output directory `{path}`")]
    OutputDirRemove {
        /// The output directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },

    /// A storage operation failed.
    #[error("storage operation failed")]
    Storage(#[from] StorageError),

    /// The test engine failed.
    #[error("test execution infrastructure failed")]
    Engine(#[from] EngineError),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// An error that occurred while writing a run report.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteReportError {
    /// Writing to the output failed.
    #[error("error writing report")]
    Io(#[from] std::io::Error),

    /// Serializing the report failed.
    #[error("error serializing report to JSON")]
    Json(#[from] serde_json::Error),

    /// Appending to the step summary file failed.
    #[error("error appending to step summary `{path}`")]
    StepSummary {
        /// The step summary file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
}
