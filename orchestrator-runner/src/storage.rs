// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The storage adapter contract and its backends.
//!
//! A run is coordinated exclusively through a [`StorageAdapter`]: shards share no memory, and
//! every mutation of run status, item status and history goes through one of the adapter's
//! atomic operations. Backends differ in how they realize atomicity (transactions, advisory
//! file locks, conditional writes) but must be observably equivalent. The conformance suite in
//! this module's tests is run against each of them.

#[cfg(test)]
mod conformance;
mod file;
mod kv;
mod sqlite;

pub use file::FileStorage;
pub use kv::{KeyValueStorage, KeyValueStore, KvVersion, MemoryKeyValueStore};
pub use sqlite::SqliteStorage;

use crate::{
    errors::StorageError,
    history::{HistoryRecord, HistoryStats},
    scheduler::{self, PendingTest},
};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use orchestrator_metadata::{
    RunConfig, RunReport, RunUuid, TestIdentity, TestItem, TestReportResult, TestRunInfo,
    TestStatus,
};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

/// The operations every storage backend provides.
///
/// All methods are blocking. Async callers run them on a blocking thread pool.
pub trait StorageAdapter: Send + Sync + fmt::Debug {
    /// Creates backing tables, directories or indexes. Safe to call on an initialized store.
    fn initialize(&self) -> Result<(), StorageError>;

    /// Persists a new run in [`RunStatus::Created`](orchestrator_metadata::RunStatus::Created)
    /// along with its ordered queue, and returns its identifier.
    ///
    /// No shard can observe the run until the whole queue is written.
    fn save_test_run(
        &self,
        info: &TestRunInfo,
        args: &[String],
        history_window: usize,
    ) -> Result<RunUuid, StorageError>;

    /// Registers a shard start, advancing `Created → Run` or `Finished → RepeatRun` (re-arming
    /// failed items) at most once per concurrent race, and returns the current configuration.
    fn start_shard(&self, run_id: RunUuid) -> Result<RunConfig, StorageError>;

    /// Claims the lowest-ordered `Ready` item, moving it to `Ongoing`.
    ///
    /// Returns `None` once no `Ready` item remains.
    fn get_next_test(
        &self,
        run_id: RunUuid,
        config: &RunConfig,
    ) -> Result<Option<TestItem>, StorageError>;

    /// Records the result of a claimed item: sets its status, appends to the identity's
    /// history, and stores a report snapshot alongside the item.
    ///
    /// Fails with [`StorageError::TestItemNotStarted`] without writing anything if the item
    /// is not `Ongoing`.
    fn record_result(
        &self,
        run_id: RunUuid,
        config: &RunConfig,
        item: &TestItem,
        verdict: TestVerdict,
        result: &TestReportResult,
    ) -> Result<(), StorageError>;

    /// Records a passing result.
    fn finish_test(
        &self,
        run_id: RunUuid,
        config: &RunConfig,
        item: &TestItem,
        result: &TestReportResult,
    ) -> Result<(), StorageError> {
        self.record_result(run_id, config, item, TestVerdict::Passed, result)
    }

    /// Records a failing result.
    fn fail_test(
        &self,
        run_id: RunUuid,
        config: &RunConfig,
        item: &TestItem,
        result: &TestReportResult,
    ) -> Result<(), StorageError> {
        self.record_result(run_id, config, item, TestVerdict::Failed, result)
    }

    /// Marks the run `Finished`. Every shard calls this when it runs out of work.
    fn finish_shard(&self, run_id: RunUuid) -> Result<(), StorageError>;

    /// Reads back the run configuration and every item's report.
    fn get_report_data(&self, run_id: RunUuid) -> Result<RunReport, StorageError>;

    /// Returns the history of a test identity, if any exists.
    fn get_history(&self, identity: &TestIdentity) -> Result<Option<HistoryRecord>, StorageError>;
}

/// The outcome of a test execution, as recorded in storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestVerdict {
    /// The engine reported success.
    Passed,
    /// The engine reported failure.
    Failed,
}

impl TestVerdict {
    /// Returns the item status this verdict moves the item to.
    pub fn status(self) -> TestStatus {
        match self {
            Self::Passed => TestStatus::Passed,
            Self::Failed => TestStatus::Failed,
        }
    }
}

/// How to open a storage backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageOptions {
    /// A SQLite database file.
    Sqlite {
        /// The database file. Created if missing.
        path: Utf8PathBuf,
        /// The prefix of every table name.
        table_prefix: String,
    },

    /// A directory of JSON documents guarded by advisory locks.
    File {
        /// The storage directory. Created if missing.
        directory: Utf8PathBuf,
        /// How long to wait for a lock held by another shard.
        lock_timeout: Duration,
    },
}

impl StorageOptions {
    /// Opens the configured backend.
    ///
    /// History records inactive for longer than `history_ttl` are purged on run creation; a
    /// zero TTL keeps them forever.
    pub fn open(&self, history_ttl: Duration) -> Result<Arc<dyn StorageAdapter>, StorageError> {
        match self {
            Self::Sqlite { path, table_prefix } => Ok(Arc::new(SqliteStorage::open(
                path,
                table_prefix,
                history_ttl,
            )?)),
            Self::File {
                directory,
                lock_timeout,
            } => Ok(Arc::new(FileStorage::new(
                directory.clone(),
                *lock_timeout,
                history_ttl,
            ))),
        }
    }
}

impl fmt::Display for StorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite { path, table_prefix } => {
                write!(f, "sqlite database `{path}` (prefix `{table_prefix}`)")
            }
            Self::File { directory, .. } => write!(f, "file storage at `{directory}`"),
        }
    }
}

/// A run that passed validation but has not been ordered yet.
///
/// Backends build this before writing anything, look up history for
/// [`identities`](Self::identities), then call [`schedule`](Self::schedule).
#[derive(Debug)]
pub(crate) struct NewRun {
    pub(crate) run_id: RunUuid,
    pub(crate) config: RunConfig,
    pending: Vec<PendingTest>,
}

impl NewRun {
    pub(crate) fn new(
        info: &TestRunInfo,
        args: &[String],
        history_window: usize,
        now: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        let pending = scheduler::flatten_test_run(&info.test_run)?;
        Ok(Self {
            run_id: RunUuid::new_v4(),
            config: RunConfig::new(info.config.clone(), args.to_vec(), history_window, now),
            pending,
        })
    }

    pub(crate) fn identities(&self) -> impl Iterator<Item = &TestIdentity> {
        self.pending.iter().map(|test| &test.identity)
    }

    /// Orders the queue against the looked-up history.
    pub(crate) fn schedule(
        self,
        history: &HashMap<TestIdentity, HistoryStats>,
    ) -> (RunUuid, RunConfig, Vec<TestItem>) {
        let items = scheduler::order_tests(self.pending, history, self.config.history_window);
        (self.run_id, self.config, items)
    }
}
