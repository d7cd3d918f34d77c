// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage in a directory of JSON documents.
//!
//! Layout:
//!
//! ```text
//! <directory>/
//!   history.json              every history record, keyed by identity
//!   runs/<run-id>.tests.json  the run's queue: items with their status and report
//!   runs/<run-id>.config.json the run configuration, written last on creation
//! ```
//!
//! Every read-modify-write holds an exclusive advisory lock on a sibling `.lock` file, and
//! every write is an atomic replace, so lock-free readers always see a whole document. When two
//! locks are needed they are taken in the order config, tests, history.

use super::{NewRun, StorageAdapter, TestVerdict};
use crate::{
    errors::StorageError,
    history::{HistoryEntry, HistoryRecord},
};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use orchestrator_metadata::{
    ReportSnapshot, RunConfig, RunReport, RunStatus, RunUuid, TestIdentity, TestItem,
    TestReport, TestReportResult, TestRunInfo, TestStatus,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions, TryLockError},
    io::{self, Write},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);
const HISTORY_FILE_NAME: &str = "history.json";
const RUNS_DIR_NAME: &str = "runs";

type HistoryMap = BTreeMap<TestIdentity, HistoryRecord>;

/// Storage in a local or shared directory, coordinated with advisory file locks.
#[derive(Debug)]
pub struct FileStorage {
    directory: Utf8PathBuf,
    lock_timeout: Duration,
    history_ttl: Duration,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct StoredTest {
    item: TestItem,
    status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    report: Option<ReportSnapshot>,
}

impl FileStorage {
    /// Creates a new file storage rooted at `directory`.
    ///
    /// Nothing is touched on disk until [`initialize`](StorageAdapter::initialize) or a run is
    /// created.
    pub fn new(directory: Utf8PathBuf, lock_timeout: Duration, history_ttl: Duration) -> Self {
        Self {
            directory,
            lock_timeout,
            history_ttl,
        }
    }

    fn history_path(&self) -> Utf8PathBuf {
        self.directory.join(HISTORY_FILE_NAME)
    }

    fn config_path(&self, run_id: RunUuid) -> Utf8PathBuf {
        self.directory
            .join(RUNS_DIR_NAME)
            .join(format!("{run_id}.config.json"))
    }

    fn tests_path(&self, run_id: RunUuid) -> Utf8PathBuf {
        self.directory
            .join(RUNS_DIR_NAME)
            .join(format!("{run_id}.tests.json"))
    }

    fn lock(&self, path: &Utf8Path) -> Result<FileLock, StorageError> {
        FileLock::acquire(path, self.lock_timeout)
    }

    /// Locks the config of an existing run. Run documents are never deleted, so the existence
    /// check can happen before the lock is taken.
    fn lock_config(&self, run_id: RunUuid) -> Result<(Utf8PathBuf, FileLock), StorageError> {
        let path = self.config_path(run_id);
        if !path.exists() {
            return Err(StorageError::RunNotFound { run_id });
        }
        let lock = self.lock(&path)?;
        Ok((path, lock))
    }

    fn read_config(&self, run_id: RunUuid) -> Result<RunConfig, StorageError> {
        read_json(&self.config_path(run_id))?.ok_or(StorageError::RunNotFound { run_id })
    }

    fn read_tests(&self, run_id: RunUuid) -> Result<Vec<StoredTest>, StorageError> {
        Ok(read_json(&self.tests_path(run_id))?.unwrap_or_default())
    }

    fn read_history(&self) -> Result<HistoryMap, StorageError> {
        Ok(read_json(&self.history_path())?.unwrap_or_default())
    }
}

impl StorageAdapter for FileStorage {
    fn initialize(&self) -> Result<(), StorageError> {
        let runs_dir = self.directory.join(RUNS_DIR_NAME);
        std::fs::create_dir_all(&runs_dir).map_err(|error| StorageError::DirCreate {
            path: runs_dir,
            error,
        })
    }

    fn save_test_run(
        &self,
        info: &TestRunInfo,
        args: &[String],
        history_window: usize,
    ) -> Result<RunUuid, StorageError> {
        let now = Utc::now();
        let new_run = NewRun::new(info, args, history_window, now)?;
        self.initialize()?;

        let stats = {
            let history_path = self.history_path();
            let _lock = self.lock(&history_path)?;
            let mut history = self.read_history()?;

            let before = history.len();
            history.retain(|_, record| !record.is_expired(now, self.history_ttl));
            if history.len() < before {
                debug!(purged = before - history.len(), "purged expired history records");
            }

            let stats: HashMap<_, _> = new_run
                .identities()
                .map(|identity| {
                    let record = history
                        .entry(identity.clone())
                        .or_insert_with(|| HistoryRecord::new(now));
                    (identity.clone(), record.stats())
                })
                .collect();
            write_json(&history_path, &history, "history")?;
            stats
        };

        let (run_id, config, items) = new_run.schedule(&stats);
        let tests: Vec<_> = items
            .into_iter()
            .map(|item| StoredTest {
                item,
                status: TestStatus::Ready,
                report: None,
            })
            .collect();

        // Shards look the run up through its config, so the queue must exist first.
        write_json(&self.tests_path(run_id), &tests, "test queue")?;
        write_json(&self.config_path(run_id), &config, "run configuration")?;
        debug!(%run_id, tests = tests.len(), "created run");
        Ok(run_id)
    }

    fn start_shard(&self, run_id: RunUuid) -> Result<RunConfig, StorageError> {
        let (config_path, _config_lock) = self.lock_config(run_id)?;
        let mut config = self.read_config(run_id)?;

        if let Some(next) = config.status.on_shard_start() {
            if config.status.rearms_failed() {
                let tests_path = self.tests_path(run_id);
                let _tests_lock = self.lock(&tests_path)?;
                let mut tests = self.read_tests(run_id)?;
                let mut rearmed = 0;
                for test in tests.iter_mut().filter(|t| t.status == TestStatus::Failed) {
                    test.status = TestStatus::Ready;
                    rearmed += 1;
                }
                write_json(&tests_path, &tests, "test queue")?;
                debug!(%run_id, rearmed, "re-armed failed tests");
            }
            debug!(%run_id, from = %config.status, to = %next, "run status transition");
            config.status = next;
            config.updated = Utc::now();
            write_json(&config_path, &config, "run configuration")?;
        }

        Ok(config)
    }

    fn get_next_test(
        &self,
        run_id: RunUuid,
        _config: &RunConfig,
    ) -> Result<Option<TestItem>, StorageError> {
        let tests_path = self.tests_path(run_id);
        if !tests_path.exists() {
            return Ok(None);
        }
        let _lock = self.lock(&tests_path)?;
        let mut tests = self.read_tests(run_id)?;

        let Some(test) = tests
            .iter_mut()
            .filter(|t| t.status == TestStatus::Ready)
            .min_by_key(|t| t.item.order)
        else {
            return Ok(None);
        };
        test.status = TestStatus::Ongoing;
        let item = test.item.clone();
        write_json(&tests_path, &tests, "test queue")?;

        debug!(%run_id, order = item.order, identity = %item.identity, "claimed test");
        Ok(Some(item))
    }

    fn record_result(
        &self,
        run_id: RunUuid,
        config: &RunConfig,
        item: &TestItem,
        verdict: TestVerdict,
        result: &TestReportResult,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        let tests_path = self.tests_path(run_id);
        if !tests_path.exists() {
            return Err(StorageError::TestItemNotFound {
                run_id,
                order: item.order,
            });
        }
        let _tests_lock = self.lock(&tests_path)?;
        let mut tests = self.read_tests(run_id)?;
        let Some(test) = tests.iter_mut().find(|t| t.item.order == item.order) else {
            return Err(StorageError::TestItemNotFound {
                run_id,
                order: item.order,
            });
        };
        if test.status != TestStatus::Ongoing {
            return Err(StorageError::TestItemNotStarted {
                run_id,
                order: item.order,
                status: test.status,
            });
        }

        let before = {
            let history_path = self.history_path();
            let _history_lock = self.lock(&history_path)?;
            let mut history = self.read_history()?;
            let before = history
                .entry(item.identity.clone())
                .or_insert_with(|| HistoryRecord::new(now))
                .record(
                    HistoryEntry {
                        duration: result.duration,
                        status: verdict.status(),
                        updated: now,
                    },
                    config.history_window,
                );
            write_json(&history_path, &history, "history")?;
            before
        };

        test.status = verdict.status();
        test.report = Some(before.snapshot(result.title.clone(), result.duration));
        write_json(&tests_path, &tests, "test queue")?;
        debug!(%run_id, order = item.order, ?verdict, "recorded result");
        Ok(())
    }

    fn finish_shard(&self, run_id: RunUuid) -> Result<(), StorageError> {
        let (config_path, _lock) = self.lock_config(run_id)?;
        let mut config = self.read_config(run_id)?;
        config.status = RunStatus::Finished;
        config.updated = Utc::now();
        write_json(&config_path, &config, "run configuration")
    }

    fn get_report_data(&self, run_id: RunUuid) -> Result<RunReport, StorageError> {
        let config = self.read_config(run_id)?;
        let mut tests = self.read_tests(run_id)?;
        tests.sort_by_key(|t| t.item.order);
        let tests = tests
            .into_iter()
            .map(|test| {
                TestReport::new(
                    test.item.file,
                    test.item.position,
                    test.item.project,
                    test.status,
                    test.report,
                )
            })
            .collect();
        Ok(RunReport {
            run_id,
            config,
            tests,
        })
    }

    fn get_history(&self, identity: &TestIdentity) -> Result<Option<HistoryRecord>, StorageError> {
        Ok(self.read_history()?.remove(identity))
    }
}

/// An exclusive advisory lock on `<path>.lock`, released on drop.
#[derive(Debug)]
struct FileLock {
    file: File,
    path: Utf8PathBuf,
}

impl FileLock {
    fn acquire(target: &Utf8Path, timeout: Duration) -> Result<Self, StorageError> {
        let path = Utf8PathBuf::from(format!("{target}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|error| StorageError::FileLock {
                path: path.clone(),
                error,
            })?;

        let start = Instant::now();
        let mut warned = false;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Self { file, path }),
                Err(TryLockError::WouldBlock) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(StorageError::FileLockTimeout { path, timeout });
                    }
                    if !warned && elapsed >= timeout / 2 {
                        warn!(%path, "still waiting for lock held by another shard");
                        warned = true;
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(TryLockError::Error(error)) => {
                    return Err(StorageError::FileLock { path, error });
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(error) = self.file.unlock() {
            debug!(path = %self.path, %error, "failed to release lock");
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, StorageError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(StorageError::FileRead {
                path: path.to_owned(),
                error,
            });
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|error| StorageError::Deserialize {
            what: format!("`{path}`"),
            error,
        })
}

fn write_json<T: Serialize>(
    path: &Utf8Path,
    value: &T,
    what: &'static str,
) -> Result<(), StorageError> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|error| StorageError::Serialize { what, error })?;
    AtomicFile::new(path, OverwriteBehavior::AllowOverwrite)
        .write(|file| file.write_all(&bytes))
        .map_err(|error| StorageError::FileWrite {
            path: path.to_owned(),
            error,
        })
}
