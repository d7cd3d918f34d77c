// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage over a key-value store with conditional writes.
//!
//! Key layout:
//!
//! ```text
//! run/<run-id>/config          RunConfig, written last on creation
//! run/<run-id>/item/<order>    the item with its status and report snapshot
//! run/<run-id>/ready/<order>   present while the item is claimable
//! history/<identity>           HistoryRecord
//! ```
//!
//! Order numbers are zero-padded so prefix scans return them ascending. A claim is
//! delete-if-exists on the lowest ready marker: losing the delete means another shard won, and
//! the claimant moves on to the next marker. Record updates are compare-and-swap on the entry
//! version, retried a bounded number of times.

use super::{NewRun, StorageAdapter, TestVerdict};
use crate::{
    errors::StorageError,
    history::{HistoryEntry, HistoryRecord},
};
use chrono::Utc;
use orchestrator_metadata::{
    ReportSnapshot, RunConfig, RunReport, RunStatus, RunUuid, TestIdentity, TestItem,
    TestReport, TestReportResult, TestRunInfo, TestStatus,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{debug, warn};

/// The number of compare-and-swap attempts before a write is reported as conflicting.
pub const MAX_WRITE_ATTEMPTS: usize = 5;

/// The version of a stored value. Every successful write produces a new version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KvVersion(pub u64);

/// A key-value store with per-key conditional writes and ordered prefix scans.
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Returns the value and version stored under `key`.
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, KvVersion)>, StorageError>;

    /// Stores `value` under `key` unconditionally.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Stores `value` if `key` is absent. Returns false if it was present.
    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError>;

    /// Stores `value` if `key` is currently at `version`. Returns false otherwise.
    fn put_if_version(
        &self,
        key: &str,
        value: Vec<u8>,
        version: KvVersion,
    ) -> Result<bool, StorageError>;

    /// Deletes `key`. Returns false if it did not exist.
    fn delete_if_exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Returns every key starting with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// An in-process [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: BTreeMap<String, (Vec<u8>, KvVersion)>,
    next_version: u64,
}

impl MemoryInner {
    fn bump(&mut self) -> KvVersion {
        self.next_version += 1;
        KvVersion(self.next_version)
    }
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, KvVersion)>, StorageError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let version = inner.bump();
        inner.entries.insert(key.to_owned(), (value, version));
        Ok(())
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        let version = inner.bump();
        inner.entries.insert(key.to_owned(), (value, version));
        Ok(true)
    }

    fn put_if_version(
        &self,
        key: &str,
        value: Vec<u8>,
        version: KvVersion,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.entries.get(key) {
            Some((_, current)) if *current == version => {
                let version = inner.bump();
                inner.entries.insert(key.to_owned(), (value, version));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_if_exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.entries.remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, _))| (key.clone(), value.clone()))
            .collect())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, KvVersion)>, StorageError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        (**self).put(key, value)
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError> {
        (**self).put_if_absent(key, value)
    }

    fn put_if_version(
        &self,
        key: &str,
        value: Vec<u8>,
        version: KvVersion,
    ) -> Result<bool, StorageError> {
        (**self).put_if_version(key, value, version)
    }

    fn delete_if_exists(&self, key: &str) -> Result<bool, StorageError> {
        (**self).delete_if_exists(key)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        (**self).scan_prefix(prefix)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
struct StoredItem {
    item: TestItem,
    status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    report: Option<ReportSnapshot>,
}

/// A [`StorageAdapter`] over any [`KeyValueStore`].
#[derive(Debug)]
pub struct KeyValueStorage<S> {
    store: S,
    history_ttl: Duration,
}

impl<S: KeyValueStore> KeyValueStorage<S> {
    /// Creates a new adapter over `store`.
    pub fn new(store: S, history_ttl: Duration) -> Self {
        Self { store, history_ttl }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn config_key(run_id: RunUuid) -> String {
        format!("run/{run_id}/config")
    }

    fn item_key(run_id: RunUuid, order: u32) -> String {
        format!("run/{run_id}/item/{order:010}")
    }

    fn ready_prefix(run_id: RunUuid) -> String {
        format!("run/{run_id}/ready/")
    }

    fn ready_key(run_id: RunUuid, order: u32) -> String {
        format!("run/{run_id}/ready/{order:010}")
    }

    fn history_key(identity: &TestIdentity) -> String {
        format!("history/{identity}")
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.store
            .get(key)?
            .map(|(bytes, _)| decode(key, &bytes))
            .transpose()
    }

    /// Applies `mutate` to the value under `key` with compare-and-swap, retrying on conflict.
    ///
    /// `mutate` returns the replacement value (or `None` to leave the record alone) and an
    /// output passed back to the caller.
    fn update<T, R>(
        &self,
        key: &str,
        mut mutate: impl FnMut(Option<T>) -> Result<(Option<T>, R), StorageError>,
    ) -> Result<R, StorageError>
    where
        T: Serialize + DeserializeOwned,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let (current, version) = match self.store.get(key)? {
                Some((bytes, version)) => (Some(decode(key, &bytes)?), Some(version)),
                None => (None, None),
            };
            let (next, output) = mutate(current)?;
            let Some(next) = next else {
                return Ok(output);
            };
            let bytes = encode(&next)?;
            let written = match version {
                Some(version) => self.store.put_if_version(key, bytes, version)?,
                None => self.store.put_if_absent(key, bytes)?,
            };
            if written {
                return Ok(output);
            }
            warn!(key, attempt, "conditional write lost, retrying");
        }
        Err(StorageError::OptimisticWriteConflict {
            key: key.to_owned(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    /// Puts every failed item of the run back in the queue and returns how many it flipped.
    ///
    /// The ready marker is written before the item flips, so a claimant may find a marker whose
    /// item is still `Failed`. Concurrent callers are harmless: markers are idempotent and each
    /// flip is a compare-and-swap.
    fn rearm_failed(&self, run_id: RunUuid) -> Result<usize, StorageError> {
        let mut rearmed = 0;
        for (key, bytes) in self.store.scan_prefix(&format!("run/{run_id}/item/"))? {
            let stored: StoredItem = decode(&key, &bytes)?;
            if stored.status != TestStatus::Failed {
                continue;
            }
            self.store
                .put(&Self::ready_key(run_id, stored.item.order), Vec::new())?;
            let flipped = self.update(&key, |current: Option<StoredItem>| {
                Ok(match current {
                    Some(mut item) if item.status == TestStatus::Failed => {
                        item.status = TestStatus::Ready;
                        (Some(item), true)
                    }
                    _ => (None, false),
                })
            })?;
            if flipped {
                rearmed += 1;
            }
        }
        Ok(rearmed)
    }
}

impl<S: KeyValueStore> StorageAdapter for KeyValueStorage<S> {
    fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn save_test_run(
        &self,
        info: &TestRunInfo,
        args: &[String],
        history_window: usize,
    ) -> Result<RunUuid, StorageError> {
        let now = Utc::now();
        let new_run = NewRun::new(info, args, history_window, now)?;

        if !self.history_ttl.is_zero() {
            for (key, bytes) in self.store.scan_prefix("history/")? {
                let record: HistoryRecord = decode(&key, &bytes)?;
                if record.is_expired(now, self.history_ttl) {
                    self.store.delete_if_exists(&key)?;
                    debug!(key, "purged expired history record");
                }
            }
        }

        let mut stats = HashMap::new();
        for identity in new_run.identities() {
            let key = Self::history_key(identity);
            let record = self.update(&key, |current: Option<HistoryRecord>| {
                Ok(match current {
                    Some(record) => (None, record),
                    None => {
                        let record = HistoryRecord::new(now);
                        (Some(record.clone()), record)
                    }
                })
            })?;
            stats.insert(identity.clone(), record.stats());
        }

        let (run_id, config, items) = new_run.schedule(&stats);
        for item in &items {
            let stored = StoredItem {
                item: item.clone(),
                status: TestStatus::Ready,
                report: None,
            };
            self.store
                .put(&Self::item_key(run_id, item.order), encode(&stored)?)?;
            self.store
                .put(&Self::ready_key(run_id, item.order), Vec::new())?;
        }
        // The run becomes visible once its config exists.
        self.store.put(&Self::config_key(run_id), encode(&config)?)?;

        debug!(%run_id, tests = items.len(), "created run");
        Ok(run_id)
    }

    fn start_shard(&self, run_id: RunUuid) -> Result<RunConfig, StorageError> {
        self.update(&Self::config_key(run_id), |current| {
            let Some(mut config): Option<RunConfig> = current else {
                return Err(StorageError::RunNotFound { run_id });
            };
            let Some(next) = config.status.on_shard_start() else {
                return Ok((None, config));
            };
            // Failed items are queued again before the status flips: a shard that observes
            // `RepeatRun` must find them.
            if config.status.rearms_failed() {
                let rearmed = self.rearm_failed(run_id)?;
                debug!(%run_id, rearmed, "re-armed failed tests");
            }
            config.status = next;
            config.updated = Utc::now();
            Ok((Some(config.clone()), config))
        })
    }

    fn get_next_test(
        &self,
        run_id: RunUuid,
        _config: &RunConfig,
    ) -> Result<Option<TestItem>, StorageError> {
        for (ready_key, _) in self.store.scan_prefix(&Self::ready_prefix(run_id))? {
            if !self.store.delete_if_exists(&ready_key)? {
                // Another shard claimed it first.
                continue;
            }
            let Some(order) = ready_key
                .rsplit('/')
                .next()
                .and_then(|order| order.parse::<u32>().ok())
            else {
                continue;
            };
            let item_key = Self::item_key(run_id, order);
            let claimed = self.update(&item_key, |current: Option<StoredItem>| {
                let Some(mut stored) = current else {
                    return Err(StorageError::TestItemNotFound { run_id, order });
                };
                match stored.status {
                    // `Failed` with a marker is an item being re-armed.
                    TestStatus::Ready | TestStatus::Failed => {
                        stored.status = TestStatus::Ongoing;
                        let item = stored.item.clone();
                        Ok((Some(stored), Some(item)))
                    }
                    TestStatus::Ongoing | TestStatus::Passed => Ok((None, None)),
                }
            })?;
            match claimed {
                Some(item) => {
                    debug!(%run_id, order, identity = %item.identity, "claimed test");
                    return Ok(Some(item));
                }
                None => debug!(%run_id, order, "skipped stale ready marker"),
            }
        }
        Ok(None)
    }

    fn record_result(
        &self,
        run_id: RunUuid,
        config: &RunConfig,
        item: &TestItem,
        verdict: TestVerdict,
        result: &TestReportResult,
    ) -> Result<(), StorageError> {
        let item_key = Self::item_key(run_id, item.order);
        let Some(current) = self.read::<StoredItem>(&item_key)? else {
            return Err(StorageError::TestItemNotFound {
                run_id,
                order: item.order,
            });
        };
        if current.status != TestStatus::Ongoing {
            return Err(StorageError::TestItemNotStarted {
                run_id,
                order: item.order,
                status: current.status,
            });
        }

        let now = Utc::now();
        let history_key = Self::history_key(&item.identity);
        let before = self.update(&history_key, |current: Option<HistoryRecord>| {
            let mut record = current.unwrap_or_else(|| HistoryRecord::new(now));
            let before = record.record(
                HistoryEntry {
                    duration: result.duration,
                    status: verdict.status(),
                    updated: now,
                },
                config.history_window,
            );
            Ok((Some(record), before))
        })?;

        let snapshot = before.snapshot(result.title.clone(), result.duration);
        self.update(&item_key, |current: Option<StoredItem>| {
            let Some(mut stored) = current else {
                return Err(StorageError::TestItemNotFound {
                    run_id,
                    order: item.order,
                });
            };
            if stored.status != TestStatus::Ongoing {
                return Err(StorageError::TestItemNotStarted {
                    run_id,
                    order: item.order,
                    status: stored.status,
                });
            }
            stored.status = verdict.status();
            stored.report = Some(snapshot.clone());
            Ok((Some(stored), ()))
        })?;
        debug!(%run_id, order = item.order, ?verdict, "recorded result");
        Ok(())
    }

    fn finish_shard(&self, run_id: RunUuid) -> Result<(), StorageError> {
        self.update(&Self::config_key(run_id), |current| {
            let Some(mut config): Option<RunConfig> = current else {
                return Err(StorageError::RunNotFound { run_id });
            };
            config.status = RunStatus::Finished;
            config.updated = Utc::now();
            Ok((Some(config), ()))
        })
    }

    fn get_report_data(&self, run_id: RunUuid) -> Result<RunReport, StorageError> {
        let config: RunConfig = self
            .read(&Self::config_key(run_id))?
            .ok_or(StorageError::RunNotFound { run_id })?;
        let tests = self
            .store
            .scan_prefix(&format!("run/{run_id}/item/"))?
            .into_iter()
            .map(|(key, bytes)| {
                let stored: StoredItem = decode(&key, &bytes)?;
                Ok(TestReport::new(
                    stored.item.file,
                    stored.item.position,
                    stored.item.project,
                    stored.status,
                    stored.report,
                ))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        Ok(RunReport {
            run_id,
            config,
            tests,
        })
    }

    fn get_history(&self, identity: &TestIdentity) -> Result<Option<HistoryRecord>, StorageError> {
        self.read(&Self::history_key(identity))
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|error| StorageError::Deserialize {
        what: format!("`{key}`"),
        error,
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|error| StorageError::Serialize {
        what: "key-value record",
        error,
    })
}
