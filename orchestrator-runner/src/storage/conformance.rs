// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Behavior every storage backend must share, instantiated once per backend.

use super::{FileStorage, KeyValueStorage, MemoryKeyValueStore, SqliteStorage, StorageAdapter};
use crate::errors::StorageError;
use camino_tempfile::Utf8TempDir;
use orchestrator_metadata::{
    RunConfig, RunStatus, RunUuid, TestIdentity, TestItem, TestReportResult, TestRunInfo,
    TestStatus,
};
use pretty_assertions::assert_eq;
use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

trait Backend {
    fn new() -> Self;

    /// Opens a new handle on the same store, the way a separate shard process would.
    fn connect_with_ttl(&self, history_ttl: Duration) -> Arc<dyn StorageAdapter>;

    fn connect(&self) -> Arc<dyn StorageAdapter> {
        let storage = self.connect_with_ttl(Duration::ZERO);
        storage.initialize().expect("initialize succeeds");
        storage
    }
}

struct SqliteBackend {
    dir: Utf8TempDir,
}

impl Backend for SqliteBackend {
    fn new() -> Self {
        Self {
            dir: Utf8TempDir::new().unwrap(),
        }
    }

    fn connect_with_ttl(&self, history_ttl: Duration) -> Arc<dyn StorageAdapter> {
        Arc::new(
            SqliteStorage::open(&self.dir.path().join("store.db"), "conformance", history_ttl)
                .unwrap(),
        )
    }
}

struct FileBackend {
    dir: Utf8TempDir,
}

impl Backend for FileBackend {
    fn new() -> Self {
        Self {
            dir: Utf8TempDir::new().unwrap(),
        }
    }

    fn connect_with_ttl(&self, history_ttl: Duration) -> Arc<dyn StorageAdapter> {
        Arc::new(FileStorage::new(
            self.dir.path().join("store"),
            Duration::from_secs(30),
            history_ttl,
        ))
    }
}

struct KeyValueBackend {
    store: Arc<MemoryKeyValueStore>,
}

impl Backend for KeyValueBackend {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryKeyValueStore::new()),
        }
    }

    fn connect_with_ttl(&self, history_ttl: Duration) -> Arc<dyn StorageAdapter> {
        // Handles share one in-memory store.
        Arc::new(KeyValueStorage::new(self.store.clone(), history_ttl))
    }
}

// ---
// Fixtures
// ---

/// Builds a run with one entry per `(file, timeout)` pair, all under project `p`.
fn run_info(tests: &[(&str, u64)]) -> TestRunInfo {
    let test_run = tests
        .iter()
        .map(|(file, timeout)| {
            (
                (*file).to_owned(),
                serde_json::json!({
                    "1:1": { "timeout": timeout, "projects": ["p"], "title": "t" }
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>();
    serde_json::from_value(serde_json::json!({
        "config": {
            "workers": 2,
            "projects": [{ "name": "p", "output-dir": "out/p" }]
        },
        "test-run": test_run,
    }))
    .unwrap()
}

fn identity(file: &str) -> TestIdentity {
    TestIdentity::new(format!("p > {file} > t"))
}

fn engine_result(duration: f64) -> TestReportResult {
    serde_json::from_value(serde_json::json!({
        "status": "passed",
        "duration": duration,
        "title": "t",
    }))
    .unwrap()
}

fn claim_all(
    storage: &dyn StorageAdapter,
    run_id: RunUuid,
    config: &RunConfig,
) -> Vec<TestItem> {
    std::iter::from_fn(|| storage.get_next_test(run_id, config).unwrap()).collect()
}

/// Creates a single-test run, executes it once with `duration`, and returns the run id.
fn execute_once(
    storage: &dyn StorageAdapter,
    file: &str,
    duration: f64,
    passed: bool,
    window: usize,
) -> RunUuid {
    let run_id = storage
        .save_test_run(&run_info(&[(file, 1000)]), &[], window)
        .unwrap();
    let config = storage.start_shard(run_id).unwrap();
    let item = storage.get_next_test(run_id, &config).unwrap().unwrap();
    let result = engine_result(duration);
    if passed {
        storage.finish_test(run_id, &config, &item, &result).unwrap();
    } else {
        storage.fail_test(run_id, &config, &item, &result).unwrap();
    }
    storage.finish_shard(run_id).unwrap();
    run_id
}

// ---
// Conformance tests
// ---

fn initialize_is_idempotent<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    storage.initialize().expect("second initialize succeeds");
    storage
        .save_test_run(&run_info(&[("a.spec", 1000)]), &[], 10)
        .expect("store is usable");
    storage.initialize().expect("initialize on a populated store succeeds");
}

fn unknown_run<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let run_id = RunUuid::new_v4();

    assert!(matches!(
        storage.start_shard(run_id),
        Err(StorageError::RunNotFound { run_id: id }) if id == run_id
    ));
    assert!(matches!(
        storage.finish_shard(run_id),
        Err(StorageError::RunNotFound { .. })
    ));
    assert!(matches!(
        storage.get_report_data(run_id),
        Err(StorageError::RunNotFound { .. })
    ));
}

fn claims_follow_timeout_order<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let run_id = storage
        .save_test_run(
            &run_info(&[("a.spec", 5000), ("b.spec", 20000), ("c.spec", 1000)]),
            &["--headed".to_owned()],
            10,
        )
        .unwrap();

    let config = storage.start_shard(run_id).unwrap();
    assert_eq!(config.status, RunStatus::Run);
    assert_eq!(config.args, vec!["--headed".to_owned()]);
    assert_eq!(config.history_window, 10);

    let claimed: Vec<_> = claim_all(&*storage, run_id, &config)
        .into_iter()
        .map(|item| (item.order, item.timeout))
        .collect();
    assert_eq!(claimed, vec![(1, 20000), (2, 5000), (3, 1000)]);
}

fn duplicate_identity_writes_nothing<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let info: TestRunInfo = serde_json::from_value(serde_json::json!({
        "config": { "workers": 1 },
        "test-run": {
            "a.spec": { "1:1": { "timeout": 1, "projects": ["p"], "title": "a",
                                 "annotations": [{ "type": "id", "description": "same" }] } },
            "b.spec": { "1:1": { "timeout": 1, "projects": ["p"], "title": "b",
                                 "annotations": [{ "type": "id", "description": "same" }] } }
        }
    }))
    .unwrap();

    let err = storage
        .save_test_run(&info, &[], 10)
        .expect_err("duplicate identities are rejected");
    assert!(
        matches!(err, StorageError::DuplicateTestIdentity { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(
        storage.get_history(&TestIdentity::new("p > same")).unwrap(),
        None,
        "no history was created"
    );
}

fn concurrent_claims_are_exclusive<B: Backend>() {
    const TESTS: usize = 24;
    const SHARDS: usize = 6;

    let backend = B::new();
    let storage = backend.connect();
    let files: Vec<_> = (0..TESTS).map(|i| format!("t{i:02}.spec")).collect();
    let tests: Vec<_> = files.iter().map(|f| (f.as_str(), 1000)).collect();
    let run_id = storage.save_test_run(&run_info(&tests), &[], 10).unwrap();
    let config = storage.start_shard(run_id).unwrap();

    let barrier = Arc::new(Barrier::new(SHARDS));
    let mut claimed: Vec<u32> = thread::scope(|s| {
        let handles: Vec<_> = (0..SHARDS)
            .map(|_| {
                let shard = backend.connect();
                let barrier = barrier.clone();
                let config = config.clone();
                s.spawn(move || {
                    barrier.wait();
                    claim_all(&*shard, run_id, &config)
                        .into_iter()
                        .map(|item| item.order)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("shard thread panicked"))
            .collect()
    });

    claimed.sort_unstable();
    let expected: Vec<u32> = (1..=TESTS as u32).collect();
    assert_eq!(claimed, expected, "every item claimed exactly once");
}

fn concurrent_start_transitions_once<B: Backend>() {
    const SHARDS: usize = 6;

    let backend = B::new();
    let storage = backend.connect();
    let run_id = storage
        .save_test_run(&run_info(&[("a.spec", 1000)]), &[], 10)
        .unwrap();

    let barrier = Arc::new(Barrier::new(SHARDS));
    let configs: Vec<RunConfig> = thread::scope(|s| {
        let handles: Vec<_> = (0..SHARDS)
            .map(|_| {
                let shard = backend.connect();
                let barrier = barrier.clone();
                s.spawn(move || {
                    barrier.wait();
                    shard.start_shard(run_id).unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("shard thread panicked"))
            .collect()
    });

    for config in &configs {
        assert_eq!(config.status, RunStatus::Run);
        assert_eq!(
            config.updated, configs[0].updated,
            "a single transition happened"
        );
    }
}

fn finished_run_rearms_failed_tests<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let run_id = storage
        .save_test_run(
            &run_info(&[("a.spec", 3000), ("b.spec", 2000), ("c.spec", 1000)]),
            &[],
            10,
        )
        .unwrap();
    let config = storage.start_shard(run_id).unwrap();
    let items = claim_all(&*storage, run_id, &config);
    assert_eq!(items.len(), 3);

    let result = engine_result(10.0);
    storage.finish_test(run_id, &config, &items[0], &result).unwrap();
    storage.fail_test(run_id, &config, &items[1], &result).unwrap();
    storage.fail_test(run_id, &config, &items[2], &result).unwrap();
    storage.finish_shard(run_id).unwrap();

    let retry = storage.start_shard(run_id).unwrap();
    assert_eq!(retry.status, RunStatus::RepeatRun);

    let rearmed: Vec<_> = claim_all(&*storage, run_id, &retry)
        .into_iter()
        .map(|item| item.order)
        .collect();
    assert_eq!(rearmed, vec![items[1].order, items[2].order]);

    let report = storage.get_report_data(run_id).unwrap();
    let statuses: Vec<_> = report.tests.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![TestStatus::Passed, TestStatus::Ongoing, TestStatus::Ongoing]
    );
}

fn concurrent_restart_rearms_failed_once<B: Backend>() {
    const SHARDS: usize = 6;

    let backend = B::new();
    let storage = backend.connect();
    let run_id = storage
        .save_test_run(
            &run_info(&[("a.spec", 3000), ("b.spec", 2000), ("c.spec", 1000)]),
            &[],
            10,
        )
        .unwrap();
    let config = storage.start_shard(run_id).unwrap();
    let items = claim_all(&*storage, run_id, &config);
    let result = engine_result(10.0);
    storage.finish_test(run_id, &config, &items[0], &result).unwrap();
    storage.fail_test(run_id, &config, &items[1], &result).unwrap();
    storage.fail_test(run_id, &config, &items[2], &result).unwrap();
    storage.finish_shard(run_id).unwrap();

    let barrier = Arc::new(Barrier::new(SHARDS));
    let shards: Vec<(RunConfig, Vec<u32>)> = thread::scope(|s| {
        let handles: Vec<_> = (0..SHARDS)
            .map(|_| {
                let shard = backend.connect();
                let barrier = barrier.clone();
                s.spawn(move || {
                    barrier.wait();
                    let config = shard.start_shard(run_id).unwrap();
                    let claimed = claim_all(&*shard, run_id, &config)
                        .into_iter()
                        .map(|item| item.order)
                        .collect();
                    (config, claimed)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("shard thread panicked"))
            .collect()
    });

    for (config, _) in &shards {
        assert_eq!(config.status, RunStatus::RepeatRun);
        assert_eq!(
            config.updated, shards[0].0.updated,
            "a single transition happened"
        );
    }
    let mut claimed: Vec<u32> = shards
        .into_iter()
        .flat_map(|(_, claimed)| claimed)
        .collect();
    claimed.sort_unstable();
    assert_eq!(
        claimed,
        vec![items[1].order, items[2].order],
        "every failed item re-armed and claimed exactly once"
    );

    let report = storage.get_report_data(run_id).unwrap();
    assert_eq!(report.config.status, RunStatus::RepeatRun);
    let statuses: Vec<_> = report.tests.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![TestStatus::Passed, TestStatus::Ongoing, TestStatus::Ongoing]
    );
}

fn redundant_finish_shard<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let run_id = storage
        .save_test_run(&run_info(&[("a.spec", 1000)]), &[], 10)
        .unwrap();
    storage.start_shard(run_id).unwrap();
    storage.finish_shard(run_id).unwrap();
    storage.finish_shard(run_id).unwrap();
    backend.connect().finish_shard(run_id).unwrap();

    let report = storage.get_report_data(run_id).unwrap();
    assert_eq!(report.config.status, RunStatus::Finished);
}

fn exhausted_queue_returns_none<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let run_id = storage
        .save_test_run(&run_info(&[("a.spec", 1000)]), &[], 10)
        .unwrap();
    let config = storage.start_shard(run_id).unwrap();
    assert!(storage.get_next_test(run_id, &config).unwrap().is_some());
    assert_eq!(storage.get_next_test(run_id, &config).unwrap(), None);
    assert_eq!(storage.get_next_test(run_id, &config).unwrap(), None);
    assert_eq!(
        storage.get_next_test(RunUuid::new_v4(), &config).unwrap(),
        None,
        "claims against an unknown run find nothing"
    );
}

fn unknown_item_is_rejected<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let run_id = storage
        .save_test_run(&run_info(&[("a.spec", 1000)]), &[], 10)
        .unwrap();
    let config = storage.start_shard(run_id).unwrap();
    let mut item = storage.get_next_test(run_id, &config).unwrap().unwrap();
    item.order = 99;

    let err = storage
        .finish_test(run_id, &config, &item, &engine_result(1.0))
        .expect_err("item 99 does not exist");
    assert!(
        matches!(err, StorageError::TestItemNotFound { order: 99, .. }),
        "unexpected error: {err}"
    );
}

fn result_requires_claimed_item<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    let info = run_info(&[("a.spec", 1000)]);
    let run_id = storage.save_test_run(&info, &[], 10).unwrap();
    let config = storage.start_shard(run_id).unwrap();
    let item = storage.get_next_test(run_id, &config).unwrap().unwrap();
    let result = engine_result(1.0);
    storage.finish_test(run_id, &config, &item, &result).unwrap();

    let err = storage
        .fail_test(run_id, &config, &item, &result)
        .expect_err("the item already has a result");
    assert!(
        matches!(
            err,
            StorageError::TestItemNotStarted { status: TestStatus::Passed, order, .. }
                if order == item.order
        ),
        "unexpected error: {err}"
    );

    // The same order in a run whose item was never claimed.
    let unclaimed = storage.save_test_run(&info, &[], 10).unwrap();
    let unclaimed_config = storage.start_shard(unclaimed).unwrap();
    let err = storage
        .finish_test(unclaimed, &unclaimed_config, &item, &result)
        .expect_err("the item is still ready");
    assert!(
        matches!(
            err,
            StorageError::TestItemNotStarted { status: TestStatus::Ready, .. }
        ),
        "unexpected error: {err}"
    );

    let record = storage.get_history(&identity("a.spec")).unwrap().unwrap();
    assert_eq!(record.history.len(), 1, "rejected results leave no history");
    let report = storage.get_report_data(run_id).unwrap();
    assert_eq!(report.tests[0].status, TestStatus::Passed);
    let report = storage.get_report_data(unclaimed).unwrap();
    assert_eq!(report.tests[0].status, TestStatus::Ready);
}

fn ema_converges<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    for _ in 0..3 {
        execute_once(&*storage, "a.spec", 100.0, true, 3);
        let record = storage.get_history(&identity("a.spec")).unwrap().unwrap();
        assert_eq!(record.ema, 100.0);
    }
    let record = storage.get_history(&identity("a.spec")).unwrap().unwrap();
    assert_eq!(record.history.len(), 3);
}

fn history_window_evicts_oldest<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();
    for duration in [1.0, 2.0, 3.0] {
        execute_once(&*storage, "a.spec", duration, true, 2);
    }
    let record = storage.get_history(&identity("a.spec")).unwrap().unwrap();
    let durations: Vec<_> = record.history.iter().map(|e| e.duration).collect();
    assert_eq!(durations, vec![2.0, 3.0]);
}

fn snapshot_reflects_previous_history<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();

    let first = execute_once(&*storage, "a.spec", 100.0, false, 10);
    let report = storage.get_report_data(first).unwrap();
    let test = &report.tests[0];
    assert_eq!(test.status, TestStatus::Failed);
    assert_eq!(test.duration, 100.0);
    assert_eq!(test.average_duration, 0.0);
    assert_eq!(test.fails, 0);
    assert_eq!(test.title.as_deref(), Some("t"));

    let second = execute_once(&*storage, "a.spec", 300.0, true, 10);
    let report = storage.get_report_data(second).unwrap();
    let test = &report.tests[0];
    assert_eq!(test.status, TestStatus::Passed);
    assert_eq!(test.duration, 300.0);
    assert_eq!(test.average_duration, 100.0);
    assert_eq!(test.fails, 1);
    assert_eq!(test.last_successful_run, None);

    let third = execute_once(&*storage, "a.spec", 300.0, true, 10);
    let report = storage.get_report_data(third).unwrap();
    assert!(report.tests[0].last_successful_run.is_some());
}

fn history_drives_ordering<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect();

    // a declares a short timeout but historically runs long.
    let run_id = storage
        .save_test_run(&run_info(&[("a.spec", 1000), ("b.spec", 5000)]), &[], 10)
        .unwrap();
    let config = storage.start_shard(run_id).unwrap();
    for item in claim_all(&*storage, run_id, &config) {
        let duration = if item.file == "a.spec" { 10_000.0 } else { 100.0 };
        storage
            .finish_test(run_id, &config, &item, &engine_result(duration))
            .unwrap();
    }

    let run_id = storage
        .save_test_run(&run_info(&[("a.spec", 1000), ("b.spec", 5000)]), &[], 10)
        .unwrap();
    let config = storage.start_shard(run_id).unwrap();
    let files: Vec<_> = claim_all(&*storage, run_id, &config)
        .into_iter()
        .map(|item| item.file.into_string())
        .collect();
    assert_eq!(files, vec!["a.spec", "b.spec"]);
}

fn expired_history_is_purged<B: Backend>() {
    let backend = B::new();
    let storage = backend.connect_with_ttl(Duration::from_millis(1));
    storage.initialize().unwrap();

    execute_once(&*storage, "old.spec", 10.0, true, 10);
    assert!(storage.get_history(&identity("old.spec")).unwrap().is_some());

    thread::sleep(Duration::from_millis(50));
    storage
        .save_test_run(&run_info(&[("new.spec", 1000)]), &[], 10)
        .unwrap();
    assert_eq!(storage.get_history(&identity("old.spec")).unwrap(), None);
    assert!(
        storage.get_history(&identity("new.spec")).unwrap().is_some(),
        "scheduling creates an empty record"
    );
}

macro_rules! conformance_tests {
    ($($module:ident => $backend:ty),* $(,)?) => {
        $(
            mod $module {
                use super::*;

                conformance_tests!(@tests $backend;
                    initialize_is_idempotent,
                    unknown_run,
                    claims_follow_timeout_order,
                    duplicate_identity_writes_nothing,
                    concurrent_claims_are_exclusive,
                    concurrent_start_transitions_once,
                    finished_run_rearms_failed_tests,
                    concurrent_restart_rearms_failed_once,
                    redundant_finish_shard,
                    exhausted_queue_returns_none,
                    unknown_item_is_rejected,
                    result_requires_claimed_item,
                    ema_converges,
                    history_window_evicts_oldest,
                    snapshot_reflects_previous_history,
                    history_drives_ordering,
                    expired_history_is_purged,
                );
            }
        )*
    };
    (@tests $backend:ty; $($test:ident),* $(,)?) => {
        $(
            #[test]
            fn $test() {
                super::$test::<$backend>();
            }
        )*
    };
}

conformance_tests! {
    sqlite => SqliteBackend,
    file => FileBackend,
    key_value => KeyValueBackend,
}
