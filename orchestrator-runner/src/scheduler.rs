// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns analyzer output plus history into an ordered work queue.
//!
//! Scheduling is longest-expected-first: each test is weighted by its historical average
//! duration (or its declared timeout when there is no history), boosted by its recent failure
//! rate, and the queue is sorted by descending weight.

use crate::{errors::StorageError, history::HistoryStats};
use camino::Utf8PathBuf;
use orchestrator_metadata::{TestIdentity, TestItem, TestPosition, TestRun};
use std::collections::{HashMap, hash_map::Entry};
use tracing::debug;

/// A discovered test that has not been assigned a place in the queue yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTest {
    /// The source file.
    pub file: Utf8PathBuf,
    /// The in-file position.
    pub position: TestPosition,
    /// The project the test runs under.
    pub project: String,
    /// The declared timeout, in milliseconds.
    pub timeout: u64,
    /// True if this entry is a file-level serial group.
    pub file_group: bool,
    /// The computed identity.
    pub identity: TestIdentity,
}

impl PendingTest {
    fn display_key(&self) -> String {
        format!("[{}] {}:{}", self.project, self.file, self.position)
    }

    /// Returns the scheduling weight of this test.
    ///
    /// `stats` is `None` (or carries a zero EMA) when there is no usable history.
    pub fn weight(&self, stats: Option<&HistoryStats>, window: usize) -> f64 {
        let (ema, fails) = stats.map_or((0.0, 0), |stats| (stats.ema, stats.fails));
        let baseline = if ema > 0.0 { ema } else { self.timeout as f64 };
        if fails > 0 && window > 0 {
            baseline * (fails as f64 / window as f64 + 1.0)
        } else {
            baseline
        }
    }
}

/// Walks a discovered test tree and produces one pending test per (entry, project) pair.
///
/// Fails with [`StorageError::DuplicateTestIdentity`] if two pending tests share an identity.
/// Nothing has been written at this point, so a failure leaves no trace in the store.
pub fn flatten_test_run(test_run: &TestRun) -> Result<Vec<PendingTest>, StorageError> {
    let mut pending: Vec<PendingTest> = Vec::new();
    let mut seen: HashMap<TestIdentity, usize> = HashMap::new();

    for (file, entries) in test_run {
        for (position, entry) in entries {
            let file_group = entry.title == file.as_str();
            for project in &entry.projects {
                let identity =
                    TestIdentity::compute(project, file, &entry.title, &entry.annotations);
                let test = PendingTest {
                    file: file.clone(),
                    position: *position,
                    project: project.clone(),
                    timeout: entry.timeout,
                    file_group,
                    identity,
                };
                match seen.entry(test.identity.clone()) {
                    Entry::Occupied(first) => {
                        return Err(StorageError::DuplicateTestIdentity {
                            identity: test.identity.clone(),
                            first: pending[*first.get()].display_key(),
                            second: test.display_key(),
                        });
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(pending.len());
                    }
                }
                pending.push(test);
            }
        }
    }

    Ok(pending)
}

/// Sorts pending tests by descending weight and assigns 1-based order numbers.
///
/// Tests with equal weight keep their discovery order.
pub fn order_tests(
    pending: Vec<PendingTest>,
    history: &HashMap<TestIdentity, HistoryStats>,
    window: usize,
) -> Vec<TestItem> {
    let mut weighted: Vec<_> = pending
        .into_iter()
        .map(|test| {
            let weight = test.weight(history.get(&test.identity), window);
            (weight, test)
        })
        .collect();
    weighted.sort_by(|(a, _), (b, _)| b.total_cmp(a));

    weighted
        .into_iter()
        .zip(1..)
        .map(|((weight, test), order)| {
            debug!(
                identity = %test.identity,
                order,
                weight,
                "scheduled test"
            );
            TestItem {
                file: test.file,
                position: test.position,
                project: test.project,
                order,
                timeout: test.timeout,
                identity: test.identity,
            }
        })
        .collect()
}
