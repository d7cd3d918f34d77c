// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{RunConfig, RunUuid, TestPosition, TestStatus};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A denormalized snapshot stored alongside a test item when its result is recorded, so
/// reports can be produced without consulting history.
///
/// The history figures (`ema`, `fails`, `last_successful_run`) describe the test's history as
/// it was before this result was recorded.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReportSnapshot {
    /// The title reported by the engine.
    pub title: String,

    /// The duration of this execution, in milliseconds.
    pub duration: f64,

    /// The exponential moving average of past durations, in milliseconds.
    pub ema: f64,

    /// The number of failures in the history window.
    pub fails: usize,

    /// When the test last passed, if it did within the history window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_run: Option<DateTime<Utc>>,
}

/// The aggregated data of a run, read back from storage.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunReport {
    /// The run identifier.
    pub run_id: RunUuid,

    /// The run configuration.
    pub config: RunConfig,

    /// One entry per test item.
    pub tests: Vec<TestReport>,
}

/// The report of a single test item.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestReport {
    /// The source file containing the test.
    pub file: Utf8PathBuf,

    /// The position of the test within the file.
    pub position: TestPosition,

    /// The project the test ran under.
    pub project: String,

    /// The item's current status.
    pub status: TestStatus,

    /// The duration of the last execution, in milliseconds.
    pub duration: f64,

    /// The average duration before the last execution, in milliseconds.
    pub average_duration: f64,

    /// The title reported by the engine, if the item has a result.
    #[serde(default)]
    pub title: Option<String>,

    /// The number of failures in the history window.
    pub fails: usize,

    /// When the test last passed, if it did within the history window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_run: Option<DateTime<Utc>>,
}

impl TestReport {
    /// Builds a report entry from an item's location, status and optional stored snapshot.
    pub fn new(
        file: Utf8PathBuf,
        position: TestPosition,
        project: String,
        status: TestStatus,
        snapshot: Option<ReportSnapshot>,
    ) -> Self {
        match snapshot {
            Some(snapshot) => Self {
                file,
                position,
                project,
                status,
                duration: snapshot.duration,
                average_duration: snapshot.ema,
                title: Some(snapshot.title),
                fails: snapshot.fails,
                last_successful_run: snapshot.last_successful_run,
            },
            None => Self {
                file,
                position,
                project,
                status,
                duration: 0.0,
                average_duration: 0.0,
                title: None,
                fails: 0,
                last_successful_run: None,
            },
        }
    }
}
