// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{RunStatus, TestPosition};
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The document printed by the test analyzer: run-level configuration plus every discovered
/// test.
///
/// This is the sole input to run creation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunInfo {
    /// Run-level configuration discovered by the analyzer.
    pub config: TestConfig,

    /// Discovered tests, keyed by file and in-file position.
    pub test_run: TestRun,
}

/// Discovered tests: source file → in-file position → entry.
///
/// Both levels are ordered maps, so flattening a `TestRun` is deterministic.
pub type TestRun = BTreeMap<Utf8PathBuf, BTreeMap<TestPosition, TestEntry>>;

/// A single schedulable entry found by the analyzer.
///
/// An entry is either one test, or a serial group that must run as a unit (in which case
/// `title` is the group's title, and the file path itself for a file-level serial group).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestEntry {
    /// The timeout declared for this entry, in milliseconds.
    pub timeout: u64,

    /// The projects this entry runs under. One test item is created per project.
    pub projects: Vec<String>,

    /// The title of the test or serial group.
    pub title: String,

    /// Annotations declared on the entry.
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// An annotation attached to a test.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Annotation {
    /// The annotation type, for example `id`.
    #[serde(rename = "type")]
    pub kind: String,

    /// The annotation's free-form payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Annotation {
    /// The annotation type that carries an explicit test identity.
    pub const ID_TYPE: &'static str = "id";

    /// Creates a new annotation.
    pub fn new(kind: impl Into<String>, description: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            description,
        }
    }
}

/// Run-level configuration discovered by the analyzer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestConfig {
    /// The maximum number of tests a shard runs concurrently.
    pub workers: usize,

    /// The test framework configuration file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<Utf8PathBuf>,

    /// The projects (environments) tests run under.
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// A logical project or environment that tests run under.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Project {
    /// The project's name.
    pub name: String,

    /// The directory the project writes artifacts to.
    pub output_dir: Utf8PathBuf,
}

/// The persisted configuration of a run.
///
/// Created once per run. `status` and `updated` are the only fields that change afterwards,
/// and only through a storage adapter.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    /// The maximum number of tests a shard runs concurrently.
    pub workers: usize,

    /// The projects tests run under.
    pub projects: Vec<Project>,

    /// The test framework configuration file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<Utf8PathBuf>,

    /// Arguments forwarded verbatim to every engine invocation.
    pub args: Vec<String>,

    /// How many past results are retained per test identity.
    pub history_window: usize,

    /// The current run status.
    pub status: RunStatus,

    /// When the run configuration was last updated.
    pub updated: DateTime<Utc>,
}

impl RunConfig {
    /// Creates the configuration of a freshly created run.
    pub fn new(
        config: TestConfig,
        args: Vec<String>,
        history_window: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let TestConfig {
            workers,
            config_file,
            projects,
        } = config;
        Self {
            workers,
            projects,
            config_file,
            args,
            history_window,
            status: RunStatus::Created,
            updated: now,
        }
    }

    /// Returns the number of tests a shard may run concurrently, which is at least 1.
    pub fn worker_limit(&self) -> usize {
        self.workers.max(1)
    }
}
