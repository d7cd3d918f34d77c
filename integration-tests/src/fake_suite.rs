// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test suite reported by the `fake-engine` binary.

use camino::Utf8PathBuf;
use orchestrator_metadata::{
    Annotation, Project, TestConfig, TestEntry, TestPosition, TestRun, TestRunInfo,
};

/// Comma-separated list of files whose tests fail.
pub const FAIL_ENV: &str = "FAKE_ENGINE_FAIL";

/// File that every execution appends `<project> <file>:<line>:<column>` to.
pub const LOG_ENV: &str = "FAKE_ENGINE_LOG";

/// How long each execution takes, in milliseconds.
pub const SLEEP_ENV: &str = "FAKE_ENGINE_SLEEP_MS";

/// The number of workers the suite's config asks for.
pub const WORKERS: usize = 3;

/// A test in the suite.
#[derive(Clone, Copy, Debug)]
pub struct FakeTest {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
    pub title: &'static str,
    pub timeout: u64,
    pub projects: &'static [&'static str],
    pub id: Option<&'static str>,
}

pub static PROJECTS: &[&str] = &["chromium", "firefox"];

pub static SUITE: &[FakeTest] = &[
    FakeTest {
        file: "tests/login.spec",
        line: 3,
        column: 5,
        title: "logs in",
        timeout: 30_000,
        projects: PROJECTS,
        id: None,
    },
    FakeTest {
        file: "tests/login.spec",
        line: 18,
        column: 5,
        title: "rejects a bad password",
        timeout: 30_000,
        projects: PROJECTS,
        id: Some("login-bad-password"),
    },
    FakeTest {
        file: "tests/cart.spec",
        line: 7,
        column: 1,
        title: "checkout",
        timeout: 60_000,
        projects: &["chromium"],
        id: None,
    },
    FakeTest {
        file: "tests/cart.spec",
        line: 40,
        column: 1,
        title: "empty cart",
        timeout: 10_000,
        projects: PROJECTS,
        id: None,
    },
    FakeTest {
        file: "tests/search.spec",
        line: 2,
        column: 3,
        title: "search serial group",
        timeout: 90_000,
        projects: &["firefox"],
        id: None,
    },
];

/// Returns the number of items a run of the suite contains, one per test and project.
pub fn item_count() -> usize {
    SUITE.iter().map(|test| test.projects.len()).sum()
}

/// Builds the document printed by `fake-engine list`.
pub fn run_info() -> TestRunInfo {
    let mut test_run = TestRun::new();
    for test in SUITE {
        let entry = TestEntry {
            timeout: test.timeout,
            projects: test.projects.iter().map(|p| (*p).to_owned()).collect(),
            title: test.title.to_owned(),
            annotations: test
                .id
                .map(|id| Annotation::new(Annotation::ID_TYPE, Some(id.to_owned())))
                .into_iter()
                .collect(),
        };
        test_run
            .entry(Utf8PathBuf::from(test.file))
            .or_default()
            .insert(TestPosition::new(test.line, test.column), entry);
    }

    TestRunInfo {
        config: TestConfig {
            workers: WORKERS,
            config_file: None,
            projects: PROJECTS
                .iter()
                .map(|name| Project {
                    name: (*name).to_owned(),
                    output_dir: Utf8PathBuf::from(format!("test-results/{name}")),
                })
                .collect(),
        },
        test_run,
    }
}

/// Looks up a test by its `file:line:column` locator.
pub fn find(locator: &str) -> Option<&'static FakeTest> {
    let (file, position) = locator.split_once(':')?;
    let position: TestPosition = position.parse().ok()?;
    SUITE.iter().find(|test| {
        test.file == file && test.line == position.line && test.column == position.column
    })
}
