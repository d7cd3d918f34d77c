// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A test engine that lists a fixed suite and pretends to run it.
//!
//! Behavior is controlled through the environment variables in
//! [`integration_tests::fake_suite`].

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{bail, eyre},
};
use integration_tests::fake_suite::{self, FAIL_ENV, LOG_ENV, SLEEP_ENV};
use orchestrator_metadata::{AttemptResult, EngineTestStatus, TestReportResult};
use orchestrator_runner::engine::OUTPUT_FILE_ENV;
use std::{io::Write, time::Duration};

#[derive(Debug, Parser)]
enum FakeEngine {
    /// Print the suite as JSON
    List {
        /// Only list tests whose title contains this
        #[arg(long)]
        grep: Option<String>,
    },
    /// Run one test
    Run {
        locator: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        workers: usize,
        #[arg(long)]
        output: Utf8PathBuf,
        #[arg(long)]
        config: Option<Utf8PathBuf>,
        #[arg(long)]
        grep: Option<String>,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    match FakeEngine::parse() {
        FakeEngine::List { grep } => {
            let mut info = fake_suite::run_info();
            if let Some(grep) = grep {
                for entries in info.test_run.values_mut() {
                    entries.retain(|_, entry| entry.title.contains(&grep));
                }
                info.test_run.retain(|_, entries| !entries.is_empty());
            }
            println!("{}", serde_json::to_string(&info)?);
            Ok(())
        }
        FakeEngine::Run {
            locator,
            project,
            workers,
            output,
            ..
        } => {
            if workers != 1 {
                bail!("expected a single worker, got {workers}");
            }
            let test =
                fake_suite::find(&locator).ok_or_else(|| eyre!("unknown test {locator}"))?;
            if !test.projects.contains(&project.as_str()) {
                bail!("{locator} does not run under {project}");
            }

            if let Ok(path) = std::env::var(LOG_ENV) {
                let mut log = fs_err::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                writeln!(log, "{project} {locator}")?;
            }
            let sleep_ms = std::env::var(SLEEP_ENV)
                .ok()
                .and_then(|ms| ms.parse().ok())
                .unwrap_or(0);
            std::thread::sleep(Duration::from_millis(sleep_ms));

            let failing = std::env::var(FAIL_ENV).unwrap_or_default();
            let passed = !failing.split(',').any(|file| file == test.file);
            let status = if passed {
                EngineTestStatus::Passed
            } else {
                EngineTestStatus::Failed
            };
            let duration = (sleep_ms + u64::from(test.line)) as f64;
            let result = TestReportResult {
                status,
                duration,
                title: test.title.to_owned(),
                annotations: Vec::new(),
                error: None,
                tests: vec![AttemptResult {
                    title: test.title.to_owned(),
                    status,
                    duration,
                    retry: 0,
                    annotations: Vec::new(),
                    error: None,
                }],
            };

            let json = serde_json::to_string(&result)?;
            fs_err::create_dir_all(&output)?;
            if let Ok(path) = std::env::var(OUTPUT_FILE_ENV) {
                fs_err::write(path, &json)?;
            }
            println!("{json}");
            std::process::exit(if passed { 0 } else { 1 })
        }
    }
}
