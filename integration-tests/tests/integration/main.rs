// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests that drive the test-orchestrator binary against the `fake-engine` binary.
//!
//! The orchestrator is invoked through `test-orchestrator-dup`, a copy of its main.rs built in
//! this package, because `CARGO_BIN_EXE_*` is only set for binaries of the package under test.

use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;
use indoc::formatdoc;
use integration_tests::{
    fake_suite::{self, FAIL_ENV, LOG_ENV, SLEEP_ENV},
    orchestrator_cli::OrchestratorCli,
};
use itertools::Itertools;
use orchestrator_metadata::{OrchestratorExitCode, RunReport, RunStatus, RunUuid, TestStatus};
use pretty_assertions::assert_eq;
use test_case::test_case;

const ORCHESTRATOR: &str = env!("CARGO_BIN_EXE_test-orchestrator-dup");
const FAKE_ENGINE: &str = env!("CARGO_BIN_EXE_fake-engine");

#[derive(Clone, Copy, Debug)]
enum Backend {
    File,
    Sqlite,
}

/// A temporary directory holding the config, the store and the engine's execution log.
struct TempRun {
    dir: Utf8TempDir,
}

impl TempRun {
    fn new(backend: Backend) -> Self {
        let dir = Utf8TempDir::new().unwrap();
        let storage = match backend {
            Backend::File => format!(
                "kind = \"file\"\ndirectory = '{}'",
                dir.path().join("store")
            ),
            Backend::Sqlite => format!(
                "kind = \"sqlite\"\npath = '{}'",
                dir.path().join("orchestrator.db")
            ),
        };
        std::fs::write(
            dir.path().join("orchestrator.toml"),
            formatdoc! {"
                [engine]
                program = '{FAKE_ENGINE}'

                [storage]
                {storage}
            "},
        )
        .unwrap();

        let run = Self { dir };
        run.cli().arg("init").output();
        run
    }

    fn log_path(&self) -> Utf8PathBuf {
        self.dir.path().join("engine.log")
    }

    fn cli(&self) -> OrchestratorCli {
        let mut cli = OrchestratorCli::new(ORCHESTRATOR);
        cli.args([
            "--config-file",
            self.dir.path().join("orchestrator.toml").as_str(),
        ])
        .env(LOG_ENV, self.log_path().as_str());
        cli
    }

    fn create(&self, engine_args: &[&str]) -> RunUuid {
        let output = self
            .cli()
            .arg("create")
            .arg("--")
            .args(engine_args.iter().copied())
            .output();
        output
            .stdout_as_str()
            .trim()
            .parse()
            .unwrap_or_else(|err| panic!("create prints the run id ({err}):\n{output}"))
    }

    fn shard(&self, run_id: RunUuid, index: usize) -> OrchestratorCli {
        let mut cli = self.cli();
        cli.args([
            "run".to_owned(),
            run_id.to_string(),
            "-o".to_owned(),
            self.dir.path().join(format!("out-{index}")).into_string(),
        ]);
        cli
    }

    fn report(&self, run_id: RunUuid) -> RunReport {
        self.cli()
            .args(["report", &run_id.to_string(), "--format", "json"])
            .output()
            .decode_report_json()
            .unwrap()
    }

    /// Returns the executions recorded by the engine, sorted, and clears the log.
    fn take_executions(&self) -> Vec<String> {
        let log = std::fs::read_to_string(self.log_path()).unwrap_or_default();
        std::fs::remove_file(self.log_path()).ok();
        log.lines().map(str::to_owned).sorted().collect()
    }
}

fn locators(report: &RunReport) -> Vec<(String, u32)> {
    report
        .tests
        .iter()
        .map(|test| (test.file.to_string(), test.position.line))
        .collect()
}

#[test_case(Backend::File ; "file")]
#[test_case(Backend::Sqlite ; "sqlite")]
fn two_shards_split_the_run(backend: Backend) {
    let run = TempRun::new(backend);
    let run_id = run.create(&[]);

    let report = run.report(run_id);
    assert_eq!(report.config.status, RunStatus::Created);
    assert_eq!(report.config.workers, fake_suite::WORKERS);
    assert_eq!(report.tests.len(), fake_suite::item_count());
    assert!(report.tests.iter().all(|t| t.status == TestStatus::Ready));
    // No history yet, so the longest timeout goes first.
    assert_eq!(
        locators(&report),
        [
            ("tests/search.spec", 2),
            ("tests/cart.spec", 7),
            ("tests/login.spec", 3),
            ("tests/login.spec", 3),
            ("tests/login.spec", 18),
            ("tests/login.spec", 18),
            ("tests/cart.spec", 40),
            ("tests/cart.spec", 40),
        ]
        .map(|(file, line)| (file.to_owned(), line))
    );

    let shards: Vec<_> = (0..2)
        .map(|index| {
            run.shard(run_id, index)
                .env(SLEEP_ENV, "200")
                .env(FAIL_ENV, "tests/cart.spec")
                .spawn()
        })
        .collect();
    let outputs: Vec<_> = shards.into_iter().map(|shard| shard.wait()).collect();

    let executions = run.take_executions();
    assert_eq!(
        executions.len(),
        fake_suite::item_count(),
        "every item runs exactly once: {executions:#?}"
    );
    assert_eq!(
        executions.iter().dedup().count(),
        executions.len(),
        "no item ran twice: {executions:#?}"
    );

    let combined = outputs.iter().map(|o| o.stdout_as_str()).join("\n");
    assert!(
        combined.contains("✗ [chromium] tests/cart.spec:7:1"),
        "{combined}"
    );
    assert!(
        combined.contains("✓ [firefox] tests/search.spec:2:3"),
        "{combined}"
    );

    let report = run.report(run_id);
    assert_eq!(report.config.status, RunStatus::Finished);
    for test in &report.tests {
        let expected = if test.file == "tests/cart.spec" {
            TestStatus::Failed
        } else {
            TestStatus::Passed
        };
        assert_eq!(test.status, expected, "{test:?}");
    }
}

#[test_case(Backend::File ; "file")]
#[test_case(Backend::Sqlite ; "sqlite")]
fn rerun_executes_only_failures(backend: Backend) {
    let run = TempRun::new(backend);
    let run_id = run.create(&[]);

    run.shard(run_id, 0)
        .env(FAIL_ENV, "tests/login.spec")
        .output();
    assert_eq!(run.take_executions().len(), fake_suite::item_count());

    // The run is finished, so a new shard re-arms the failed items.
    run.shard(run_id, 0).output();
    assert_eq!(
        run.take_executions(),
        [
            "chromium tests/login.spec:18:5",
            "chromium tests/login.spec:3:5",
            "firefox tests/login.spec:18:5",
            "firefox tests/login.spec:3:5",
        ]
    );

    let report = run.report(run_id);
    assert_eq!(report.config.status, RunStatus::Finished);
    assert!(
        report.tests.iter().all(|t| t.status == TestStatus::Passed),
        "{report:#?}"
    );
}

#[test_case("1" ; "one")]
#[test_case("true" ; "true")]
#[test_case("yes" ; "yes")]
#[test_case("0" ; "zero")]
fn hide_progress_env_accepts_boolish_values(value: &str) {
    let run = TempRun::new(Backend::File);
    let run_id = run.create(&[]);

    let output = run
        .shard(run_id, 0)
        .env("ORCHESTRATOR_HIDE_PROGRESS", value)
        .unchecked(true)
        .output();
    assert_eq!(
        output.exit_status.code(),
        Some(OrchestratorExitCode::OK),
        "{output}"
    );
    assert_eq!(run.take_executions().len(), fake_suite::item_count());
}

#[test]
fn history_orders_the_next_run() {
    let run = TempRun::new(Backend::File);
    let first = run.create(&[]);
    run.shard(first, 0).output();

    // The engine reports each test's line number as its duration.
    let second = run.create(&[]);
    assert_eq!(
        locators(&run.report(second)),
        [
            ("tests/cart.spec", 40),
            ("tests/cart.spec", 40),
            ("tests/login.spec", 18),
            ("tests/login.spec", 18),
            ("tests/cart.spec", 7),
            ("tests/login.spec", 3),
            ("tests/login.spec", 3),
            ("tests/search.spec", 2),
        ]
        .map(|(file, line)| (file.to_owned(), line))
    );
}

#[test]
fn create_forwards_engine_args() {
    let run = TempRun::new(Backend::Sqlite);
    let run_id = run.create(&["--grep", "log"]);

    let report = run.report(run_id);
    assert_eq!(report.config.args, ["--grep", "log"]);
    assert_eq!(
        report
            .tests
            .iter()
            .map(|t| t.file.as_str())
            .dedup()
            .collect::<Vec<_>>(),
        ["tests/login.spec"]
    );

    // Executions see the same arguments.
    run.shard(run_id, 0).output();
    assert_eq!(run.take_executions().len(), 2);
}

#[test]
fn markdown_report_goes_to_step_summary() {
    let run = TempRun::new(Backend::File);
    let run_id = run.create(&[]);
    run.shard(run_id, 0).env(FAIL_ENV, "tests/search.spec").output();

    let summary = run.dir.path().join("step-summary.md");
    let output = run
        .cli()
        .args(["report", &run_id.to_string(), "--format", "markdown"])
        .env("GITHUB_STEP_SUMMARY", summary.as_str())
        .output();
    assert_eq!(output.stdout_as_str(), "", "nothing is printed");

    let markdown = std::fs::read_to_string(&summary).unwrap();
    assert!(markdown.contains("## 🏃 Test run summary"), "{markdown}");
    assert!(markdown.contains(&run_id.to_string()), "{markdown}");
}

#[test]
fn unknown_run_exit_code() {
    let run = TempRun::new(Backend::Sqlite);
    let output = run
        .cli()
        .args(["report", &RunUuid::new_v4().to_string()])
        .unchecked(true)
        .output();
    assert_eq!(
        output.exit_status.code(),
        Some(OrchestratorExitCode::RUN_NOT_FOUND),
        "{output}"
    );
    assert!(output.stderr_as_str().contains("not found"), "{output}");
}

#[test]
fn failing_discovery_exit_code() {
    let run = TempRun::new(Backend::File);
    let output = run
        .cli()
        .args(["create", "--", "--no-such-flag"])
        .unchecked(true)
        .output();
    assert_eq!(
        output.exit_status.code(),
        Some(OrchestratorExitCode::TEST_LIST_CREATION_FAILED),
        "{output}"
    );
}
