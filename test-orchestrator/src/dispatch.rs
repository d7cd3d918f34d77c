// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line parsing and command routing.

use crate::{
    ExpectedError, Result,
    output::{OutputContext, OutputOpts, OutputWriter},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use orchestrator_metadata::RunUuid;
use orchestrator_runner::{
    analyzer::discover_tests,
    config::{ConfigOverrides, OrchestratorConfig, StorageKind, StorageOverrides},
    engine::CommandEngine,
    report::{ReportFormat, ReportWriter, STEP_SUMMARY_ENV},
    reporter::ShardReporterBuilder,
    runner::{DEFAULT_OUTPUT_DIR, ShardRunnerBuilder},
    storage::StorageAdapter,
};
use std::{io::Write, sync::Arc, time::Duration};
use tracing::{debug, info};

/// Orchestrates test runs sharded across machines.
///
/// A run is created once with `create`, then executed by any number of `run` shards pointed
/// at the same storage. Shards claim tests from a shared queue ordered longest-first, so they
/// finish at about the same time.
#[derive(Debug, Parser)]
#[command(
    name = "test-orchestrator",
    version,
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct OrchestratorApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(subcommand)]
    command: Command,
}

impl OrchestratorApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app.
    ///
    /// Returns the exit code.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        match self.command {
            Command::Init { storage } => {
                let base = BaseApp::new(&self.config_opts, storage.into_overrides())?;
                let adapter = base.open_storage()?;
                adapter.initialize()?;
                info!("storage initialized: {}", base.storage_description()?);
                Ok(0)
            }
            Command::Create(opts) => {
                let overrides = ConfigOverrides {
                    history_window: opts.history_window.map(|window| window as usize),
                    engine_program: opts.engine.engine_program,
                    storage: opts.storage.into(),
                };
                let base = BaseApp::new(&self.config_opts, overrides)?;
                base.exec_create(&opts.args, output_writer)
            }
            Command::Run(opts) => {
                let overrides = ConfigOverrides {
                    history_window: None,
                    engine_program: opts.engine.engine_program,
                    storage: opts.storage.into(),
                };
                let base = BaseApp::new(&self.config_opts, overrides)?;
                base.exec_run(
                    opts.run_id,
                    &opts.output_dir,
                    opts.hide_progress,
                    output,
                    output_writer,
                )
            }
            Command::Report(opts) => {
                let base = BaseApp::new(&self.config_opts, opts.storage.into_overrides())?;
                base.exec_report(opts.run_id, opts.format.into(), output, output_writer)
            }
        }
    }
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Config file [default: .config/orchestrator.toml]
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "ORCHESTRATOR_CONFIG_FILE"
    )]
    config_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the tables, directories or indexes used by a storage backend
    ///
    /// Safe to run against storage that is already initialized.
    Init {
        #[clap(flatten)]
        storage: StorageOpts,
    },

    /// Discover tests and persist a new run; prints the run ID
    ///
    /// Arguments after `--` are forwarded to the engine, both for discovery and for every
    /// execution of the run.
    Create(CreateOpts),

    /// Start a shard of a run, executing tests until none are left
    ///
    /// Running a shard against a finished run re-executes its failed tests.
    Run(RunOpts),

    /// Print the report of a run
    Report(ReportOpts),
}

#[derive(Debug, Args)]
struct CreateOpts {
    #[clap(flatten)]
    storage: StorageOpts,

    #[clap(flatten)]
    engine: EngineOpts,

    /// Number of past executions kept per test [default: from config]
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    history_window: Option<u32>,

    /// Arguments forwarded to the test engine
    #[arg(last = true, value_name = "ENGINE_ARGS")]
    args: Vec<String>,
}

#[derive(Debug, Args)]
struct RunOpts {
    /// The run ID printed by `create`
    run_id: RunUuid,

    #[clap(flatten)]
    storage: StorageOpts,

    #[clap(flatten)]
    engine: EngineOpts,

    /// Directory for engine artifacts; deleted when the shard starts
    #[arg(
        long = "output",
        short = 'o',
        value_name = "DIR",
        default_value = DEFAULT_OUTPUT_DIR,
        env = "ORCHESTRATOR_OUTPUT_DIR"
    )]
    output_dir: Utf8PathBuf,

    /// Print finished tests only, without spinners for running ones
    #[arg(long, env = "ORCHESTRATOR_HIDE_PROGRESS", value_parser = BoolishValueParser::new())]
    hide_progress: bool,
}

#[derive(Debug, Args)]
struct ReportOpts {
    /// The run ID printed by `create`
    run_id: RunUuid,

    #[clap(flatten)]
    storage: StorageOpts,

    /// Output format
    ///
    /// `markdown` is appended to the file named by GITHUB_STEP_SUMMARY when that variable is
    /// set, and printed otherwise.
    #[arg(long, value_enum, default_value_t, value_name = "FORMAT")]
    format: ReportFormatOpt,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Engine options")]
struct EngineOpts {
    /// The test engine program [default: from config]
    #[arg(long, value_name = "PROGRAM", env = "ORCHESTRATOR_ENGINE")]
    engine_program: Option<String>,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Storage options")]
struct StorageOpts {
    /// Storage backend [default: from config]
    #[arg(long = "storage", value_enum, value_name = "KIND", env = "ORCHESTRATOR_STORAGE")]
    kind: Option<StorageKindOpt>,

    /// SQLite database file (sqlite backend)
    #[arg(long, value_name = "PATH", env = "ORCHESTRATOR_STORAGE_PATH")]
    path: Option<Utf8PathBuf>,

    /// Storage directory (file backend)
    #[arg(long, value_name = "DIR", env = "ORCHESTRATOR_STORAGE_DIRECTORY")]
    directory: Option<Utf8PathBuf>,

    /// Table name prefix (sqlite backend)
    #[arg(long, value_name = "PREFIX", env = "ORCHESTRATOR_TABLE_PREFIX")]
    table_prefix: Option<String>,

    /// How long to wait for a lock held by another shard (file backend)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    lock_timeout: Option<Duration>,
}

impl StorageOpts {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            storage: self.into(),
            ..Default::default()
        }
    }
}

impl From<StorageOpts> for StorageOverrides {
    fn from(opts: StorageOpts) -> Self {
        Self {
            kind: opts.kind.map(Into::into),
            path: opts.path,
            directory: opts.directory,
            table_prefix: opts.table_prefix,
            lock_timeout: opts.lock_timeout,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StorageKindOpt {
    /// A SQLite database file
    Sqlite,
    /// A directory of JSON documents guarded by file locks
    File,
}

impl From<StorageKindOpt> for StorageKind {
    fn from(kind: StorageKindOpt) -> Self {
        match kind {
            StorageKindOpt::Sqlite => Self::Sqlite,
            StorageKindOpt::File => Self::File,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum ReportFormatOpt {
    /// Colored text
    #[default]
    Human,
    /// The raw report as JSON
    Json,
    /// A Markdown summary table
    Markdown,
}

impl From<ReportFormatOpt> for ReportFormat {
    fn from(format: ReportFormatOpt) -> Self {
        match format {
            ReportFormatOpt::Human => Self::Human,
            ReportFormatOpt::Json => Self::Json,
            ReportFormatOpt::Markdown => Self::Markdown,
        }
    }
}

/// Configuration shared by every command.
struct BaseApp {
    config: OrchestratorConfig,
}

impl BaseApp {
    fn new(config_opts: &ConfigOpts, overrides: ConfigOverrides) -> Result<Self> {
        let mut config = OrchestratorConfig::from_sources(
            Utf8Path::new("."),
            config_opts.config_file.as_deref(),
        )?;
        config.apply_overrides(overrides);
        Ok(Self { config })
    }

    fn storage_description(&self) -> Result<String> {
        Ok(self.config.storage().to_options()?.to_string())
    }

    fn open_storage(&self) -> Result<Arc<dyn StorageAdapter>> {
        let options = self.config.storage().to_options()?;
        debug!(storage = %options, "opening storage");
        Ok(options.open(self.config.history_ttl())?)
    }

    fn exec_create(&self, args: &[String], output_writer: &mut OutputWriter) -> Result<i32> {
        let command = self.config.engine().command();
        let info = discover_tests(&command, args)?;
        let storage = self.open_storage()?;
        let run_id = storage.save_test_run(&info, args, self.config.history_window())?;
        info!("created run {run_id}");

        let mut writer = output_writer.stdout_writer();
        writeln!(writer, "{run_id}").map_err(ExpectedError::write_output)?;
        writer.flush().map_err(ExpectedError::write_output)?;
        Ok(0)
    }

    fn exec_run(
        &self,
        run_id: RunUuid,
        output_dir: &Utf8Path,
        hide_progress: bool,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let storage = self.open_storage()?;
        let engine = Arc::new(CommandEngine::new(self.config.engine().command()));
        let runner = ShardRunnerBuilder::default()
            .set_output_dir(output_dir)
            .build(run_id, storage, engine)?;

        let mut reporter = ShardReporterBuilder::default()
            .set_colorize(output.colorize_stdout())
            .set_hide_progress(hide_progress || output.verbose)
            .build(output_writer.reporter_output());

        let mut write_error = None;
        runner.execute(|event| {
            if write_error.is_none() {
                if let Err(err) = reporter.report_event(event) {
                    write_error = Some(err);
                }
            }
        })?;
        if let Some(err) = write_error {
            return Err(ExpectedError::write_output(err));
        }

        // Failed tests are recorded in the store, not reported through the exit code.
        Ok(0)
    }

    fn exec_report(
        &self,
        run_id: RunUuid,
        format: ReportFormat,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let storage = self.open_storage()?;
        let report = storage.get_report_data(run_id)?;
        debug!(%run_id, %format, tests = report.tests.len(), "loaded report data");

        if format == ReportFormat::Markdown {
            if let Some(path) = std::env::var_os(STEP_SUMMARY_ENV).filter(|p| !p.is_empty()) {
                let path = Utf8PathBuf::from(path.to_string_lossy().into_owned());
                ReportWriter::append_step_summary(&report, &path)?;
                info!("appended report to `{path}`");
                return Ok(0);
            }
        }

        ReportWriter::new(format, output.colorize_stdout())
            .write(&report, output_writer.stdout_writer())?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use test_case::test_case;

    #[test]
    fn verify_app() {
        OrchestratorApp::command().debug_assert();
    }

    #[test_case(&["test-orchestrator", "init", "--storage", "sqlite", "--path", "runs.db"] ; "init sqlite")]
    #[test_case(&["test-orchestrator", "init", "--storage", "file", "--directory", "store"] ; "init file")]
    #[test_case(&["test-orchestrator", "create", "--storage", "file", "--directory", "store", "--", "--grep", "@smoke"] ; "create with engine args")]
    #[test_case(&["test-orchestrator", "create", "--history-window", "5"] ; "create with window")]
    #[test_case(&["test-orchestrator", "run", "0190b4a8-6d3c-7c8e-9f00-000000000001", "-o", "out"] ; "run")]
    #[test_case(&["test-orchestrator", "--color", "never", "report", "0190b4a8-6d3c-7c8e-9f00-000000000001", "--format", "markdown"] ; "report")]
    fn parses(args: &[&str]) {
        if let Err(err) = OrchestratorApp::try_parse_from(args) {
            panic!("{args:?} failed to parse: {err}");
        }
    }

    #[test_case(&["test-orchestrator", "run"] ; "run without id")]
    #[test_case(&["test-orchestrator", "run", "not-a-uuid"] ; "run with bad id")]
    #[test_case(&["test-orchestrator", "init", "--storage", "dynamo"] ; "unknown storage")]
    #[test_case(&["test-orchestrator", "create", "--history-window", "0"] ; "zero window")]
    #[test_case(&["test-orchestrator", "report", "0190b4a8-6d3c-7c8e-9f00-000000000001", "--format", "gha"] ; "unknown format")]
    fn rejects(args: &[&str]) {
        assert!(
            OrchestratorApp::try_parse_from(args).is_err(),
            "{args:?} should not parse"
        );
    }

    #[test]
    fn create_forwards_trailing_args() {
        let app = OrchestratorApp::try_parse_from([
            "test-orchestrator",
            "create",
            "--",
            "--grep",
            "@smoke",
        ])
        .unwrap();
        match app.command {
            Command::Create(opts) => assert_eq!(opts.args, ["--grep", "@smoke"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::*;
        use crate::output::Color;
        use camino_tempfile::Utf8TempDir;
        use indoc::formatdoc;
        use orchestrator_metadata::{RunReport, RunStatus, TestStatus};

        // Lists two tests and fails the one in `b.spec`.
        const ENGINE: &str = r#"
            case "$1" in
                list) printf '%s' '{"config":{"workers":2},"test-run":{"a.spec":{"1:1":{"timeout":1000,"projects":["p"],"title":"a"}},"b.spec":{"2:1":{"timeout":2000,"projects":["p"],"title":"b"}}}}' ;;
                run) case "$2" in
                    b.spec*) printf '{"status":"failed","duration":20,"title":"b"}'; exit 1 ;;
                    *) printf '{"status":"passed","duration":10,"title":"a"}' ;;
                esac ;;
            esac
        "#;

        fn exec(dir: &Utf8TempDir, args: &[&str]) -> (Result<i32>, OutputWriter) {
            let config_file = dir.path().join("orchestrator.toml");
            let store = dir.path().join("store");
            let mut full_args = vec![
                "test-orchestrator",
                "--config-file",
                config_file.as_str(),
                "--color",
                "never",
            ];
            full_args.extend_from_slice(args);
            full_args.extend(["--storage", "file", "--directory", store.as_str()]);
            let app = OrchestratorApp::try_parse_from(full_args).unwrap();
            let output = OutputContext {
                verbose: false,
                color: Color::Never,
            };
            let mut writer = OutputWriter::Test {
                stdout: Vec::new(),
                reporter: Vec::new(),
            };
            let result = app.exec(output, &mut writer);
            (result, writer)
        }

        fn stdout(writer: &OutputWriter) -> String {
            match writer {
                OutputWriter::Test { stdout, .. } => String::from_utf8(stdout.clone()).unwrap(),
                OutputWriter::Normal => unreachable!("tests capture output"),
            }
        }

        #[test]
        fn create_run_report() {
            let dir = Utf8TempDir::new().unwrap();
            let script = serde_json::to_string(ENGINE).unwrap();
            std::fs::write(
                dir.path().join("orchestrator.toml"),
                formatdoc! {r#"
                    [engine]
                    program = "sh"
                    args = ["-c", {script}, "engine"]
                "#},
            )
            .unwrap();

            let (result, _) = exec(&dir, &["init"]);
            assert_eq!(result.unwrap(), 0);

            let (result, writer) = exec(&dir, &["create"]);
            assert_eq!(result.unwrap(), 0);
            let run_id = stdout(&writer).trim().to_owned();
            run_id.parse::<RunUuid>().expect("create prints the run id");

            let output_dir = dir.path().join("out");
            let (result, writer) = exec(&dir, &["run", &run_id, "-o", output_dir.as_str()]);
            assert_eq!(result.unwrap(), 0, "test failures do not fail the shard");
            let OutputWriter::Test { reporter, .. } = &writer else {
                unreachable!("tests capture output");
            };
            let reporter = String::from_utf8_lossy(reporter);
            assert!(reporter.contains("✗ [p] b.spec:2:1"), "{reporter}");
            assert!(reporter.contains("✓ [p] a.spec:1:1"), "{reporter}");

            let (result, writer) = exec(&dir, &["report", &run_id, "--format", "json"]);
            assert_eq!(result.unwrap(), 0);
            let report: RunReport = serde_json::from_str(&stdout(&writer)).unwrap();
            assert_eq!(report.config.status, RunStatus::Finished);
            let statuses: Vec<_> = report
                .tests
                .iter()
                .map(|t| (t.file.as_str(), t.status))
                .collect();
            assert_eq!(
                statuses,
                [("b.spec", TestStatus::Failed), ("a.spec", TestStatus::Passed)]
            );
        }

        #[test]
        fn unknown_run_exit_code() {
            let dir = Utf8TempDir::new().unwrap();
            std::fs::write(dir.path().join("orchestrator.toml"), "").unwrap();
            let (result, _) = exec(&dir, &["init"]);
            assert_eq!(result.unwrap(), 0);

            let run_id = RunUuid::new_v4().to_string();
            let (result, _) = exec(&dir, &["report", &run_id]);
            assert_eq!(
                result.unwrap_err().process_exit_code(),
                orchestrator_metadata::OrchestratorExitCode::RUN_NOT_FOUND
            );
        }
    }
}
