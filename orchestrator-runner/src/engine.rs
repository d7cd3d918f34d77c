// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The boundary with the external test engine.
//!
//! The engine is a separate program. Shards invoke it once per claimed test item, restricted to
//! that single test, and read a [`TestReportResult`] document from its standard output.

use crate::{errors::EngineError, helpers::output_key};
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::BoxFuture;
use orchestrator_metadata::{RunConfig, TestItem, TestReportResult};
use std::{fmt, process::Stdio};
use tracing::debug;

/// The environment variable naming the file the engine should write its JSON result to, in
/// addition to printing it.
pub const OUTPUT_FILE_ENV: &str = "ORCHESTRATOR_OUTPUT_FILE";

/// How to invoke the engine program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineCommand {
    program: String,
    leading_args: Vec<String>,
}

impl EngineCommand {
    /// Creates a new command. `leading_args` are placed before the subcommand (`list` or `run`).
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Returns the program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments for `subcommand` followed by `args`, without the program.
    pub fn args_for<'a>(
        &'a self,
        subcommand: &'a str,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Vec<&'a str> {
        self.leading_args
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(subcommand))
            .chain(args)
            .collect()
    }
}

/// A request to execute a single test item.
#[derive(Clone, Copy, Debug)]
pub struct ExecuteRequest<'a> {
    /// The claimed item.
    pub item: &'a TestItem,
    /// The run configuration, for forwarded arguments and the framework config file.
    pub config: &'a RunConfig,
    /// The shard's output directory.
    pub output_dir: &'a Utf8Path,
}

/// The interpreted result of an execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionOutcome {
    /// True if the engine reported success.
    pub passed: bool,
    /// The engine's structured result.
    pub result: TestReportResult,
}

/// Executes single tests.
///
/// Returning an error means the engine could not tell whether the test passed. A test failure
/// is an `Ok` outcome with `passed: false`.
pub trait TestEngine: Send + Sync + fmt::Debug {
    /// Executes one test item.
    fn execute<'a>(
        &'a self,
        request: ExecuteRequest<'a>,
    ) -> BoxFuture<'a, Result<ExecutionOutcome, EngineError>>;
}

/// A [`TestEngine`] that spawns the engine program for every item.
#[derive(Clone, Debug)]
pub struct CommandEngine {
    command: EngineCommand,
}

impl CommandEngine {
    /// Creates a new command engine.
    pub fn new(command: EngineCommand) -> Self {
        Self { command }
    }

    /// Returns the arguments passed to the engine for a request, after the program name.
    pub fn run_args(&self, request: &ExecuteRequest<'_>) -> (Vec<String>, Utf8PathBuf) {
        let key = output_key(request.item);
        let output = request.output_dir.join(&key);
        let output_file = request.output_dir.join(format!("{key}.json"));

        let mut args = vec![
            request.item.locator(),
            "--project".to_owned(),
            request.item.project.clone(),
            "--workers".to_owned(),
            "1".to_owned(),
            "--output".to_owned(),
            output.into_string(),
        ];
        if let Some(config_file) = &request.config.config_file {
            args.push("--config".to_owned());
            args.push(config_file.to_string());
        }
        args.extend(request.config.args.iter().cloned());

        let args = self
            .command
            .args_for("run", args.iter().map(String::as_str))
            .into_iter()
            .map(str::to_owned)
            .collect();
        (args, output_file)
    }

    async fn execute_impl(
        &self,
        request: ExecuteRequest<'_>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let locator = request.item.display_key();
        let (args, output_file) = self.run_args(&request);
        debug!(program = self.command.program(), ?args, "spawning test engine");

        let child = tokio::process::Command::new(self.command.program())
            .args(&args)
            .env(OUTPUT_FILE_ENV, output_file.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| EngineError::Spawn {
                program: self.command.program().to_owned(),
                error,
            })?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|error| EngineError::Wait {
                locator: locator.clone(),
                error,
            })?;

        if !output.stderr.is_empty() {
            debug!(
                %locator,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "test engine stderr"
            );
        }

        let result: TestReportResult =
            serde_json::from_slice(&output.stdout).map_err(|error| EngineError::OutputParse {
                locator,
                exit_code: output.status.code(),
                error,
            })?;
        Ok(ExecutionOutcome {
            passed: output.status.success(),
            result,
        })
    }
}

impl TestEngine for CommandEngine {
    fn execute<'a>(
        &'a self,
        request: ExecuteRequest<'a>,
    ) -> BoxFuture<'a, Result<ExecutionOutcome, EngineError>> {
        Box::pin(self.execute_impl(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orchestrator_metadata::{EngineTestStatus, RunStatus, TestIdentity, TestPosition};

    fn item() -> TestItem {
        TestItem {
            file: "tests/login.spec".into(),
            position: TestPosition::new(12, 5),
            project: "chromium".to_owned(),
            order: 1,
            timeout: 30_000,
            identity: TestIdentity::new("chromium > tests/login.spec > logs in"),
        }
    }

    fn config(config_file: Option<&str>, args: &[&str]) -> RunConfig {
        RunConfig {
            workers: 2,
            projects: Vec::new(),
            config_file: config_file.map(Into::into),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            history_window: 10,
            status: RunStatus::Run,
            updated: Utc::now(),
        }
    }

    #[test]
    fn run_args_layout() {
        let engine = CommandEngine::new(EngineCommand::new(
            "npx",
            vec!["test-engine".to_owned()],
        ));
        let item = item();
        let config = config(Some("engine.config.json"), &["--headed"]);
        let request = ExecuteRequest {
            item: &item,
            config: &config,
            output_dir: Utf8Path::new("out"),
        };
        let (args, output_file) = engine.run_args(&request);
        let key = output_key(&item);
        assert_eq!(
            args,
            vec![
                "test-engine".to_owned(),
                "run".to_owned(),
                "tests/login.spec:12:5".to_owned(),
                "--project".to_owned(),
                "chromium".to_owned(),
                "--workers".to_owned(),
                "1".to_owned(),
                "--output".to_owned(),
                format!("out/{key}"),
                "--config".to_owned(),
                "engine.config.json".to_owned(),
                "--headed".to_owned(),
            ]
        );
        assert_eq!(output_file, format!("out/{key}.json"));
    }

    #[cfg(unix)]
    fn sh_engine(script: &str) -> CommandEngine {
        // `sh -c script $0 run <locator> ...`
        CommandEngine::new(EngineCommand::new(
            "sh",
            vec!["-c".to_owned(), script.to_owned(), "engine".to_owned()],
        ))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_decides_verdict() {
        let item = item();
        let config = config(None, &[]);
        let request = ExecuteRequest {
            item: &item,
            config: &config,
            output_dir: Utf8Path::new("out"),
        };

        let passing = sh_engine(
            r#"printf '{"status":"passed","duration":12.5,"title":"%s"}' "$2""#,
        );
        let outcome = passing.execute(request).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.result.status, EngineTestStatus::Passed);
        assert_eq!(outcome.result.title, "tests/login.spec:12:5");

        let failing = sh_engine(
            r#"printf '{"status":"failed","duration":3,"title":"t"}'; exit 1"#,
        );
        let outcome = failing.execute(request).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.result.status, EngineTestStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unparseable_output_is_infrastructure_failure() {
        let item = item();
        let config = config(None, &[]);
        let request = ExecuteRequest {
            item: &item,
            config: &config,
            output_dir: Utf8Path::new("out"),
        };

        let crashing = sh_engine("echo 'segmentation fault' >&2; exit 139");
        let err = crashing.execute(request).await.unwrap_err();
        assert!(
            matches!(err, EngineError::OutputParse { exit_code: Some(139), .. }),
            "unexpected error: {err}"
        );

        let missing = CommandEngine::new(EngineCommand::new(
            "/nonexistent/test-orchestrator-engine",
            Vec::new(),
        ));
        let err = missing.execute(request).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }), "unexpected error: {err}");
    }
}
