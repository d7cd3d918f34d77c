// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test discovery through the engine's `list` subcommand.

use crate::{engine::EngineCommand, errors::AnalyzerError};
use itertools::Itertools;
use orchestrator_metadata::TestRunInfo;
use tracing::debug;

/// Runs `<program> list [args...]` and parses the discovered tests.
///
/// `args` are the test framework arguments given to `create`; they are forwarded verbatim so
/// that discovery sees the same filters as execution.
pub fn discover_tests(
    command: &EngineCommand,
    args: &[String],
) -> Result<TestRunInfo, AnalyzerError> {
    let list_args = command.args_for("list", args.iter().map(String::as_str));
    let shown = std::iter::once(command.program())
        .chain(list_args.iter().copied())
        .join(" ");
    debug!(command = %shown, "discovering tests");

    let output = duct::cmd(command.program(), list_args.iter().copied())
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|error| AnalyzerError::Exec {
            command: shown.clone(),
            error,
        })?;
    if !output.status.success() {
        return Err(AnalyzerError::Failed {
            command: shown,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let info: TestRunInfo =
        serde_json::from_slice(&output.stdout).map_err(|error| AnalyzerError::Parse {
            command: shown,
            error,
        })?;
    debug!(
        files = info.test_run.len(),
        entries = info.test_run.values().map(|e| e.len()).sum::<usize>(),
        "discovered tests"
    );
    Ok(info)
}
