// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use orchestrator_metadata::OrchestratorExitCode;
use orchestrator_runner::errors::{
    AnalyzerError, ConfigParseError, ShardError, StorageConfigError, StorageError,
    WriteReportError,
};
use owo_colors::OwoColorize;
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders: errors are printed with display_to_stderr, which
// colorizes them and walks the source chain.

/// An error that test-orchestrator knows how to report.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("storage config error")]
    StorageConfigError {
        #[from]
        err: StorageConfigError,
    },
    #[error("storage error")]
    StorageError {
        #[from]
        err: StorageError,
    },
    #[error("test discovery error")]
    AnalyzerError {
        #[from]
        err: AnalyzerError,
    },
    #[error("shard error")]
    ShardError {
        #[from]
        err: ShardError,
    },
    #[error("error writing report")]
    WriteReportError {
        #[from]
        err: WriteReportError,
    },
    #[error("error writing output")]
    WriteOutputError {
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn write_output(err: std::io::Error) -> Self {
        Self::WriteOutputError { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. } | Self::StorageConfigError { .. } => {
                OrchestratorExitCode::SETUP_ERROR
            }
            Self::StorageError { err } => storage_exit_code(err),
            Self::AnalyzerError { .. } => OrchestratorExitCode::TEST_LIST_CREATION_FAILED,
            Self::ShardError { err } => match err {
                ShardError::Storage(err) => storage_exit_code(err),
                ShardError::Engine(_) => OrchestratorExitCode::EXECUTION_INFRASTRUCTURE_FAILED,
                ShardError::RuntimeCreate(_) | ShardError::OutputDirRemove { .. } => {
                    OrchestratorExitCode::SETUP_ERROR
                }
                _ => OrchestratorExitCode::STORAGE_ERROR,
            },
            Self::WriteReportError { .. } | Self::WriteOutputError { .. } => {
                OrchestratorExitCode::WRITE_OUTPUT_ERROR
            }
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::ConfigParseError { err } => {
                match err.config_file() {
                    Some(path) => error!(
                        "failed to parse config at `{}`",
                        path.style(styles.bold)
                    ),
                    None => error!("failed to parse default config"),
                }
                err.source()
            }
            Self::StorageConfigError { err } => {
                error!("{err}");
                None
            }
            Self::StorageError { err } => {
                display_storage_error(err, styles);
                err.source()
            }
            Self::AnalyzerError { err } => {
                match err {
                    AnalyzerError::Failed {
                        command,
                        exit_code,
                        stderr,
                    } => {
                        error!(
                            "test discovery command `{}` failed with {}",
                            command.style(styles.bold),
                            display_exit_code(*exit_code),
                        );
                        if !stderr.trim().is_empty() {
                            error!(target: NO_HEADING_TARGET, "{}", stderr.trim_end());
                        }
                    }
                    other => error!("{other}"),
                }
                err.source()
            }
            Self::ShardError { err } => {
                match err {
                    ShardError::Storage(err) => {
                        display_storage_error(err, styles);
                        err.source()
                    }
                    ShardError::Engine(err) => {
                        error!("test execution infrastructure failed: {err}");
                        error!(
                            target: NO_HEADING_TARGET,
                            "{}",
                            "(hint: tests claimed by this shard stay ongoing; \
                             run `test-orchestrator run` again to finish the run)"
                                .style(styles.hint)
                        );
                        err.source()
                    }
                    other => {
                        error!("{other}");
                        other.source()
                    }
                }
            }
            Self::WriteReportError { err } => {
                error!("{err}");
                err.source()
            }
            Self::WriteOutputError { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}

fn storage_exit_code(err: &StorageError) -> i32 {
    match err {
        StorageError::RunNotFound { .. } => OrchestratorExitCode::RUN_NOT_FOUND,
        StorageError::DuplicateTestIdentity { .. } => {
            OrchestratorExitCode::DUPLICATE_TEST_IDENTITY
        }
        StorageError::InvalidTablePrefix { .. } => OrchestratorExitCode::SETUP_ERROR,
        _ => OrchestratorExitCode::STORAGE_ERROR,
    }
}

fn display_storage_error(err: &StorageError, styles: &StderrStyles) {
    match err {
        StorageError::RunNotFound { run_id } => {
            error!(
                "run {} not found (hint: create it with `test-orchestrator create`, \
                 using the same storage options)",
                run_id.style(styles.bold)
            );
        }
        other => error!("{other}"),
    }
}

fn display_exit_code(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_owned(),
    }
}
