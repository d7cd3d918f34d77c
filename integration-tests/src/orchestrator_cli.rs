// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use color_eyre::{Result, eyre::Context};
use orchestrator_metadata::RunReport;
use std::{
    borrow::Cow,
    collections::HashMap,
    ffi::OsString,
    fmt,
    process::{Child, Command, ExitStatus, Stdio},
};

/// A builder for invocations of the test-orchestrator binary.
#[derive(Clone, Debug)]
pub struct OrchestratorCli {
    bin: Utf8PathBuf,
    args: Vec<String>,
    envs: HashMap<OsString, OsString>,
    unchecked: bool,
}

impl OrchestratorCli {
    /// Creates a new invocation of `bin`, with colors turned off.
    pub fn new(bin: impl Into<Utf8PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            args: vec!["--color".to_owned(), "never".to_owned()],
            envs: HashMap::new(),
            unchecked: false,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(&mut self, arg: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(arg.into_iter().map(Into::into));
        self
    }

    pub fn env(&mut self, k: impl Into<OsString>, v: impl Into<OsString>) -> &mut Self {
        self.envs.insert(k.into(), v.into());
        self
    }

    pub fn envs(
        &mut self,
        envs: impl IntoIterator<Item = (impl Into<OsString>, impl Into<OsString>)>,
    ) -> &mut Self {
        self.envs
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Don't panic if the command fails.
    pub fn unchecked(&mut self, unchecked: bool) -> &mut Self {
        self.unchecked = unchecked;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.bin);
        command.args(&self.args);
        // Tests assert on plain output. Individual tests may set these again.
        command.env_remove("GITHUB_STEP_SUMMARY");
        command.env("ORCHESTRATOR_HIDE_PROGRESS", "1");
        command.envs(&self.envs);
        command
    }

    /// Runs the command to completion.
    pub fn output(&self) -> OrchestratorOutput {
        self.spawn().wait()
    }

    /// Starts the command without waiting for it, so that several shards can run at once.
    pub fn spawn(&self) -> RunningOrchestrator {
        let mut command = self.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command.spawn().expect("failed to spawn");
        RunningOrchestrator {
            command,
            child,
            unchecked: self.unchecked,
        }
    }
}

/// A test-orchestrator process started by [`OrchestratorCli::spawn`].
pub struct RunningOrchestrator {
    command: Command,
    child: Child,
    unchecked: bool,
}

impl RunningOrchestrator {
    /// Waits for the process to exit, panicking on failure unless the command is unchecked.
    pub fn wait(self) -> OrchestratorOutput {
        let output = self.child.wait_with_output().expect("failed to wait");
        let ret = OrchestratorOutput {
            command: self.command,
            exit_status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if !self.unchecked && !ret.exit_status.success() {
            panic!("command failed:\n\n{ret}");
        }

        ret
    }
}

pub struct OrchestratorOutput {
    pub command: Command,
    pub exit_status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl OrchestratorOutput {
    pub fn stdout_as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Decodes the output of `report --format json`.
    pub fn decode_report_json(&self) -> Result<RunReport> {
        serde_json::from_slice(&self.stdout).wrap_err("failed to decode report JSON")
    }
}

impl fmt::Display for OrchestratorOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command: {:?}\nexit code: {:?}\n\
                   --- stdout ---\n{}\n\n--- stderr ---\n{}\n\n",
            self.command,
            self.exit_status.code(),
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        )
    }
}

// Make Debug output the same as Display output, so `.unwrap()` and `.expect()` are nicer.
impl fmt::Debug for OrchestratorOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
