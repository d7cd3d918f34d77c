// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A copy of test-orchestrator's main.rs, built as part of this package so that integration
//! tests can find it through `CARGO_BIN_EXE_test-orchestrator-dup`.

use clap::Parser;
use color_eyre::Result;
use test_orchestrator::{OrchestratorApp, OutputWriter};

fn main() -> Result<()> {
    color_eyre::install()?;
    let _ = enable_ansi_support::enable_ansi_support();

    let opts = OrchestratorApp::parse();
    let output = opts.init_output();

    match opts.exec(output, &mut OutputWriter::default()) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
