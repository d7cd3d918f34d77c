// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers shared by the integration test binaries and the tests that drive them.

pub mod fake_suite;
pub mod orchestrator_cli;
