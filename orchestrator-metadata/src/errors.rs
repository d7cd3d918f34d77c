// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// An error that occurs while parsing a [`TestPosition`](crate::TestPosition).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid test position `{input}`: {message}")]
pub struct TestPositionParseError {
    input: String,
    message: &'static str,
}

impl TestPositionParseError {
    pub(crate) fn new(input: impl Into<String>, message: &'static str) -> Self {
        Self {
            input: input.into(),
            message,
        }
    }
}

/// An error that occurs while converting a stored integer code into a lifecycle status.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} code {code}")]
pub struct StatusCodeError {
    kind: &'static str,
    code: i64,
}

impl StatusCodeError {
    pub(crate) fn new(kind: &'static str, code: i64) -> Self {
        Self { kind, code }
    }

    /// Returns the code that could not be converted.
    pub fn code(&self) -> i64 {
        self.code
    }
}
