// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::Annotation;
use serde::{Deserialize, Serialize};

/// The structured result printed on standard output by the test engine after executing a
/// single test item.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestReportResult {
    /// The status of the final attempt.
    pub status: EngineTestStatus,

    /// The total duration across all attempts, in milliseconds.
    pub duration: f64,

    /// The title of the test, or of the serial group if several tests ran.
    pub title: String,

    /// Annotations of every executed test, deduplicated.
    #[serde(default)]
    pub annotations: Vec<Annotation>,

    /// The error of the final attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestErrorInfo>,

    /// Per-attempt sub-results.
    #[serde(default)]
    pub tests: Vec<AttemptResult>,
}

/// One attempt of one test, as reported by the engine.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AttemptResult {
    /// The test title.
    pub title: String,

    /// The attempt's status.
    pub status: EngineTestStatus,

    /// The attempt's duration, in milliseconds.
    pub duration: f64,

    /// The engine-level retry index of this attempt.
    #[serde(default)]
    pub retry: u32,

    /// Annotations declared on the test.
    #[serde(default)]
    pub annotations: Vec<Annotation>,

    /// The attempt's error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestErrorInfo>,
}

/// The status of a test as reported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineTestStatus {
    /// The test passed.
    Passed,

    /// The test failed.
    Failed,

    /// The test exceeded its timeout.
    TimedOut,

    /// The test was skipped.
    Skipped,

    /// The test was interrupted.
    Interrupted,
}

/// Error details attached to an engine result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestErrorInfo {
    /// The error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The stack trace, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_engine_output() {
        let input = r#"{
            "status": "timed-out",
            "duration": 1520.5,
            "title": "checkout",
            "error": { "message": "timeout of 1500ms exceeded" },
            "tests": [
                { "title": "checkout", "status": "failed", "duration": 700, "retry": 0 },
                { "title": "checkout", "status": "timed-out", "duration": 820.5, "retry": 1 }
            ]
        }"#;
        let result: TestReportResult = serde_json::from_str(input).expect("valid engine output");
        assert_eq!(result.status, EngineTestStatus::TimedOut);
        assert_eq!(result.tests.len(), 2);
        assert_eq!(result.tests[1].retry, 1);
        assert!(result.annotations.is_empty());
        assert_eq!(
            result.error.and_then(|e| e.message).as_deref(),
            Some("timeout of 1500ms exceeded")
        );
    }
}
