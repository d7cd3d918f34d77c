// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{TestIdentity, TestPositionParseError};
use camino::Utf8PathBuf;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A position within a source file, rendered as `line:column`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestPosition {
    /// The 1-based line.
    pub line: u32,

    /// The 1-based column.
    pub column: u32,
}

impl TestPosition {
    /// Creates a new position.
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl FromStr for TestPosition {
    type Err = TestPositionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (line, column) = s
            .split_once(':')
            .ok_or_else(|| TestPositionParseError::new(s, "expected `line:column`"))?;
        let line = line
            .parse()
            .map_err(|_| TestPositionParseError::new(s, "line is not a number"))?;
        let column = column
            .parse()
            .map_err(|_| TestPositionParseError::new(s, "column is not a number"))?;
        Ok(Self { line, column })
    }
}

impl fmt::Display for TestPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// Positions are map keys in analyzer output, so they go through the string form.
impl Serialize for TestPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TestPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One unit of work: run a single test (or serial group) under a single project.
///
/// Test items are immutable once the run is created.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestItem {
    /// The source file containing the test.
    pub file: Utf8PathBuf,

    /// The position of the test within the file.
    pub position: TestPosition,

    /// The project the test runs under.
    pub project: String,

    /// The claim order, 1-based and strictly ascending.
    pub order: u32,

    /// The timeout to apply when running the test, in milliseconds.
    pub timeout: u64,

    /// The identity used to correlate this test across runs.
    pub identity: TestIdentity,
}

impl TestItem {
    /// Returns a short human-readable key: `[project] file:line:column`.
    pub fn display_key(&self) -> String {
        format!("[{}] {}:{}", self.project, self.file, self.position)
    }

    /// Returns the `file:line:column` locator passed to the test engine.
    pub fn locator(&self) -> String {
        format!("{}:{}", self.file, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("12:4", Some(TestPosition::new(12, 4)) ; "valid")]
    #[test_case("1:1", Some(TestPosition::new(1, 1)) ; "minimal")]
    #[test_case("12", None ; "missing column")]
    #[test_case("a:4", None ; "non-numeric line")]
    #[test_case("12:", None ; "empty column")]
    #[test_case("12:4:2", None ; "extra component")]
    fn parse_position(input: &str, expected: Option<TestPosition>) {
        assert_eq!(input.parse::<TestPosition>().ok(), expected);
    }

    #[test]
    fn position_round_trips_through_display() {
        let position = TestPosition::new(7, 21);
        assert_eq!(position.to_string().parse::<TestPosition>(), Ok(position));
    }

    #[test]
    fn item_keys() {
        let item = TestItem {
            file: "tests/a.spec".into(),
            position: TestPosition::new(3, 9),
            project: "firefox".to_owned(),
            order: 1,
            timeout: 1000,
            identity: TestIdentity::new("firefox > tests/a.spec > works"),
        };
        assert_eq!(item.display_key(), "[firefox] tests/a.spec:3:9");
        assert_eq!(item.locator(), "tests/a.spec:3:9");
    }
}
