// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for orchestrator-runner.

use orchestrator_metadata::TestItem;
use std::fmt;

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "shard" if `count` is 1, otherwise "shards".
    pub fn shards_str(count: usize) -> &'static str {
        if count == 1 { "shard" } else { "shards" }
    }

    /// Returns "failure" if `count` is 1, otherwise "failures".
    pub fn failures_str(count: usize) -> &'static str {
        if count == 1 { "failure" } else { "failures" }
    }

    /// Returns "h" if `count` is 1, otherwise "hs".
    pub fn hours_str(count: u64) -> &'static str {
        if count == 1 { "h" } else { "hs" }
    }

    /// Returns "min" if `count` is 1, otherwise "mins".
    pub fn minutes_str(count: u64) -> &'static str {
        if count == 1 { "min" } else { "mins" }
    }

    /// Returns "sec" if `count` is 1, otherwise "secs".
    pub fn seconds_str(count: u64) -> &'static str {
        if count == 1 { "sec" } else { "secs" }
    }
}

/// Formats a duration in milliseconds as `N h, N mins, N secs`, omitting zero components.
///
/// Sub-second durations render as `0 secs`.
pub fn format_duration(millis: f64) -> String {
    let total_secs = if millis.is_finite() && millis > 0.0 {
        (millis / 1000.0).round() as u64
    } else {
        0
    };
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    let mut parts = Vec::with_capacity(3);
    if hours > 0 {
        parts.push(format!("{hours} {}", plural::hours_str(hours)));
    }
    if minutes > 0 {
        parts.push(format!("{minutes} {}", plural::minutes_str(minutes)));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds} {}", plural::seconds_str(seconds)));
    }
    parts.join(", ")
}

/// Returns the stable output key of a test item: the hex xxh3-64 hash of
/// `[project] > file:line:column`.
///
/// The engine writes its artifacts for the item under this name in the shard's output
/// directory.
pub fn output_key(item: &TestItem) -> String {
    let key = format!("[{}] > {}", item.project, item.locator());
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(key.as_bytes()))
}

/// Displays a test item as `[project] file:line:column`.
pub(crate) struct DisplayTestItem<'a>(pub(crate) &'a TestItem);

impl fmt::Display for DisplayTestItem<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}:{}", self.0.project, self.0.file, self.0.position)
    }
}

/// Renders a ratio as a percentage with one decimal place.
pub(crate) fn percentage(numerator: f64, denominator: f64) -> Option<String> {
    (denominator != 0.0 && denominator.is_finite())
        .then(|| format!("{:.1}%", numerator / denominator * 100.0))
}
