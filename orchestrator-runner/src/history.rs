// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-identity duration and pass/fail history.
//!
//! History records outlive runs. Storage adapters own their persistence and serialize
//! concurrent updates; this module only holds the arithmetic.

use chrono::{DateTime, Utc};
use orchestrator_metadata::{ReportSnapshot, TestStatus};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, time::Duration};

/// The duration and outcome history of one test identity.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryRecord {
    /// When the record was first created.
    pub created: DateTime<Utc>,

    /// The exponential moving average of durations, in milliseconds. Zero means unknown.
    pub ema: f64,

    /// The most recent results, oldest first. Never longer than the history window that was
    /// in effect when the last entry was recorded.
    pub history: VecDeque<HistoryEntry>,
}

/// A single recorded result.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryEntry {
    /// The duration of the execution, in milliseconds.
    pub duration: f64,

    /// Either [`TestStatus::Passed`] or [`TestStatus::Failed`].
    pub status: TestStatus,

    /// When the result was recorded.
    pub updated: DateTime<Utc>,
}

/// Figures derived from a [`HistoryRecord`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HistoryStats {
    /// The exponential moving average of durations, in milliseconds.
    pub ema: f64,

    /// The number of failed entries in the window.
    pub fails: usize,

    /// The newest passing entry's timestamp.
    pub last_success: Option<DateTime<Utc>>,
}

impl HistoryStats {
    /// Builds the report snapshot stored alongside an item whose result is being recorded.
    pub fn snapshot(&self, title: String, duration: f64) -> ReportSnapshot {
        ReportSnapshot {
            title,
            duration,
            ema: self.ema,
            fails: self.fails,
            last_successful_run: self.last_success,
        }
    }
}

impl HistoryRecord {
    /// Creates an empty record.
    pub fn new(created: DateTime<Utc>) -> Self {
        Self {
            created,
            ema: 0.0,
            history: VecDeque::new(),
        }
    }

    /// Returns the stats derived from this record.
    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            ema: self.ema,
            fails: self
                .history
                .iter()
                .filter(|entry| entry.status == TestStatus::Failed)
                .count(),
            last_success: self
                .history
                .iter()
                .rev()
                .find(|entry| entry.status == TestStatus::Passed)
                .map(|entry| entry.updated),
        }
    }

    /// Appends a result, evicting the oldest entries beyond `window`, and updates the EMA.
    ///
    /// Returns the stats as they were before the result was appended.
    pub fn record(&mut self, entry: HistoryEntry, window: usize) -> HistoryStats {
        let before = self.stats();
        self.ema = next_ema(self.ema, entry.duration, window);
        self.history.push_back(entry);
        while self.history.len() > window {
            self.history.pop_front();
        }
        before
    }

    /// Returns the time of the newest entry, or the creation time if there are none.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.history
            .back()
            .map_or(self.created, |entry| entry.updated)
    }

    /// Returns true if the record has seen no activity for longer than `ttl`.
    ///
    /// A zero `ttl` disables expiry.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        // A ttl too large to represent never expires anything.
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.last_activity().checked_add_signed(ttl))
            .is_some_and(|deadline| deadline < now)
    }
}

/// Returns the smoothing factor for a history window: `2 / (window + 1)`.
pub fn ema_factor(window: usize) -> f64 {
    2.0 / (window as f64 + 1.0)
}

/// Folds one duration into an EMA.
///
/// The first observation (EMA of zero) initializes the average directly.
pub fn next_ema(ema: f64, duration: f64, window: usize) -> f64 {
    if ema == 0.0 {
        duration
    } else {
        let k = ema_factor(window);
        duration * k + ema * (1.0 - k)
    }
}
