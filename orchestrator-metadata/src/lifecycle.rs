// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::StatusCodeError;
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind marker for [`RunUuid`].
pub enum RunKind {}

impl TypedUuidKind for RunKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("run");
        TAG
    }
}

/// The identifier of a test run, shared by every shard consuming it.
pub type RunUuid = TypedUuid<RunKind>;

/// The status of a test run.
///
/// Runs move linearly through `Created → Run → Finished`. Starting a shard on a `Finished` run
/// moves it to `RepeatRun`, which re-arms failed tests for a retry pass; the retry pass ends in
/// `Finished` again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// The queue is populated and no shard has started yet.
    Created,

    /// At least one shard has begun consuming the first pass.
    Run,

    /// A shard started on a finished run: failed tests were re-armed.
    RepeatRun,

    /// Every test was claimed and resolved at least once.
    Finished,
}

impl RunStatus {
    /// Returns the integer code used by relational backends.
    pub const fn code(self) -> i64 {
        match self {
            Self::Created => 0,
            Self::Run => 10,
            Self::RepeatRun => 20,
            Self::Finished => 30,
        }
    }

    /// Converts a stored integer code back into a status.
    pub fn from_code(code: i64) -> Result<Self, StatusCodeError> {
        match code {
            0 => Ok(Self::Created),
            10 => Ok(Self::Run),
            20 => Ok(Self::RepeatRun),
            30 => Ok(Self::Finished),
            other => Err(StatusCodeError::new("run status", other)),
        }
    }

    /// Returns the status a run moves to when a shard starts, or `None` if starting a shard
    /// leaves the status unchanged.
    ///
    /// Only `Created` and `Finished` runs transition: the first shard to start after either
    /// state wins the transition, and every other shard observes the result.
    pub const fn on_shard_start(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Run),
            Self::Finished => Some(Self::RepeatRun),
            Self::Run | Self::RepeatRun => None,
        }
    }

    /// Returns true if starting a shard on a run with this status re-arms failed tests.
    pub const fn rearms_failed(self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Run => write!(f, "run"),
            Self::RepeatRun => write!(f, "repeat-run"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// The status of a single test item within a run.
///
/// Items move `Ready → Ongoing → {Passed | Failed}`. Only `Failed` items ever move back to
/// `Ready`, and only through the re-arm step of [`RunStatus::RepeatRun`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    /// The item is waiting to be claimed.
    Ready,

    /// The item was claimed by a shard and is being executed.
    Ongoing,

    /// The last execution of the item failed.
    Failed,

    /// The last execution of the item passed.
    Passed,
}

impl TestStatus {
    /// Returns the integer code used by relational backends.
    pub const fn code(self) -> i64 {
        match self {
            Self::Ready => 0,
            Self::Ongoing => 10,
            Self::Failed => 20,
            Self::Passed => 30,
        }
    }

    /// Converts a stored integer code back into a status.
    pub fn from_code(code: i64) -> Result<Self, StatusCodeError> {
        match code {
            0 => Ok(Self::Ready),
            10 => Ok(Self::Ongoing),
            20 => Ok(Self::Failed),
            30 => Ok(Self::Passed),
            other => Err(StatusCodeError::new("test status", other)),
        }
    }

    /// Returns true if the item has a recorded result.
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Failed | Self::Passed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Ongoing => write!(f, "ongoing"),
            Self::Failed => write!(f, "failed"),
            Self::Passed => write!(f, "passed"),
        }
    }
}
