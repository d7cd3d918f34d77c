// Copyright (c) The test-orchestrator Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::Annotation;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use std::{borrow::Borrow, fmt};

/// A stable key correlating a test across runs, for duration and failure history.
///
/// Identities are computed once, when a run is created, and stored on each
/// [`TestItem`](crate::TestItem).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TestIdentity(String);

impl TestIdentity {
    /// Wraps an already-computed identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Computes the identity of a test.
    ///
    /// In order of precedence:
    ///
    /// 1. `{project} > {id}` if the test carries an `id` annotation with a description,
    /// 2. `{project} > {file}` if the entry is a file-level serial group (its title is the file
    ///    path itself),
    /// 3. `{project} > {file} > {title}` otherwise.
    pub fn compute(
        project: &str,
        file: &Utf8Path,
        title: &str,
        annotations: &[Annotation],
    ) -> Self {
        let explicit = annotations
            .iter()
            .find(|a| a.kind == Annotation::ID_TYPE)
            .and_then(|a| a.description.as_deref());
        match explicit {
            Some(id) => Self(format!("{project} > {id}")),
            None if file.as_str() == title => Self(format!("{project} > {file}")),
            None => Self(format!("{project} > {file} > {title}")),
        }
    }

    /// Returns the identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TestIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}
