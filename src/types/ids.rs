//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different identifier kinds (e.g.
//! using a revision SHA where a Change-Id is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier for one processing run of a merged change.
///
/// Assigned at webhook ingestion and used as the primary key of the
/// corresponding `ProcessingRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Gerrit-style Change-Id (the `I...` footer value).
///
/// A cherry-pick of a change keeps the same Change-Id as its source; only the
/// branch component of the full change key differs. This is what makes a
/// replica's identity predictable before the replica exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(pub String);

impl ChangeId {
    pub fn new(s: impl Into<String>) -> Self {
        ChangeId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChangeId {
    fn from(s: &str) -> Self {
        ChangeId(s.to_string())
    }
}

impl From<String> for ChangeId {
    fn from(s: String) -> Self {
        ChangeId(s)
    }
}

/// A branch name within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Branch(pub String);

impl Branch {
    pub fn new(s: impl Into<String>) -> Self {
        Branch(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Branch {
    fn from(s: &str) -> Self {
        Branch(s.to_string())
    }
}

impl From<String> for Branch {
    fn from(s: String) -> Self {
        Branch(s)
    }
}

/// A commit SHA identifying one revision of a change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub String);

impl RevisionId {
    pub fn new(s: impl Into<String>) -> Self {
        RevisionId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short (8-character) form for comments and logs.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        RevisionId(s.to_string())
    }
}

/// Fully-qualified change key: `project~branch~ChangeId`.
///
/// This triple is unique across the review system. Deriving the key of a
/// not-yet-existing cherry-pick is a matter of swapping the branch component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeKey {
    pub project: String,
    pub branch: Branch,
    pub id: ChangeId,
}

impl ChangeKey {
    pub fn new(
        project: impl Into<String>,
        branch: impl Into<Branch>,
        id: impl Into<ChangeId>,
    ) -> Self {
        ChangeKey {
            project: project.into(),
            branch: branch.into(),
            id: id.into(),
        }
    }

    /// The key this change's replica will carry on `target`.
    pub fn on_branch(&self, target: &Branch) -> ChangeKey {
        ChangeKey {
            project: self.project.clone(),
            branch: target.clone(),
            id: self.id.clone(),
        }
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}~{}", self.project, self.branch, self.id)
    }
}
