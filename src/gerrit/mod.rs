//! Review-system collaborator: the `GerritApi` contract and its REST client.
//!
//! The engine only ever talks to the review system through [`GerritApi`].
//! Production uses [`rest::RestGerrit`]; tests use the scripted double in
//! `test_utils`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Branch, ChangeId, ChangeKey, RevisionId};

pub mod error;
pub mod rest;

pub use error::{GerritError, GerritErrorKind, GerritResult};

/// Review status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    New,
    Staged,
    Integrating,
    Merged,
    Abandoned,
}

/// What the review system knows about one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub key: ChangeKey,
    pub status: ChangeStatus,

    /// First parent commit of the current revision, when known.
    pub parent: Option<RevisionId>,

    pub current_revision: RevisionId,
    pub commit_message: String,
    pub owner: String,

    /// Reviewer addresses on the change.
    #[serde(default)]
    pub reviewers: Vec<String>,
}

/// One entry of an ordered relation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedChange {
    pub key: ChangeKey,
    pub revision: RevisionId,
    pub status: ChangeStatus,
}

/// Result of creating a cherry-pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CherryPickCreated {
    /// The new replica's key.
    pub key: ChangeKey,

    /// Whether the pick applied with conflict markers.
    pub conflicts: bool,
}

/// The review-system operations the engine depends on.
///
/// Implementations map their transport failures onto [`GerritErrorKind`]; the
/// engine's routing (retry / terminal / escalate) keys off that alone.
#[async_trait]
pub trait GerritApi: Send + Sync {
    /// Confirms a branch exists. `Ok(Some(head))` with the branch head
    /// revision, `Ok(None)` if the branch is not found.
    async fn validate_branch(
        &self,
        project: &str,
        branch: &Branch,
    ) -> GerritResult<Option<RevisionId>>;

    /// Looks up a change by fully-qualified key.
    async fn query_change(&self, key: &ChangeKey) -> GerritResult<Option<ChangeInfo>>;

    /// Looks up the change a commit belongs to. Used to walk one
    /// commit-parent upward from a change's current revision.
    async fn query_change_by_revision(
        &self,
        project: &str,
        revision: &RevisionId,
    ) -> GerritResult<Option<ChangeInfo>>;

    /// Returns the ordered relation chain containing `key`, youngest first.
    /// The entry after `key` is its immediate ancestor. Empty when the change
    /// stands alone.
    async fn query_related(&self, key: &ChangeKey) -> GerritResult<Vec<RelatedChange>>;

    /// Finds a change's replica on `branch`, if one exists. Replicas share
    /// the source's Change-Id.
    async fn query_pick(
        &self,
        project: &str,
        id: &ChangeId,
        branch: &Branch,
    ) -> GerritResult<Option<ChangeInfo>>;

    /// Creates a cherry-pick of `source` onto `target`, based on
    /// `parent_revision`.
    async fn generate_cherry_pick(
        &self,
        source: &ChangeKey,
        parent_revision: &RevisionId,
        target: &Branch,
    ) -> GerritResult<CherryPickCreated>;

    /// Applies the bot's maximal approval to a change.
    async fn set_approval(&self, key: &ChangeKey) -> GerritResult<()>;

    /// Queues an approved change for automated integration.
    async fn stage_change(&self, key: &ChangeKey) -> GerritResult<()>;

    async fn post_comment(&self, key: &ChangeKey, message: &str) -> GerritResult<()>;

    async fn add_reviewers(&self, key: &ChangeKey, reviewers: &[String]) -> GerritResult<()>;

    async fn set_assignee(&self, key: &ChangeKey, assignee: &str) -> GerritResult<()>;
}
