//! Shared test doubles and fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::gerrit::{
    ChangeInfo, ChangeStatus, CherryPickCreated, GerritApi, GerritError, GerritResult,
    RelatedChange,
};
use crate::types::{Branch, ChangeId, ChangeKey, MergeEvent, RevisionId};

/// A merged change carrying a `Pick-to:` footer, for feeding into the engine.
pub fn sample_event(change_id: &str, revision: &str, pick_to: &[&str]) -> MergeEvent {
    MergeEvent {
        project: "qt/base".into(),
        branch: Branch::new("dev"),
        change_id: ChangeId::new(change_id),
        number: 42,
        subject: "Fix the frobnicator".into(),
        url: format!("https://review.example/c/{change_id}"),
        owner: "owner@example.com".into(),
        commit_message: format!(
            "Fix the frobnicator\n\nPick-to: {}\nChange-Id: {change_id}",
            pick_to.join(" ")
        ),
        revision: revision.into(),
        uploader: "dev@example.com".into(),
    }
}

#[derive(Default)]
struct World {
    /// (project, branch) → head revision.
    branches: HashMap<(String, Branch), RevisionId>,
    changes: HashMap<ChangeKey, ChangeInfo>,
    related: HashMap<ChangeKey, Vec<RelatedChange>>,
    /// Source keys whose next pick applies with conflict markers.
    conflicting_picks: Vec<(ChangeKey, Branch)>,
    /// method name → queued errors, consumed one per call.
    failures: HashMap<&'static str, VecDeque<GerritError>>,

    comments: Vec<(ChangeKey, String)>,
    approvals: Vec<ChangeKey>,
    staged: Vec<ChangeKey>,
    assignees: Vec<(ChangeKey, String)>,
    reviewers: Vec<(ChangeKey, Vec<String>)>,
}

/// In-memory review system.
///
/// Holds a small world model (branches, changes, relation chains) and records
/// every side-effecting call for assertions. Individual calls can be made to
/// fail by queueing errors per method name.
#[derive(Default)]
pub struct FakeGerrit {
    world: Mutex<World>,
}

impl FakeGerrit {
    pub fn new() -> Self {
        FakeGerrit::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    pub fn add_branch(&self, project: &str, branch: &str, head: &str) {
        self.lock().branches.insert(
            (project.to_string(), Branch::new(branch)),
            RevisionId::new(head),
        );
    }

    pub fn add_change(&self, info: ChangeInfo) {
        self.lock().changes.insert(info.key.clone(), info);
    }

    pub fn set_status(&self, key: &ChangeKey, status: ChangeStatus) {
        if let Some(info) = self.lock().changes.get_mut(key) {
            info.status = status;
        }
    }

    pub fn set_related(&self, key: &ChangeKey, chain: Vec<RelatedChange>) {
        self.lock().related.insert(key.clone(), chain);
    }

    /// Queues an error for the next call to `method`.
    pub fn fail_next(&self, method: &'static str, error: GerritError) {
        self.lock()
            .failures
            .entry(method)
            .or_default()
            .push_back(error);
    }

    /// Makes the next pick of `source` onto `branch` come back conflicted.
    pub fn pick_conflicts(&self, source: &ChangeKey, branch: &str) {
        self.lock()
            .conflicting_picks
            .push((source.clone(), Branch::new(branch)));
    }

    fn take_failure(&self, method: &'static str) -> Option<GerritError> {
        self.lock().failures.get_mut(method)?.pop_front()
    }

    pub fn comments(&self) -> Vec<(ChangeKey, String)> {
        self.lock().comments.clone()
    }

    pub fn comments_on(&self, key: &ChangeKey) -> Vec<String> {
        self.lock()
            .comments
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn approvals(&self) -> Vec<ChangeKey> {
        self.lock().approvals.clone()
    }

    pub fn staged(&self) -> Vec<ChangeKey> {
        self.lock().staged.clone()
    }

    pub fn assignees(&self) -> Vec<(ChangeKey, String)> {
        self.lock().assignees.clone()
    }

    pub fn reviewers(&self) -> Vec<(ChangeKey, Vec<String>)> {
        self.lock().reviewers.clone()
    }
}

#[async_trait]
impl GerritApi for FakeGerrit {
    async fn validate_branch(
        &self,
        project: &str,
        branch: &Branch,
    ) -> GerritResult<Option<RevisionId>> {
        if let Some(error) = self.take_failure("validate_branch") {
            return Err(error);
        }
        Ok(self
            .lock()
            .branches
            .get(&(project.to_string(), branch.clone()))
            .cloned())
    }

    async fn query_change(&self, key: &ChangeKey) -> GerritResult<Option<ChangeInfo>> {
        if let Some(error) = self.take_failure("query_change") {
            return Err(error);
        }
        Ok(self.lock().changes.get(key).cloned())
    }

    async fn query_change_by_revision(
        &self,
        project: &str,
        revision: &RevisionId,
    ) -> GerritResult<Option<ChangeInfo>> {
        if let Some(error) = self.take_failure("query_change_by_revision") {
            return Err(error);
        }
        Ok(self
            .lock()
            .changes
            .values()
            .find(|info| info.key.project == project && &info.current_revision == revision)
            .cloned())
    }

    async fn query_related(&self, key: &ChangeKey) -> GerritResult<Vec<RelatedChange>> {
        if let Some(error) = self.take_failure("query_related") {
            return Err(error);
        }
        Ok(self.lock().related.get(key).cloned().unwrap_or_default())
    }

    async fn query_pick(
        &self,
        project: &str,
        id: &ChangeId,
        branch: &Branch,
    ) -> GerritResult<Option<ChangeInfo>> {
        if let Some(error) = self.take_failure("query_pick") {
            return Err(error);
        }
        let key = ChangeKey::new(project, branch.clone(), id.clone());
        Ok(self.lock().changes.get(&key).cloned())
    }

    async fn generate_cherry_pick(
        &self,
        source: &ChangeKey,
        parent_revision: &RevisionId,
        target: &Branch,
    ) -> GerritResult<CherryPickCreated> {
        if let Some(error) = self.take_failure("generate_cherry_pick") {
            return Err(error);
        }
        let mut world = self.lock();
        let conflicts = world
            .conflicting_picks
            .iter()
            .position(|(k, b)| k == source && b == target)
            .map(|i| {
                world.conflicting_picks.remove(i);
            })
            .is_some();

        let key = source.on_branch(target);
        let source_info = world.changes.get(source).cloned();
        let replica = ChangeInfo {
            key: key.clone(),
            status: ChangeStatus::New,
            parent: Some(parent_revision.clone()),
            current_revision: RevisionId::new(format!("pick-{}-{}", key.id, target)),
            commit_message: source_info
                .as_ref()
                .map(|i| i.commit_message.clone())
                .unwrap_or_default(),
            owner: source_info.map(|i| i.owner).unwrap_or_default(),
            reviewers: Vec::new(),
        };
        world.changes.insert(key.clone(), replica);
        Ok(CherryPickCreated { key, conflicts })
    }

    async fn set_approval(&self, key: &ChangeKey) -> GerritResult<()> {
        if let Some(error) = self.take_failure("set_approval") {
            return Err(error);
        }
        self.lock().approvals.push(key.clone());
        Ok(())
    }

    async fn stage_change(&self, key: &ChangeKey) -> GerritResult<()> {
        if let Some(error) = self.take_failure("stage_change") {
            return Err(error);
        }
        let mut world = self.lock();
        world.staged.push(key.clone());
        if let Some(info) = world.changes.get_mut(key) {
            info.status = ChangeStatus::Staged;
        }
        Ok(())
    }

    async fn post_comment(&self, key: &ChangeKey, message: &str) -> GerritResult<()> {
        if let Some(error) = self.take_failure("post_comment") {
            return Err(error);
        }
        self.lock().comments.push((key.clone(), message.to_string()));
        Ok(())
    }

    async fn add_reviewers(&self, key: &ChangeKey, reviewers: &[String]) -> GerritResult<()> {
        self.lock()
            .reviewers
            .push((key.clone(), reviewers.to_vec()));
        Ok(())
    }

    async fn set_assignee(&self, key: &ChangeKey, assignee: &str) -> GerritResult<()> {
        self.lock()
            .assignees
            .push((key.clone(), assignee.to_string()));
        Ok(())
    }
}

/// A plain merged `ChangeInfo` for world setup.
pub fn merged_change(key: ChangeKey, revision: &str, commit_message: &str) -> ChangeInfo {
    ChangeInfo {
        key,
        status: ChangeStatus::Merged,
        parent: None,
        current_revision: RevisionId::new(revision),
        commit_message: commit_message.to_string(),
        owner: "owner@example.com".into(),
        reviewers: vec!["reviewer@example.com".into()],
    }
}
