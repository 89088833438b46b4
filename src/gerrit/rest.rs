//! REST implementation of [`GerritApi`].
//!
//! Thin transport layer: every method maps one trait call onto one or two
//! authenticated REST requests and classifies failures into
//! [`GerritErrorKind`]. No orchestration logic lives here.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::GerritConfig;
use crate::types::{Branch, ChangeId, ChangeKey, RevisionId};

use super::error::{GerritError, GerritResult};
use super::{ChangeInfo, ChangeStatus, CherryPickCreated, GerritApi, RelatedChange};

/// Gerrit prefixes JSON responses with this line to defeat XSSI.
const XSSI_PREFIX: &str = ")]}'";

/// REST client for the review system.
pub struct RestGerrit {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestGerrit {
    pub fn new(config: &GerritConfig) -> Self {
        RestGerrit {
            client: Client::new(),
            base_url: format!("https://{}:{}/a", config.host, config.port),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "review API request");
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Sends a request and returns the raw body, classifying HTTP failures.
    /// `Ok(None)` on 404.
    async fn send(&self, builder: RequestBuilder) -> GerritResult<Option<String>> {
        let response = builder
            .send()
            .await
            .map_err(|e| GerritError::transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| GerritError::transient(format!("reading response failed: {e}")))?;

        if !status.is_success() {
            return Err(GerritError::from_status(status.as_u16(), body.trim().to_string()));
        }
        Ok(Some(body))
    }

    /// Decodes a Gerrit JSON body, stripping the XSSI prefix.
    fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> GerritResult<T> {
        let stripped = body.trim_start().strip_prefix(XSSI_PREFIX).unwrap_or(body);
        serde_json::from_str(stripped)
            .map_err(|e| GerritError::protocol(format!("unparseable response: {e}")))
    }
}

/// Percent-encodes the one separator that appears in project names.
fn encode_project(project: &str) -> String {
    project.replace('/', "%2F")
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    revision: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl AccountResponse {
    fn address(&self) -> String {
        self.email
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    parents: Vec<ParentResponse>,
}

#[derive(Debug, Deserialize)]
struct ParentResponse {
    commit: String,
}

#[derive(Debug, Deserialize)]
struct RevisionResponse {
    #[serde(default)]
    commit: Option<CommitResponse>,
}

#[derive(Debug, Deserialize)]
struct ChangeResponse {
    project: String,
    branch: String,
    change_id: String,
    status: ChangeStatus,
    #[serde(default)]
    current_revision: Option<String>,
    #[serde(default)]
    revisions: std::collections::HashMap<String, RevisionResponse>,
    #[serde(default)]
    owner: Option<AccountResponse>,
    #[serde(default)]
    reviewers: ReviewersResponse,
    #[serde(default)]
    contains_git_conflicts: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ReviewersResponse {
    #[serde(default, rename = "REVIEWER")]
    reviewer: Vec<AccountResponse>,
}

impl ChangeResponse {
    fn into_info(self) -> GerritResult<ChangeInfo> {
        let current_revision = self
            .current_revision
            .clone()
            .ok_or_else(|| GerritError::protocol("change response lacks current_revision"))?;
        let commit = self.revisions.get(&current_revision).and_then(|r| r.commit.as_ref());

        Ok(ChangeInfo {
            key: ChangeKey::new(self.project.clone(), self.branch.clone(), self.change_id.clone()),
            status: self.status,
            parent: commit
                .and_then(|c| c.parents.first())
                .map(|p| RevisionId::new(p.commit.clone())),
            current_revision: RevisionId::new(current_revision),
            commit_message: commit.map(|c| c.message.clone()).unwrap_or_default(),
            owner: self.owner.as_ref().map(AccountResponse::address).unwrap_or_default(),
            reviewers: self.reviewers.reviewer.iter().map(AccountResponse::address).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RelatedResponse {
    #[serde(default)]
    changes: Vec<RelatedEntry>,
}

#[derive(Debug, Deserialize)]
struct RelatedEntry {
    project: String,
    change_id: String,
    #[serde(default)]
    branch: Option<String>,
    status: ChangeStatus,
    commit: RelatedCommit,
}

#[derive(Debug, Deserialize)]
struct RelatedCommit {
    commit: String,
}

const CHANGE_OPTIONS: &str = "o=CURRENT_REVISION&o=CURRENT_COMMIT&o=DETAILED_ACCOUNTS";

#[async_trait]
impl GerritApi for RestGerrit {
    async fn validate_branch(
        &self,
        project: &str,
        branch: &Branch,
    ) -> GerritResult<Option<RevisionId>> {
        let path = format!("/projects/{}/branches/{}", encode_project(project), branch);
        let Some(body) = self.send(self.request(Method::GET, &path)).await? else {
            return Ok(None);
        };
        let parsed: BranchResponse = Self::decode(&body)?;
        Ok(Some(RevisionId::new(parsed.revision)))
    }

    async fn query_change(&self, key: &ChangeKey) -> GerritResult<Option<ChangeInfo>> {
        let path = format!("/changes/{}?{}", encode_key(key), CHANGE_OPTIONS);
        let Some(body) = self.send(self.request(Method::GET, &path)).await? else {
            return Ok(None);
        };
        let parsed: ChangeResponse = Self::decode(&body)?;
        parsed.into_info().map(Some)
    }

    async fn query_change_by_revision(
        &self,
        project: &str,
        revision: &RevisionId,
    ) -> GerritResult<Option<ChangeInfo>> {
        let path = format!(
            "/changes/?q=commit:{}+project:{}&{}",
            revision,
            encode_project(project),
            CHANGE_OPTIONS
        );
        let Some(body) = self.send(self.request(Method::GET, &path)).await? else {
            return Ok(None);
        };
        let mut parsed: Vec<ChangeResponse> = Self::decode(&body)?;
        match parsed.pop() {
            Some(change) => change.into_info().map(Some),
            None => Ok(None),
        }
    }

    async fn query_related(&self, key: &ChangeKey) -> GerritResult<Vec<RelatedChange>> {
        let path = format!("/changes/{}/revisions/current/related", encode_key(key));
        let Some(body) = self.send(self.request(Method::GET, &path)).await? else {
            return Ok(Vec::new());
        };
        let parsed: RelatedResponse = Self::decode(&body)?;
        Ok(parsed
            .changes
            .into_iter()
            .map(|entry| RelatedChange {
                key: ChangeKey::new(
                    entry.project,
                    entry.branch.unwrap_or_else(|| key.branch.as_str().to_string()),
                    entry.change_id,
                ),
                revision: RevisionId::new(entry.commit.commit),
                status: entry.status,
            })
            .collect())
    }

    async fn query_pick(
        &self,
        project: &str,
        id: &ChangeId,
        branch: &Branch,
    ) -> GerritResult<Option<ChangeInfo>> {
        let path = format!(
            "/changes/?q=change:{}+project:{}+branch:{}&{}",
            id,
            encode_project(project),
            branch,
            CHANGE_OPTIONS
        );
        let Some(body) = self.send(self.request(Method::GET, &path)).await? else {
            return Ok(None);
        };
        let mut parsed: Vec<ChangeResponse> = Self::decode(&body)?;
        match parsed.pop() {
            Some(change) => change.into_info().map(Some),
            None => Ok(None),
        }
    }

    async fn generate_cherry_pick(
        &self,
        source: &ChangeKey,
        parent_revision: &RevisionId,
        target: &Branch,
    ) -> GerritResult<CherryPickCreated> {
        let path = format!("/changes/{}/revisions/current/cherrypick", encode_key(source));
        let payload = json!({
            "destination": target.as_str(),
            "base": parent_revision.as_str(),
            "allow_conflicts": true,
            "keep_reviewers": true,
        });
        let body = self
            .send(self.request(Method::POST, &path).json(&payload))
            .await?
            .ok_or_else(|| GerritError::not_found(format!("change {source} not found")))?;
        let parsed: ChangeResponse = Self::decode(&body)?;
        let conflicts = parsed.contains_git_conflicts;
        let info = parsed.into_info()?;
        Ok(CherryPickCreated {
            key: info.key,
            conflicts,
        })
    }

    async fn set_approval(&self, key: &ChangeKey) -> GerritResult<()> {
        let path = format!("/changes/{}/revisions/current/review", encode_key(key));
        let payload = json!({ "labels": { "Code-Review": 2 } });
        self.send(self.request(Method::POST, &path).json(&payload))
            .await?
            .ok_or_else(|| GerritError::not_found(format!("change {key} not found")))?;
        Ok(())
    }

    async fn stage_change(&self, key: &ChangeKey) -> GerritResult<()> {
        let path = format!("/changes/{}/stage", encode_key(key));
        self.send(self.request(Method::POST, &path).json(&json!({})))
            .await?
            .ok_or_else(|| GerritError::not_found(format!("change {key} not found")))?;
        Ok(())
    }

    async fn post_comment(&self, key: &ChangeKey, message: &str) -> GerritResult<()> {
        let path = format!("/changes/{}/revisions/current/review", encode_key(key));
        let payload = json!({ "message": message });
        self.send(self.request(Method::POST, &path).json(&payload))
            .await?
            .ok_or_else(|| GerritError::not_found(format!("change {key} not found")))?;
        Ok(())
    }

    async fn add_reviewers(&self, key: &ChangeKey, reviewers: &[String]) -> GerritResult<()> {
        for reviewer in reviewers {
            let path = format!("/changes/{}/reviewers", encode_key(key));
            let payload = json!({ "reviewer": reviewer });
            self.send(self.request(Method::POST, &path).json(&payload))
                .await?;
        }
        Ok(())
    }

    async fn set_assignee(&self, key: &ChangeKey, assignee: &str) -> GerritResult<()> {
        let path = format!("/changes/{}/assignee", encode_key(key));
        let payload = json!({ "assignee": assignee });
        self.send(self.request(Method::PUT, &path).json(&payload))
            .await?
            .ok_or_else(|| GerritError::not_found(format!("change {key} not found")))?;
        Ok(())
    }
}

/// Encodes a change key for use as a URL path segment.
fn encode_key(key: &ChangeKey) -> String {
    format!(
        "{}~{}~{}",
        encode_project(&key.project),
        key.branch,
        key.id
    )
}
