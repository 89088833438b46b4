//! Persisted per-run state: `ProcessingRecord` and its per-branch progress map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::{Branch, ChangeKey, RevisionId, RunId};
use super::merge_event::MergeEvent;

/// Aggregate state of one processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Persisted at ingestion, not yet picked up by the engine.
    New,
    /// The engine is driving at least one branch forward.
    Processing,
    /// Abandoned before completion (fatal classification error).
    Discarded,
    /// Every target branch reached a terminal state.
    Complete,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::New => "new",
            RecordState::Processing => "processing",
            RecordState::Discarded => "discarded",
            RecordState::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<RecordState> {
        match s {
            "new" => Some(RecordState::New),
            "processing" => Some(RecordState::Processing),
            "discarded" => Some(RecordState::Discarded),
            "complete" => Some(RecordState::Complete),
            _ => None,
        }
    }
}

/// Why a branch stopped being worked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalOutcome {
    /// The replica was approved and queued for integration.
    Staged,
    /// The target branch does not exist.
    InvalidBranch,
    /// The replica applied with conflicts and was handed to a human.
    MergeConflicts,
    /// The review system rejected the pick for a non-transient reason.
    PickFailed,
    /// A parent-wait listener expired without the awaited condition.
    ParentWaitExpired,
    /// An operation the bot expected to always succeed was rejected; a human
    /// has been asked to finish the branch.
    NeedsHuman,
    /// Restored from disk with a step the engine could not decode.
    Orphaned,
}

/// Progress status of one target branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "outcome")]
pub enum BranchStatus {
    InProgress,
    Terminal(TerminalOutcome),
}

impl BranchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BranchStatus::Terminal(_))
    }
}

impl Default for BranchStatus {
    fn default() -> Self {
        BranchStatus::InProgress
    }
}

/// Per-target-branch state inside a `ProcessingRecord`.
///
/// `last_step` holds the serialized continuation (`engine::signal::Step`) the
/// branch most recently entered. It is stored as raw JSON so that a record
/// written by a newer build can still be loaded; a step that fails to decode
/// at recovery orphans only its own branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BranchProgress {
    /// Serialized last-entered step, for restart recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step: Option<serde_json::Value>,

    /// The revision the pick will be (or was) created on, once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_revision: Option<RevisionId>,

    /// The replica's key, once it exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pick: Option<ChangeKey>,

    #[serde(default)]
    pub status: BranchStatus,
}

impl BranchProgress {
    pub fn new() -> Self {
        BranchProgress {
            last_step: None,
            parent_revision: None,
            pick: None,
            status: BranchStatus::InProgress,
        }
    }
}

/// One row of the processing queue: the full persisted state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub run_id: RunId,

    /// Key of the merged source change.
    pub change_key: ChangeKey,

    pub state: RecordState,

    /// The revision that merged (what the picks are taken from).
    pub revision: RevisionId,

    /// The originating merge event, verbatim.
    pub event: MergeEvent,

    /// Per-target-branch progress. Keys are target branch names.
    pub branches: BTreeMap<Branch, BranchProgress>,

    /// Number of branches not yet in a terminal state.
    pub picks_remaining: i64,

    /// Persisted pending listeners, keyed by `"<event-kind>|<context>"`.
    /// Values are serialized `listeners::ListenerRecord`s.
    pub listeners: BTreeMap<String, serde_json::Value>,
}

impl ProcessingRecord {
    /// A fresh record as created at webhook ingestion.
    pub fn new(event: MergeEvent) -> Self {
        ProcessingRecord {
            run_id: RunId::new(),
            change_key: event.key(),
            state: RecordState::New,
            revision: event.revision.clone(),
            event,
            branches: BTreeMap::new(),
            picks_remaining: 0,
            listeners: BTreeMap::new(),
        }
    }

    pub fn progress(&self, branch: &Branch) -> Option<&BranchProgress> {
        self.branches.get(branch)
    }

    pub fn progress_mut(&mut self, branch: &Branch) -> &mut BranchProgress {
        self.branches.entry(branch.clone()).or_default()
    }

    /// Marks a branch terminal. Returns `true` if the branch was previously
    /// non-terminal (i.e. the caller must decrement the pick counter),
    /// `false` if this is a duplicate transition.
    pub fn finish_branch(&mut self, branch: &Branch, outcome: TerminalOutcome) -> bool {
        let progress = self.progress_mut(branch);
        if progress.status.is_terminal() {
            return false;
        }
        progress.status = BranchStatus::Terminal(outcome);
        true
    }

    /// Number of branches currently not in a terminal state.
    pub fn non_terminal_branches(&self) -> i64 {
        self.branches
            .values()
            .filter(|p| !p.status.is_terminal())
            .count() as i64
    }
}
