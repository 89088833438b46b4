//! Serializable continuations.
//!
//! The engine advances a run in small resumable steps. A [`Step`] names the
//! next action and carries its arguments; a [`Signal`] pairs one with the run
//! it belongs to. Steps are serialized into the owning record's branch
//! progress before execution, so that a process restart can re-dispatch the
//! suspended step instead of re-deriving it.
//!
//! The JSON form is a tagged union (`{"name": ..., "args": {...}}`), kept
//! stable because persisted rows outlive any one build.

use serde::{Deserialize, Serialize};

use crate::types::{Branch, ChangeKey, EventKey, RevisionId, RunId};

/// One resumable unit of work within a processing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "camelCase")]
pub enum Step {
    /// Classify the source change (standalone vs. part of a relation chain)
    /// and fan out per-branch start steps.
    DetermineProcessingPath,

    /// Begin work on one branch of a standalone change.
    SingleBranchStart { branch: Branch },

    /// Begin work on one branch of a chained change.
    ChainBranchStart { branch: Branch },

    /// Check whether the chained parent's replica exists on `branch` yet.
    /// `attempt` counts pick-lookup retries (0 = first look).
    VerifyParent { branch: Branch, attempt: u32 },

    /// The direct parent cannot provide a base; walk further ancestors.
    ParentFallback { branch: Branch },

    /// Create the cherry-pick on `branch`, based on `parent`.
    CreatePick { branch: Branch, parent: RevisionId },

    /// The pick exists; route on whether it carries conflict markers.
    PickCreated {
        branch: Branch,
        pick: ChangeKey,
        conflicts: bool,
    },

    /// Apply the bot's approval to a conflict-free pick.
    ApprovePick { branch: Branch, pick: ChangeKey },

    /// Decide whether the pick's base commit allows staging yet.
    StagingReadyCheck { branch: Branch, pick: ChangeKey },

    /// Queue the approved pick for automated integration.
    StagePick { branch: Branch, pick: ChangeKey },
}

impl Step {
    /// The branch this step operates on, if it is branch-scoped.
    pub fn branch(&self) -> Option<&Branch> {
        match self {
            Step::DetermineProcessingPath => None,
            Step::SingleBranchStart { branch }
            | Step::ChainBranchStart { branch }
            | Step::VerifyParent { branch, .. }
            | Step::ParentFallback { branch }
            | Step::CreatePick { branch, .. }
            | Step::PickCreated { branch, .. }
            | Step::ApprovePick { branch, .. }
            | Step::StagingReadyCheck { branch, .. }
            | Step::StagePick { branch, .. } => Some(branch),
        }
    }
}

/// A step addressed to its owning run. The unit of dispatch, retry
/// persistence, and listener follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub run_id: RunId,
    pub step: Step,
}

impl Signal {
    pub fn new(run_id: RunId, step: Step) -> Self {
        Signal { run_id, step }
    }
}

/// Everything the engine's dispatch loop consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// A continuation to execute.
    Signal(Signal),

    /// An inbound review-system event, already keyed.
    Event(EventKey),

    /// A listener's arm period elapsed without its event.
    ListenerTimeout(EventKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_json_shape_is_stable() {
        let step = Step::CreatePick {
            branch: Branch::new("6.5"),
            parent: RevisionId::new("cafebabe"),
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "createPick",
                "args": {"branch": "6.5", "parent": "cafebabe"}
            })
        );
    }

    #[test]
    fn unit_step_has_no_args() {
        let json = serde_json::to_value(Step::DetermineProcessingPath).unwrap();
        assert_eq!(json, serde_json::json!({"name": "determineProcessingPath"}));
    }

    #[test]
    fn signal_roundtrips() {
        let signal = Signal::new(
            RunId::new(),
            Step::VerifyParent {
                branch: Branch::new("6.2"),
                attempt: 1,
            },
        );
        let json = serde_json::to_string(&signal).unwrap();
        let parsed: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, signal);
    }

    #[test]
    fn branch_extraction() {
        assert!(Step::DetermineProcessingPath.branch().is_none());
        let step = Step::StagePick {
            branch: Branch::new("6.5"),
            pick: ChangeKey::new("qt/base", "6.5", "Iabc"),
        };
        assert_eq!(step.branch().map(Branch::as_str), Some("6.5"));
    }

    #[test]
    fn unknown_step_name_fails_to_decode() {
        // Recovery relies on a decode failure (not a panic) for steps written
        // by a different build.
        let result: Result<Step, _> =
            serde_json::from_value(serde_json::json!({"name": "flyToTheMoon"}));
        assert!(result.is_err());
    }
}
