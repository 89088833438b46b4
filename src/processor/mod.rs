//! The request processor: every resumable step of a cherry-pick run.
//!
//! Steps never return results to their caller. Each one performs at most a
//! few collaborator calls, persists what it learned, and re-enters the engine
//! by sending the next [`Step`] as a signal. A step that must wait arms a
//! listener and returns; the follow-up arrives through the same dispatch
//! table hours or days later, possibly in a different process.
//!
//! Transient collaborator failures propagate out of the step as errors; the
//! engine re-schedules the identical signal through the retry processor.
//! Domain rejections are handled inside the step that saw them (comment,
//! terminal branch state).

use thiserror::Error;
use tracing::info;

use crate::engine::signal::{Signal, Step};
use crate::engine::Core;
use crate::gerrit::{GerritError, RelatedChange};
use crate::store::StoreError;
use crate::types::{ChangeKey, ProcessingRecord, RecordState};

pub mod branch_policy;
pub mod chain;
pub mod single;
pub mod steps;

/// A step failed in a way its own logic does not absorb.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Gerrit(#[from] GerritError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StepError {
    /// True when re-running the same signal later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Gerrit(e) if e.is_transient())
    }
}

/// Executes one step against the current record. The single dispatch table
/// every continuation goes through, whether it came from the webhook, a
/// retry, a listener, or startup recovery.
pub async fn run_step(
    core: &Core,
    record: &ProcessingRecord,
    step: Step,
) -> Result<(), StepError> {
    match step {
        Step::DetermineProcessingPath => determine_processing_path(core, record).await,
        Step::SingleBranchStart { branch } => single::start(core, record, &branch).await,
        Step::ChainBranchStart { branch } => chain::start(core, record, &branch).await,
        Step::VerifyParent { branch, attempt } => {
            chain::verify_parent(core, record, &branch, attempt).await
        }
        Step::ParentFallback { branch } => chain::parent_fallback(core, record, &branch).await,
        Step::CreatePick { branch, parent } => {
            steps::create_pick(core, record, &branch, &parent).await
        }
        Step::PickCreated {
            branch,
            pick,
            conflicts,
        } => steps::pick_created(core, record, &branch, &pick, conflicts).await,
        Step::ApprovePick { branch, pick } => {
            steps::approve_pick(core, record, &branch, &pick).await
        }
        Step::StagingReadyCheck { branch, pick } => {
            steps::staging_ready_check(core, record, &branch, &pick).await
        }
        Step::StagePick { branch, pick } => {
            steps::stage_pick(core, record, &branch, &pick).await
        }
    }
}

/// Classifies the merged change and fans out one start signal per target
/// branch. A change with an immediate ancestor in its relation chain goes
/// down the chain path; everything else is standalone.
async fn determine_processing_path(
    core: &Core,
    record: &ProcessingRecord,
) -> Result<(), StepError> {
    let targets = record.event.pick_targets();
    let related = core.gerrit.query_related(&record.change_key).await?;
    let chained = immediate_ancestor(&related, &record.change_key).is_some();

    core.updates
        .update(record.run_id, |r| {
            r.state = RecordState::Processing;
            for target in &targets {
                r.progress_mut(target);
            }
        })
        .await?;
    core.store
        .set_pick_count(record.run_id, targets.len() as i64)?;

    info!(
        run_id = %record.run_id,
        change = %record.change_key,
        targets = targets.len(),
        chained,
        "processing path determined"
    );

    for branch in targets {
        let step = if chained {
            Step::ChainBranchStart { branch }
        } else {
            Step::SingleBranchStart { branch }
        };
        core.send(Signal::new(record.run_id, step));
    }
    Ok(())
}

/// The entry after `key` in a youngest-first relation chain: the change this
/// one directly depends on. `None` when the change stands alone or sits at
/// the bottom of its chain.
pub(crate) fn immediate_ancestor<'a>(
    chain: &'a [RelatedChange],
    key: &ChangeKey,
) -> Option<&'a RelatedChange> {
    let position = chain.iter().position(|entry| &entry.key == key)?;
    chain.get(position + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gerrit::ChangeStatus;
    use crate::types::RevisionId;

    fn entry(id: &str, revision: &str) -> RelatedChange {
        RelatedChange {
            key: ChangeKey::new("qt/base", "dev", id),
            revision: RevisionId::new(revision),
            status: ChangeStatus::Merged,
        }
    }

    #[test]
    fn ancestor_is_the_next_entry() {
        let chain = vec![entry("Ic", "c"), entry("Ib", "b"), entry("Ia", "a")];
        let ancestor =
            immediate_ancestor(&chain, &ChangeKey::new("qt/base", "dev", "Ib")).unwrap();
        assert_eq!(ancestor.key.id.as_str(), "Ia");
    }

    #[test]
    fn bottom_of_chain_has_no_ancestor() {
        let chain = vec![entry("Ib", "b"), entry("Ia", "a")];
        assert!(immediate_ancestor(&chain, &ChangeKey::new("qt/base", "dev", "Ia")).is_none());
    }

    #[test]
    fn absent_change_has_no_ancestor() {
        let chain = vec![entry("Ib", "b")];
        assert!(immediate_ancestor(&chain, &ChangeKey::new("qt/base", "dev", "Iz")).is_none());
    }
}
