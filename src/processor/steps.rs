//! Branch-agnostic step primitives shared by both managers.

use tracing::{info, warn};

use crate::engine::signal::{Signal, Step};
use crate::engine::Core;
use crate::gerrit::{ChangeStatus, GerritErrorKind};
use crate::listeners::{ListenerRecord, TimeoutSpec, PARENT_WAIT_TIMEOUT};
use crate::processor::StepError;
use crate::types::{
    Branch, ChangeKey, EventKey, EventKind, ProcessingRecord, RevisionId, TerminalOutcome,
};

/// Confirms the target branch exists, returning its head revision. A missing
/// branch is terminal: the owner is told and the branch finished as
/// `InvalidBranch`.
pub(crate) async fn validated_branch_head(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
) -> Result<Option<RevisionId>, StepError> {
    match core
        .gerrit
        .validate_branch(&record.event.project, branch)
        .await?
    {
        Some(head) => Ok(Some(head)),
        None => {
            core.comment(
                &record.change_key,
                &format!(
                    "Cannot cherry-pick this change to {branch}: the branch does not exist. \
                     Please check the Pick-to footer."
                ),
            )
            .await;
            core.finish_branch(record.run_id, branch, TerminalOutcome::InvalidBranch)
                .await?;
            Ok(None)
        }
    }
}

/// Creates the replica on `branch`, based on `parent`.
pub(crate) async fn create_pick(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    parent: &RevisionId,
) -> Result<(), StepError> {
    core.updates
        .update(record.run_id, |r| {
            r.progress_mut(branch).parent_revision = Some(parent.clone());
        })
        .await?;

    match core
        .gerrit
        .generate_cherry_pick(&record.change_key, parent, branch)
        .await
    {
        Ok(created) => {
            info!(
                run_id = %record.run_id,
                pick = %created.key,
                conflicts = created.conflicts,
                "cherry-pick created"
            );
            core.updates
                .update(record.run_id, |r| {
                    r.progress_mut(branch).pick = Some(created.key.clone());
                })
                .await?;
            core.send(Signal::new(
                record.run_id,
                Step::PickCreated {
                    branch: branch.clone(),
                    pick: created.key,
                    conflicts: created.conflicts,
                },
            ));
            Ok(())
        }
        // Transient and protocol failures bubble up: retry or escalation.
        Err(e) if e.is_transient() || e.kind == GerritErrorKind::Protocol => Err(e.into()),
        Err(e) => {
            core.comment(
                &record.change_key,
                &format!(
                    "Failed to cherry-pick this change to {branch}: {}. \
                     Please create the cherry-pick manually.",
                    e.message
                ),
            )
            .await;
            core.finish_branch(record.run_id, branch, TerminalOutcome::PickFailed)
                .await?;
            Ok(())
        }
    }
}

/// Routes a freshly created replica: conflicted picks go to a human, clean
/// ones continue to approval.
pub(crate) async fn pick_created(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    pick: &ChangeKey,
    conflicts: bool,
) -> Result<(), StepError> {
    if !conflicts {
        core.send(Signal::new(
            record.run_id,
            Step::ApprovePick {
                branch: branch.clone(),
                pick: pick.clone(),
            },
        ));
        return Ok(());
    }

    // Hand the conflicted pick to the people who know the change.
    if let Err(error) = core.gerrit.set_assignee(pick, &record.event.owner).await {
        warn!(pick = %pick, %error, "cannot assign conflicted pick");
    }
    let reviewers = source_reviewers(core, record).await;
    if !reviewers.is_empty() {
        if let Err(error) = core.gerrit.add_reviewers(pick, &reviewers).await {
            warn!(pick = %pick, %error, "cannot add reviewers to conflicted pick");
        }
    }
    core.comment(
        pick,
        &format!(
            "This cherry-pick of {} was created with conflict markers. \
             Please resolve the conflicts, then approve and stage it manually.",
            record.change_key
        ),
    )
    .await;
    core.finish_branch(record.run_id, branch, TerminalOutcome::MergeConflicts)
        .await?;
    Ok(())
}

/// Applies the bot's approval. The bot account is trusted, so a definite
/// rejection here is abnormal and goes straight to a human.
pub(crate) async fn approve_pick(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    pick: &ChangeKey,
) -> Result<(), StepError> {
    match core.gerrit.set_approval(pick).await {
        Ok(()) => {
            core.send(Signal::new(
                record.run_id,
                Step::StagingReadyCheck {
                    branch: branch.clone(),
                    pick: pick.clone(),
                },
            ));
            Ok(())
        }
        Err(e) if e.is_transient() => Err(e.into()),
        Err(e) => {
            core.alert_admin(&format!(
                "approval of {pick} was rejected: {e}; the bot account may be misconfigured"
            ));
            let reviewers = source_reviewers(core, record).await;
            if !reviewers.is_empty() {
                if let Err(error) = core.gerrit.add_reviewers(pick, &reviewers).await {
                    warn!(pick = %pick, %error, "cannot add reviewers");
                }
            }
            core.comment(
                pick,
                "The bot could not approve this cherry-pick automatically. \
                 Please review, approve and stage it manually.",
            )
            .await;
            core.finish_branch(record.run_id, branch, TerminalOutcome::NeedsHuman)
                .await?;
            Ok(())
        }
    }
}

/// Checks whether the replica's own base commit allows staging yet. A base
/// that is still in review suspends the branch on that change's
/// staged/merged/abandoned signals instead of polling.
pub(crate) async fn staging_ready_check(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    pick: &ChangeKey,
) -> Result<(), StepError> {
    let info = core
        .gerrit
        .query_change(pick)
        .await?
        .ok_or_else(|| crate::gerrit::GerritError::protocol(format!("pick {pick} vanished")))?;

    let blocker = match info.parent {
        None => None,
        Some(parent_revision) => {
            core.gerrit
                .query_change_by_revision(&record.event.project, &parent_revision)
                .await?
        }
    };

    match blocker {
        // Based directly on a branch head, or on something already heading in.
        None => {
            stage_now(core, record, branch, pick);
            Ok(())
        }
        Some(base) if !matches!(base.status, ChangeStatus::New | ChangeStatus::Abandoned) => {
            stage_now(core, record, branch, pick);
            Ok(())
        }
        Some(base) if base.status == ChangeStatus::Abandoned => {
            core.comment(
                pick,
                &format!(
                    "This cherry-pick is based on {}, which has been abandoned. \
                     Please rebase it and stage manually.",
                    base.key
                ),
            )
            .await;
            core.finish_branch(record.run_id, branch, TerminalOutcome::NeedsHuman)
                .await?;
            Ok(())
        }
        Some(base) => {
            // Still in review. Wake on whichever signal arrives first.
            let recheck = Step::StagingReadyCheck {
                branch: branch.clone(),
                pick: pick.clone(),
            };
            let keys: Vec<EventKey> = [
                EventKind::ChangeStaged,
                EventKind::ChangeMerged,
                EventKind::ChangeAbandoned,
            ]
            .into_iter()
            .map(|kind| EventKey::for_change(kind, &base.key))
            .collect();

            let mut armed_any = false;
            for key in &keys {
                let siblings = keys.iter().filter(|k| *k != key).cloned().collect();
                let mut listener = ListenerRecord::new(record.run_id, key.clone(), recheck.clone())
                    .cancelling(siblings);
                // Bound the wait: a base change nobody touches again must not
                // suspend the branch forever. One timeout covers the trio;
                // expiry disarms the siblings.
                if key.kind == EventKind::ChangeStaged {
                    listener = listener.with_timeout(TimeoutSpec {
                        after_secs: PARENT_WAIT_TIMEOUT.as_secs(),
                        comment_on: pick.clone(),
                        comment: format!(
                            "The base change {} was not staged or merged within 48 hours. \
                             Please resolve its state, then stage this cherry-pick manually.",
                            base.key
                        ),
                        outcome: TerminalOutcome::NeedsHuman,
                    });
                }
                armed_any |= core.arm_listener(listener).await?;
            }
            if armed_any {
                core.comment(
                    pick,
                    &format!(
                        "This cherry-pick is ready, but its base change {} has not been \
                         staged or merged yet. Staging will happen automatically once it is.",
                        base.key
                    ),
                )
                .await;
            }
            Ok(())
        }
    }
}

fn stage_now(core: &Core, record: &ProcessingRecord, branch: &Branch, pick: &ChangeKey) {
    core.send(Signal::new(
        record.run_id,
        Step::StagePick {
            branch: branch.clone(),
            pick: pick.clone(),
        },
    ));
}

/// Queues the approved replica for integration.
pub(crate) async fn stage_pick(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    pick: &ChangeKey,
) -> Result<(), StepError> {
    match core.gerrit.stage_change(pick).await {
        Ok(()) => {
            info!(run_id = %record.run_id, pick = %pick, "pick staged");
            core.comment(
                &record.change_key,
                &format!("Cherry-pick to {branch} has been staged: {pick}"),
            )
            .await;
            core.finish_branch(record.run_id, branch, TerminalOutcome::Staged)
                .await?;
            Ok(())
        }
        Err(e) if e.is_transient() => Err(e.into()),
        Err(e) => {
            core.comment(
                pick,
                &format!(
                    "Staging this cherry-pick failed: {}. Please stage it manually.",
                    e.message
                ),
            )
            .await;
            core.finish_branch(record.run_id, branch, TerminalOutcome::NeedsHuman)
                .await?;
            Ok(())
        }
    }
}

/// Reviewer addresses of the source change, best effort.
async fn source_reviewers(core: &Core, record: &ProcessingRecord) -> Vec<String> {
    match core.gerrit.query_change(&record.change_key).await {
        Ok(Some(info)) => info.reviewers,
        Ok(None) => Vec::new(),
        Err(error) => {
            warn!(change = %record.change_key, %error, "cannot fetch source reviewers");
            Vec::new()
        }
    }
}
