//! Relation chain manager: drives a branch of a change that depends on a
//! parent in a dependency chain.
//!
//! The invariant this module protects: a replica is never created against a
//! parent that itself lacks (and will never get) a replica on the same
//! branch. The pick therefore waits for the parent's replica, falls back to
//! the nearest suitable ancestor, or — when nothing in the chain can provide
//! a base — lands on the branch head with the owner notified.

use tracing::{info, warn};

use crate::engine::signal::{Signal, Step};
use crate::engine::Core;
use crate::listeners::{ListenerRecord, TimeoutSpec, PARENT_WAIT_TIMEOUT};
use crate::processor::{branch_policy, immediate_ancestor, single, steps, StepError};
use crate::types::{
    merge_event::parse_pick_to, Branch, ChangeKey, EventKey, EventKind, ProcessingRecord,
    TerminalOutcome,
};
use crate::gerrit::{ChangeInfo, ChangeStatus};

/// Entry point for one branch of a chained change: folds the parent's own
/// pick footer into the decision, notifies advisory gaps, and hands off to
/// parent verification.
pub(crate) async fn start(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
) -> Result<(), StepError> {
    let related = core.gerrit.query_related(&record.change_key).await?;
    let Some(ancestor) = immediate_ancestor(&related, &record.change_key) else {
        // The chain dissolved between classification and now.
        return single::start(core, record, branch).await;
    };

    let Some(parent) = core.gerrit.query_change(&ancestor.key).await? else {
        warn!(parent = %ancestor.key, "chain parent unknown to the review system");
        core.send(Signal::new(
            record.run_id,
            Step::ParentFallback {
                branch: branch.clone(),
            },
        ));
        return Ok(());
    };

    // Branches the parent is reaching: its own branch plus its footer.
    let mut parent_reach = vec![parent.key.branch.clone()];
    parent_reach.extend(parse_pick_to(&parent.commit_message));

    if !parent_reach.contains(branch) {
        core.comment(
            &record.change_key,
            &format!(
                "Cannot cherry-pick this change to {branch}: it depends on {}, which is \
                 not being picked there. Add {branch} to the parent's Pick-to footer and \
                 pick both manually, or drop the dependency.",
                parent.key
            ),
        )
        .await;
        core.finish_branch(record.run_id, branch, TerminalOutcome::PickFailed)
            .await?;
        return Ok(());
    }

    let own_targets = record.event.pick_targets();
    let gaps = branch_policy::missing_intermediates(
        &record.event.branch,
        branch,
        &parent_reach,
        &own_targets,
    );
    if !gaps.is_empty() {
        let names: Vec<&str> = gaps.iter().map(Branch::as_str).collect();
        core.comment(
            &record.change_key,
            &format!(
                "Note: the change this depends on is also picked to {}, which this \
                 change skips. If that is unintentional, extend the Pick-to footer.",
                names.join(", ")
            ),
        )
        .await;
    }

    if steps::validated_branch_head(core, record, branch).await?.is_none() {
        return Ok(());
    }
    core.send(Signal::new(
        record.run_id,
        Step::VerifyParent {
            branch: branch.clone(),
            attempt: 0,
        },
    ));
    Ok(())
}

/// Walks one commit-parent upward and checks whether that parent already has
/// a replica on the target branch. The crux of chain correctness.
pub(crate) async fn verify_parent(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    attempt: u32,
) -> Result<(), StepError> {
    let parent = match commit_parent_change(core, record).await? {
        Some(parent) => parent,
        None => {
            // The merged revision sits directly on the branch (or on a commit
            // outside review). Nothing to wait for.
            return pick_on_branch_head(core, record, branch).await;
        }
    };

    match parent.status {
        ChangeStatus::Merged => {
            let replica = core
                .gerrit
                .query_pick(&record.event.project, &parent.key.id, branch)
                .await?;
            match replica {
                Some(replica) if replica.status != ChangeStatus::Abandoned => {
                    core.send(Signal::new(
                        record.run_id,
                        Step::CreatePick {
                            branch: branch.clone(),
                            parent: replica.current_revision,
                        },
                    ));
                    Ok(())
                }
                Some(_) => {
                    // The parent's replica was abandoned; look further up.
                    core.send(Signal::new(
                        record.run_id,
                        Step::ParentFallback {
                            branch: branch.clone(),
                        },
                    ));
                    Ok(())
                }
                None => parent_not_picked(core, record, branch, &parent, attempt).await,
            }
        }
        ChangeStatus::Abandoned => {
            core.send(Signal::new(
                record.run_id,
                Step::ParentFallback {
                    branch: branch.clone(),
                },
            ));
            Ok(())
        }
        // NEW / STAGED / INTEGRATING: the parent has not merged yet.
        _ => await_parent_merge(core, record, branch, &parent).await,
    }
}

/// The parent merged, but its replica on `branch` does not exist yet.
async fn parent_not_picked(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    parent: &ChangeInfo,
    attempt: u32,
) -> Result<(), StepError> {
    if !parse_pick_to(&parent.commit_message).contains(branch) {
        // The parent never intends to reach this branch.
        core.send(Signal::new(
            record.run_id,
            Step::ParentFallback {
                branch: branch.clone(),
            },
        ));
        return Ok(());
    }

    if attempt == 0 {
        // Race window: the parent's own run may be creating the replica
        // right now. Look once more after the retry delay.
        info!(
            run_id = %record.run_id,
            parent = %parent.key,
            %branch,
            "parent replica not found yet; retrying once"
        );
        core.retry.schedule(&Signal::new(
            record.run_id,
            Step::VerifyParent {
                branch: branch.clone(),
                attempt: 1,
            },
        ))?;
        return Ok(());
    }

    // Wait for the replica to appear. Cherry-picks always start life as
    // patchset 1, so its creation event is keyed by the predictable identity.
    let replica_key = parent.key.on_branch(branch);
    let listener = ListenerRecord::new(
        record.run_id,
        EventKey::for_change(EventKind::PatchsetCreated, &replica_key),
        Step::VerifyParent {
            branch: branch.clone(),
            attempt: attempt + 1,
        },
    )
    .with_timeout(give_up_timeout(record, branch, &parent.key));

    if core.arm_listener(listener).await? {
        core.comment(
            &record.change_key,
            &format!(
                "Cherry-pick to {branch} is waiting for the cherry-pick of {} \
                 (which this change depends on) to appear there.",
                parent.key
            ),
        )
        .await;
    }
    Ok(())
}

/// The parent has not merged. Suspend until it merges or is abandoned.
async fn await_parent_merge(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
    parent: &ChangeInfo,
) -> Result<(), StepError> {
    let merged_key = EventKey::for_change(EventKind::ChangeMerged, &parent.key);
    let abandoned_key = EventKey::for_change(EventKind::ChangeAbandoned, &parent.key);

    let on_merge = ListenerRecord::new(
        record.run_id,
        merged_key.clone(),
        Step::VerifyParent {
            branch: branch.clone(),
            attempt: 0,
        },
    )
    .cancelling(vec![abandoned_key.clone()])
    .with_timeout(give_up_timeout(record, branch, &parent.key));

    let on_abandon = ListenerRecord::new(
        record.run_id,
        abandoned_key,
        Step::ParentFallback {
            branch: branch.clone(),
        },
    )
    .cancelling(vec![merged_key]);

    let newly_armed = core.arm_listener(on_merge).await?;
    core.arm_listener(on_abandon).await?;
    if newly_armed {
        core.comment(
            &record.change_key,
            &format!(
                "Cherry-pick to {branch} is waiting for {} (which this change \
                 depends on) to be merged.",
                parent.key
            ),
        )
        .await;
    }
    Ok(())
}

/// The direct parent cannot provide a base. Walk the remaining ancestors for
/// the nearest one carrying (or about to carry) a replica on `branch`; when
/// the chain is exhausted, pick at the branch head and tell the owner.
pub(crate) async fn parent_fallback(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
) -> Result<(), StepError> {
    let related = core.gerrit.query_related(&record.change_key).await?;
    let ancestors = match related
        .iter()
        .position(|entry| entry.key == record.change_key)
    {
        Some(position) => &related[position + 1..],
        None => &[],
    };

    for ancestor in ancestors {
        let replica = core
            .gerrit
            .query_pick(&record.event.project, &ancestor.key.id, branch)
            .await?;
        if let Some(replica) = replica {
            if replica.status != ChangeStatus::Abandoned {
                info!(
                    run_id = %record.run_id,
                    ancestor = %ancestor.key,
                    %branch,
                    "re-parenting onto nearest ancestor replica"
                );
                core.send(Signal::new(
                    record.run_id,
                    Step::CreatePick {
                        branch: branch.clone(),
                        parent: replica.current_revision,
                    },
                ));
                return Ok(());
            }
            continue;
        }

        let Some(info) = core.gerrit.query_change(&ancestor.key).await? else {
            continue;
        };
        if info.status == ChangeStatus::Merged && parse_pick_to(&info.commit_message).contains(branch)
        {
            // About to carry a replica; wait for it.
            let replica_key = ancestor.key.on_branch(branch);
            let listener = ListenerRecord::new(
                record.run_id,
                EventKey::for_change(EventKind::PatchsetCreated, &replica_key),
                Step::ParentFallback {
                    branch: branch.clone(),
                },
            )
            .with_timeout(give_up_timeout(record, branch, &ancestor.key));

            if core.arm_listener(listener).await? {
                core.comment(
                    &record.change_key,
                    &format!(
                        "Cherry-pick to {branch} is waiting for the cherry-pick of the \
                         ancestor change {} to appear there.",
                        ancestor.key
                    ),
                )
                .await;
            }
            return Ok(());
        }
    }

    let Some(head) = steps::validated_branch_head(core, record, branch).await? else {
        return Ok(());
    };
    core.comment(
        &record.change_key,
        &format!(
            "No change this one depends on is picked to {branch}; the cherry-pick \
             will be created directly on the branch head. It may not apply cleanly."
        ),
    )
    .await;
    core.send(Signal::new(
        record.run_id,
        Step::CreatePick {
            branch: branch.clone(),
            parent: head,
        },
    ));
    Ok(())
}

/// Resolves the change owning the first parent commit of this change's
/// merged revision. `None` when that commit is not a change under review.
async fn commit_parent_change(
    core: &Core,
    record: &ProcessingRecord,
) -> Result<Option<ChangeInfo>, StepError> {
    let Some(own) = core.gerrit.query_change(&record.change_key).await? else {
        return Ok(None);
    };
    let Some(parent_revision) = own.parent else {
        return Ok(None);
    };
    Ok(core
        .gerrit
        .query_change_by_revision(&record.event.project, &parent_revision)
        .await?)
}

async fn pick_on_branch_head(
    core: &Core,
    record: &ProcessingRecord,
    branch: &Branch,
) -> Result<(), StepError> {
    let Some(head) = steps::validated_branch_head(core, record, branch).await? else {
        return Ok(());
    };
    core.send(Signal::new(
        record.run_id,
        Step::CreatePick {
            branch: branch.clone(),
            parent: head,
        },
    ));
    Ok(())
}

fn give_up_timeout(record: &ProcessingRecord, branch: &Branch, waited_on: &ChangeKey) -> TimeoutSpec {
    TimeoutSpec {
        after_secs: PARENT_WAIT_TIMEOUT.as_secs(),
        comment_on: record.change_key.clone(),
        comment: format!(
            "Gave up waiting for {waited_on} on {branch} after 48 hours; no cherry-pick \
             was created there. Please cherry-pick manually if it is still wanted."
        ),
        outcome: TerminalOutcome::ParentWaitExpired,
    }
}
