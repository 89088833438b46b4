//! Startup state recovery.
//!
//! A restart must never strand a run. Boot order:
//!
//! 1. Discard leftover retry rows — resumption relies on record and listener
//!    state, not on stale retry tasks.
//! 2. Reconcile each `processing` record's pick counter against its actual
//!    non-terminal branch count. A crash between a terminal-status write and
//!    the counter decrement leaves the two out of step; a record whose
//!    branches are all terminal is completed here instead of stranded.
//! 3. Re-arm every persisted listener, with the remaining timeout computed
//!    from its original arm timestamp.
//! 4. For every non-terminal branch of a `processing` record, re-emit its
//!    last recorded step. A branch whose persisted step no longer decodes is
//!    orphaned: force-completed with a warning instead of left stuck.
//! 5. Re-emit classification for records still in `new` (crash between
//!    ingestion and the first signal).

use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::signal::{Signal, Step};
use crate::engine::Core;
use crate::listeners::ListenerRecord;
use crate::store::StoreError;
use crate::types::{ProcessingRecord, RecordState, TerminalOutcome};

/// What recovery found and did, for the boot log.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub retries_discarded: usize,
    pub counters_reconciled: usize,
    pub listeners_restored: usize,
    pub branches_resumed: usize,
    pub branches_orphaned: usize,
    pub records_reclassified: usize,
}

pub async fn run(core: &Arc<Core>) -> Result<RecoverySummary, StoreError> {
    let mut summary = RecoverySummary {
        retries_discarded: core.store.clear_retries()?,
        ..RecoverySummary::default()
    };

    for record in core.store.records_in_state(RecordState::Processing)? {
        let non_terminal = record.non_terminal_branches();
        if non_terminal != record.picks_remaining {
            warn!(
                run_id = %record.run_id,
                stored = record.picks_remaining,
                actual = non_terminal,
                "pick counter out of step with branch states; reconciling"
            );
            core.store.set_pick_count(record.run_id, non_terminal)?;
            summary.counters_reconciled += 1;
        }
        if non_terminal == 0 {
            // Every branch already terminal; nothing left to drive.
            core.store.set_state(record.run_id, RecordState::Complete)?;
            continue;
        }
        resume_record(core, &record, &mut summary).await?;
    }

    for record in core.store.records_in_state(RecordState::New)? {
        core.send(Signal::new(record.run_id, Step::DetermineProcessingPath));
        summary.records_reclassified += 1;
    }

    info!(
        retries_discarded = summary.retries_discarded,
        counters_reconciled = summary.counters_reconciled,
        listeners_restored = summary.listeners_restored,
        branches_resumed = summary.branches_resumed,
        branches_orphaned = summary.branches_orphaned,
        records_reclassified = summary.records_reclassified,
        "startup recovery finished"
    );
    Ok(summary)
}

async fn resume_record(
    core: &Arc<Core>,
    record: &ProcessingRecord,
    summary: &mut RecoverySummary,
) -> Result<(), StoreError> {
    // Restore listeners first: a branch with a live wait must not also be
    // re-driven from its last step.
    let mut waiting_branches = Vec::new();
    let mut dead_listener_keys = Vec::new();
    for (storage_key, value) in &record.listeners {
        match serde_json::from_value::<ListenerRecord>(value.clone()) {
            Ok(listener) => {
                if let Some(branch) = listener.follow_up.branch() {
                    waiting_branches.push(branch.clone());
                }
                // An already-expired timeout fires through the normal path.
                core.listeners.arm(listener);
                summary.listeners_restored += 1;
            }
            Err(error) => {
                warn!(
                    run_id = %record.run_id,
                    storage_key,
                    %error,
                    "dropping undecodable persisted listener"
                );
                dead_listener_keys.push(storage_key.clone());
            }
        }
    }
    if !dead_listener_keys.is_empty() {
        core.updates
            .update(record.run_id, |r| {
                for key in &dead_listener_keys {
                    r.listeners.remove(key);
                }
            })
            .await?;
    }

    for (branch, progress) in &record.branches {
        if progress.status.is_terminal() || waiting_branches.contains(branch) {
            continue;
        }
        let step = progress
            .last_step
            .clone()
            .map(serde_json::from_value::<Step>);
        match step {
            Some(Ok(step)) => {
                core.send(Signal::new(record.run_id, step));
                summary.branches_resumed += 1;
            }
            Some(Err(error)) => {
                warn!(
                    run_id = %record.run_id,
                    %branch,
                    %error,
                    "orphaned branch: persisted step no longer decodes"
                );
                core.finish_branch(record.run_id, branch, TerminalOutcome::Orphaned)
                    .await?;
                summary.branches_orphaned += 1;
            }
            None => {
                warn!(
                    run_id = %record.run_id,
                    %branch,
                    "orphaned branch: no persisted step"
                );
                core.finish_branch(record.run_id, branch, TerminalOutcome::Orphaned)
                    .await?;
                summary.branches_orphaned += 1;
            }
        }
    }
    Ok(())
}
