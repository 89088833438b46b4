//! The engine: one dispatch loop multiplexing every suspended workflow.
//!
//! All control flow re-enters through [`EngineMessage`]: continuations
//! ([`Signal`]), classified review-system events, and listener timeouts. The
//! loop never blocks; each message is handled on its own task, and a slow
//! collaborator delays only the workflow that called it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gerrit::GerritApi;
use crate::listeners::{Fired, ListenerRecord, ListenerRegistry};
use crate::processor;
use crate::retry::RetryProcessor;
use crate::store::{Store, StoreError, UpdateQueue};
use crate::types::{Branch, ChangeKey, EventKey, ProcessingRecord, RecordState, RunId, TerminalOutcome};

pub mod signal;

pub use signal::{EngineMessage, Signal, Step};

/// Shared engine context handed to every step.
pub struct Core {
    pub store: Store,
    pub gerrit: Arc<dyn GerritApi>,
    pub updates: UpdateQueue,
    pub listeners: ListenerRegistry,
    pub retry: RetryProcessor,
    admin_address: String,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl Core {
    pub fn new(
        store: Store,
        gerrit: Arc<dyn GerritApi>,
        admin_address: String,
        tx: mpsc::UnboundedSender<EngineMessage>,
    ) -> Arc<Core> {
        Arc::new(Core {
            updates: UpdateQueue::new(store.clone()),
            listeners: ListenerRegistry::new(tx.clone()),
            retry: RetryProcessor::new(store.clone(), tx.clone()),
            store,
            gerrit,
            admin_address,
            tx,
        })
    }

    /// Queues a continuation for dispatch.
    pub fn send(&self, signal: Signal) {
        // A closed channel means shutdown; in-flight work is abandoned.
        let _ = self.tx.send(EngineMessage::Signal(signal));
    }

    /// Publishes a classified review-system event to whoever is listening.
    pub fn emit(&self, key: EventKey) {
        let _ = self.tx.send(EngineMessage::Event(key));
    }

    /// Posts a comment, best effort. Comment delivery never decides a
    /// workflow's fate; failures are logged and the step carries on.
    pub async fn comment(&self, key: &ChangeKey, message: &str) {
        if let Err(error) = self.gerrit.post_comment(key, message).await {
            warn!(change = %key, %error, "cannot post comment");
        }
    }

    /// Surfaces a systemic problem to the administrator.
    pub fn alert_admin(&self, message: &str) {
        error!(admin = %self.admin_address, "{message}");
    }

    /// Marks a branch terminal and, if this is its first terminal transition,
    /// decrements the remaining-pick counter (completing the record at zero).
    pub async fn finish_branch(
        &self,
        run_id: RunId,
        branch: &Branch,
        outcome: TerminalOutcome,
    ) -> Result<(), StoreError> {
        let updated = self
            .updates
            .update(run_id, |r| r.finish_branch(branch, outcome))
            .await?;
        match updated {
            Some((_, true)) => {
                let remaining = self.store.decrement_pick_count(run_id)?;
                info!(%run_id, %branch, ?outcome, remaining, "branch finished");
            }
            Some((_, false)) => {
                debug!(%run_id, %branch, "duplicate terminal transition ignored");
            }
            None => warn!(%run_id, "finish_branch on unknown record"),
        }
        Ok(())
    }

    /// Arms a listener and mirrors it into the owning record. Returns whether
    /// the listener was newly armed (`false` for a duplicate key).
    pub async fn arm_listener(&self, listener: ListenerRecord) -> Result<bool, StoreError> {
        let run_id = listener.run_id;
        let storage_key = listener.key.storage_key();
        let encoded = serde_json::to_value(&listener).map_err(|e| StoreError::Storage {
            operation: "encode listener".into(),
            message: e.to_string(),
        })?;

        if !self.listeners.arm(listener) {
            return Ok(false);
        }
        self.updates
            .update(run_id, |r| {
                r.listeners.insert(storage_key, encoded);
            })
            .await?;
        Ok(true)
    }

    async fn unpersist_listeners(&self, run_id: RunId, storage_keys: &[String]) {
        let result = self
            .updates
            .update(run_id, |r| {
                for key in storage_keys {
                    r.listeners.remove(key);
                }
            })
            .await;
        if let Err(error) = result {
            warn!(%run_id, %error, "cannot unpersist listeners");
        }
    }

    /// Runs one continuation to its next suspension point.
    async fn execute(&self, signal: Signal) {
        let run_id = signal.run_id;
        let mut record = match self.store.record_by_run(run_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(%run_id, "signal for unknown record dropped");
                return;
            }
            Err(error) => {
                error!(%run_id, %error, "cannot load record");
                return;
            }
        };
        if matches!(record.state, RecordState::Complete | RecordState::Discarded) {
            debug!(%run_id, state = record.state.as_str(), "signal for finished record dropped");
            return;
        }

        // Persist the step before running it, so a crash mid-step resumes
        // here rather than losing the branch.
        if let Some(branch) = signal.step.branch() {
            if record
                .progress(branch)
                .is_some_and(|p| p.status.is_terminal())
            {
                debug!(%run_id, %branch, "signal for terminal branch dropped");
                return;
            }
            let step_value = match serde_json::to_value(&signal.step) {
                Ok(value) => value,
                Err(error) => {
                    error!(%run_id, %error, "cannot serialize step");
                    return;
                }
            };
            let branch = branch.clone();
            match self
                .updates
                .update(run_id, move |r| {
                    r.progress_mut(&branch).last_step = Some(step_value);
                })
                .await
            {
                Ok(Some((updated, ()))) => record = updated,
                Ok(None) => return,
                Err(error) => {
                    error!(%run_id, %error, "cannot persist step");
                    return;
                }
            }
        }

        match processor::run_step(self, &record, signal.step.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(%run_id, error = %e, "transient failure; scheduling retry");
                if let Err(error) = self.retry.schedule(&signal) {
                    error!(%run_id, %error, "cannot schedule retry");
                    self.alert_admin(&format!("run {run_id} lost a retry: {error}"));
                }
            }
            Err(e) => self.escalate(&record, &signal, e).await,
        }
    }

    /// A step failed in a way nobody absorbs: tell the owner and the admin,
    /// and stop driving the affected scope.
    async fn escalate(&self, record: &ProcessingRecord, signal: &Signal, error: processor::StepError) {
        self.alert_admin(&format!(
            "run {} ({}) failed at an unexpected point: {error}",
            record.run_id, record.change_key
        ));
        match signal.step.branch() {
            Some(branch) => {
                self.comment(
                    &record.change_key,
                    &format!(
                        "An internal error interrupted the cherry-pick to {branch}: {error}. \
                         Please cherry-pick manually."
                    ),
                )
                .await;
                if let Err(store_error) = self
                    .finish_branch(record.run_id, branch, TerminalOutcome::NeedsHuman)
                    .await
                {
                    error!(run_id = %record.run_id, %store_error, "cannot finish branch");
                }
            }
            None => {
                self.comment(
                    &record.change_key,
                    &format!(
                        "This change could not be processed for cherry-picking: {error}. \
                         Please create the cherry-picks manually."
                    ),
                )
                .await;
                if let Err(store_error) = self.store.set_state(record.run_id, RecordState::Discarded)
                {
                    error!(run_id = %record.run_id, %store_error, "cannot discard record");
                }
            }
        }
    }

    /// Acts on a listener that fired or expired.
    async fn on_fired(&self, fired: Fired) {
        let run_id = fired.record.run_id;
        let removed = fired.removed_storage_keys();

        if fired.timed_out {
            if let Some(timeout) = &fired.record.timeout {
                info!(%run_id, key = %fired.record.key, "listener timed out");
                self.comment(&timeout.comment_on, &timeout.comment).await;
                if let Some(branch) = fired.record.follow_up.branch() {
                    if let Err(error) = self.finish_branch(run_id, branch, timeout.outcome).await {
                        error!(%run_id, %error, "cannot finish branch after timeout");
                    }
                }
            }
        } else {
            debug!(%run_id, key = %fired.record.key, "listener fired");
            self.send(Signal::new(run_id, fired.record.follow_up.clone()));
        }
        self.unpersist_listeners(run_id, &removed).await;
    }
}

/// The dispatch loop. Consumes messages until the channel closes or
/// `shutdown` is cancelled; each message runs on its own task.
pub async fn run(
    core: Arc<Core>,
    mut rx: mpsc::UnboundedReceiver<EngineMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            EngineMessage::Signal(signal) => {
                let core = Arc::clone(&core);
                tokio::spawn(async move { core.execute(signal).await });
            }
            EngineMessage::Event(key) => {
                if let Some(fired) = core.listeners.handle_event(&key) {
                    let core = Arc::clone(&core);
                    tokio::spawn(async move { core.on_fired(fired).await });
                }
            }
            EngineMessage::ListenerTimeout(key) => {
                if let Some(fired) = core.listeners.handle_timeout(&key) {
                    let core = Arc::clone(&core);
                    tokio::spawn(async move { core.on_fired(fired).await });
                }
            }
        }
    }
    info!("engine dispatch loop stopped");
}
