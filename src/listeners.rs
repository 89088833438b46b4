//! One-shot event subscriptions.
//!
//! A processing run that cannot proceed until the review system does
//! something (a parent merges, a replica appears, a blocking change stages)
//! arms a listener: a one-shot subscription keyed by
//! ([`EventKind`](crate::types::EventKind), context). When a matching event
//! arrives, the listener is disarmed and its follow-up step dispatched.
//! Listeners may carry a timeout; expiry disarms the listener and marks the
//! waiting branch terminal instead.
//!
//! At most one listener exists per key. Armed listeners are mirrored into the
//! owning record's persisted listener map by the engine, so a restart can
//! re-arm them with their remaining time ([`remaining_wait`]).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::signal::{EngineMessage, Step};
use crate::types::{ChangeKey, EventKey, RunId, TerminalOutcome};

/// How long a run waits for a parent's merge or replica before giving up.
pub const PARENT_WAIT_TIMEOUT: Duration = Duration::from_secs(48 * 60 * 60);

/// What to do when a listener's arm period elapses without its event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSpec {
    /// Arm period, from `armed_at`.
    pub after_secs: u64,

    /// Change to notify about the expiry.
    pub comment_on: ChangeKey,

    pub comment: String,

    /// Terminal outcome for the waiting branch.
    pub outcome: TerminalOutcome,
}

/// A persisted one-shot subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerRecord {
    pub run_id: RunId,

    pub key: EventKey,

    /// Step dispatched when the event fires.
    pub follow_up: Step,

    /// Sibling subscriptions disarmed when this one fires. Used for
    /// merge/abandon listener pairs on the same change.
    #[serde(default)]
    pub cancel_keys: Vec<EventKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSpec>,

    /// When the listener was first armed. Restores compute remaining wait
    /// from this, not from the restore time.
    pub armed_at: DateTime<Utc>,
}

impl ListenerRecord {
    pub fn new(run_id: RunId, key: EventKey, follow_up: Step) -> Self {
        ListenerRecord {
            run_id,
            key,
            follow_up,
            cancel_keys: Vec::new(),
            timeout: None,
            armed_at: Utc::now(),
        }
    }

    pub fn cancelling(mut self, keys: Vec<EventKey>) -> Self {
        self.cancel_keys = keys;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutSpec) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How much arm period is left at `now`. Zero when already expired.
pub fn remaining_wait(armed_at: DateTime<Utc>, after_secs: u64, now: DateTime<Utc>) -> Duration {
    let deadline = armed_at + chrono::Duration::seconds(after_secs as i64);
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// A listener that just fired or expired, with everything the engine needs
/// to act on it.
#[derive(Debug)]
pub struct Fired {
    pub record: ListenerRecord,

    /// Sibling listeners that were disarmed alongside.
    pub cancelled: Vec<ListenerRecord>,

    /// True when this is a timeout expiry rather than the awaited event.
    pub timed_out: bool,
}

impl Fired {
    /// Storage keys of every subscription this firing removed, for
    /// unpersisting from the owning record.
    pub fn removed_storage_keys(&self) -> Vec<String> {
        std::iter::once(&self.record)
            .chain(self.cancelled.iter())
            .map(|r| r.key.storage_key())
            .collect()
    }
}

struct Armed {
    record: ListenerRecord,
    timer: Option<CancellationToken>,
}

/// In-memory registry of armed listeners.
pub struct ListenerRegistry {
    inner: Mutex<HashMap<EventKey, Armed>>,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl ListenerRegistry {
    pub fn new(tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
        ListenerRegistry {
            inner: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Arms a listener. Returns `false` without arming if a listener for the
    /// same key already exists.
    ///
    /// Must run inside a tokio runtime when the record carries a timeout.
    pub fn arm(&self, record: ListenerRecord) -> bool {
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        if inner.contains_key(&record.key) {
            debug!(key = %record.key, "listener already armed; skipping");
            return false;
        }

        let timer = record.timeout.as_ref().map(|timeout| {
            let token = CancellationToken::new();
            let child = token.clone();
            let tx = self.tx.clone();
            let key = record.key.clone();
            let wait = remaining_wait(record.armed_at, timeout.after_secs, Utc::now());
            tokio::spawn(async move {
                tokio::select! {
                    _ = child.cancelled() => {}
                    _ = tokio::time::sleep(wait) => {
                        // Best effort: a closed channel means shutdown.
                        let _ = tx.send(EngineMessage::ListenerTimeout(key));
                    }
                }
            });
            token
        });

        debug!(key = %record.key, run_id = %record.run_id, "listener armed");
        inner.insert(record.key.clone(), Armed { record, timer });
        true
    }

    /// Disarms the listener for `key` (and its cancel siblings) because the
    /// awaited event arrived. `None` when nothing was armed for the key.
    pub fn handle_event(&self, key: &EventKey) -> Option<Fired> {
        self.remove(key, false)
    }

    /// Disarms the listener for `key` because its arm period elapsed. `None`
    /// when the event won the race and already disarmed it.
    pub fn handle_timeout(&self, key: &EventKey) -> Option<Fired> {
        self.remove(key, true)
    }

    fn remove(&self, key: &EventKey, timed_out: bool) -> Option<Fired> {
        let mut inner = self.inner.lock().expect("listener registry poisoned");
        let armed = inner.remove(key)?;
        if let Some(timer) = armed.timer {
            timer.cancel();
        }

        let cancelled = armed
            .record
            .cancel_keys
            .iter()
            .filter_map(|sibling| {
                let sibling = inner.remove(sibling)?;
                if let Some(timer) = sibling.timer {
                    timer.cancel();
                }
                Some(sibling.record)
            })
            .collect();

        Some(Fired {
            record: armed.record,
            cancelled,
            timed_out,
        })
    }

    /// Whether a listener is armed for `key`. For tests and the status page.
    pub fn is_armed(&self, key: &EventKey) -> bool {
        self.inner
            .lock()
            .expect("listener registry poisoned")
            .contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        self.inner
            .lock()
            .expect("listener registry poisoned")
            .len()
    }
}
