//! Delayed re-dispatch of signals that hit a transient failure.
//!
//! A retry is persisted to the `retry_queue` table before the delay starts,
//! and the row is deleted *before* the signal is re-dispatched. That ordering
//! makes retries at-most-once across a crash: a process that dies mid-delay
//! leaves a row that boot-time cleanup discards, and resumption happens from
//! the record's persisted step instead.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::signal::{EngineMessage, Signal};
use crate::store::{Store, StoreError};

/// Fixed delay before a transiently-failed step runs again.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

/// Schedules persisted, delayed signal re-dispatch.
#[derive(Clone)]
pub struct RetryProcessor {
    store: Store,
    tx: mpsc::UnboundedSender<EngineMessage>,
    delay: Duration,
}

impl RetryProcessor {
    pub fn new(store: Store, tx: mpsc::UnboundedSender<EngineMessage>) -> Self {
        RetryProcessor {
            store,
            tx,
            delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_delay(store: Store, tx: mpsc::UnboundedSender<EngineMessage>, delay: Duration) -> Self {
        RetryProcessor { store, tx, delay }
    }

    /// Persists `signal` and re-dispatches it after the delay.
    pub fn schedule(&self, signal: &Signal) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(signal).map_err(|e| StoreError::Storage {
            operation: "encode retry signal".into(),
            message: e.to_string(),
        })?;
        let id = self.store.push_retry(&encoded)?;
        debug!(run_id = %signal.run_id, retry_id = id, "retry scheduled");

        let store = self.store.clone();
        let tx = self.tx.clone();
        let run_id = signal.run_id;
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Claim the row first. A missing row means another path already
            // consumed or discarded it.
            let claimed = match store.take_retry(id) {
                Ok(claimed) => claimed,
                Err(error) => {
                    warn!(run_id = %run_id, retry_id = id, %error, "cannot claim retry row");
                    return;
                }
            };
            let Some(encoded) = claimed else {
                debug!(run_id = %run_id, retry_id = id, "retry row gone; skipping");
                return;
            };
            match serde_json::from_str::<Signal>(&encoded) {
                Ok(signal) => {
                    let _ = tx.send(EngineMessage::Signal(signal));
                }
                Err(error) => {
                    warn!(run_id = %run_id, retry_id = id, %error, "undecodable retry row dropped");
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::signal::Step;
    use crate::types::{Branch, RunId};

    fn signal() -> Signal {
        Signal::new(
            RunId::new(),
            Step::VerifyParent {
                branch: Branch::new("6.5"),
                attempt: 1,
            },
        )
    }

    #[tokio::test]
    async fn redispatches_after_the_delay() {
        tokio::time::pause();
        let store = Store::open_in_memory().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let retry = RetryProcessor::with_delay(store, tx, Duration::from_secs(30));
        let expected = signal();

        retry.schedule(&expected).unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        match rx.recv().await.unwrap() {
            EngineMessage::Signal(got) => assert_eq!(got, expected),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleared_rows_do_not_dispatch() {
        tokio::time::pause();
        let store = Store::open_in_memory().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let retry = RetryProcessor::with_delay(store.clone(), tx, Duration::from_secs(30));

        retry.schedule(&signal()).unwrap();
        // Boot-time discard racing ahead of the timer.
        store.clear_retries().unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn row_is_consumed_by_dispatch() {
        tokio::time::pause();
        let store = Store::open_in_memory().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let retry = RetryProcessor::with_delay(store.clone(), tx, Duration::from_secs(30));

        retry.schedule(&signal()).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        rx.recv().await.unwrap();

        assert_eq!(store.clear_retries().unwrap(), 0);
    }
}
