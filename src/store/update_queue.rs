//! Serialized blob updates for processing records.
//!
//! A record's JSON blob columns are read-modify-write data: two concurrent
//! branch tasks updating the same record could otherwise overwrite each
//! other's progress. [`UpdateQueue::update`] is the one place such writes
//! happen; it holds a per-run async mutex across the load/mutate/store cycle.
//! tokio's mutex is fair, so queued updates for one run apply in arrival
//! order. Different runs never contend.
//!
//! The pick counter is *not* covered here: it lives in its own column and is
//! only touched by the store's dedicated counter operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::store::{Store, StoreError};
use crate::types::{ProcessingRecord, RunId};

#[derive(Clone)]
pub struct UpdateQueue {
    store: Store,
    locks: Arc<Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl UpdateQueue {
    pub fn new(store: Store) -> Self {
        UpdateQueue {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, run_id: RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("update queue poisoned");
        locks.entry(run_id).or_default().clone()
    }

    /// Loads the record, applies `mutate`, and writes it back, serialized
    /// against every other update for the same run. Returns `Ok(None)` when
    /// no record exists for `run_id`.
    pub async fn update<T>(
        &self,
        run_id: RunId,
        mutate: impl FnOnce(&mut ProcessingRecord) -> T,
    ) -> Result<Option<(ProcessingRecord, T)>, StoreError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.store.record_by_run(run_id)? else {
            return Ok(None);
        };
        let value = mutate(&mut record);
        self.store.update_record(&record)?;
        Ok(Some((record, value)))
    }
}
