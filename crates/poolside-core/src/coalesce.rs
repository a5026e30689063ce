// ── Write coalescing ──
//
// Writes that arrive while the request slot is busy are merged into one
// pending batch. Whoever claims the slot next sends the whole batch as a
// single SETPARAMLIST and hands the result to every contributor.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use tokio::sync::{Mutex, oneshot};

use poolside_api::{ObjectEntry, Params, Response};

use crate::error::CoreError;

type BatchResult = Result<Response, CoreError>;

/// Sends one batched write. Called with the request slot already held.
pub trait ChangeSink: Send + Sync + 'static {
    fn send_changes(&self, changes: Vec<ObjectEntry>) -> BoxFuture<'_, BatchResult>;
}

#[derive(Default)]
struct PendingBatch {
    changes: IndexMap<String, Params>,
    waiters: Vec<oneshot::Sender<BatchResult>>,
}

impl PendingBatch {
    /// Last writer wins per object and attribute.
    fn merge(&mut self, objnam: &str, params: Params) {
        self.changes
            .entry(objnam.to_owned())
            .or_default()
            .extend(params);
    }

    fn entries(&mut self) -> Vec<ObjectEntry> {
        std::mem::take(&mut self.changes)
            .into_iter()
            .map(|(objnam, params)| ObjectEntry::new(objnam, params))
            .collect()
    }
}

pub struct WriteCoalescer<S> {
    sink: S,
    /// Shared with every other request path, so a read in flight also
    /// makes writes coalesce.
    slot: Arc<Mutex<()>>,
    pending: Mutex<Option<PendingBatch>>,
}

impl<S: ChangeSink> WriteCoalescer<S> {
    pub fn new(sink: S, slot: Arc<Mutex<()>>) -> Self {
        Self {
            sink,
            slot,
            pending: Mutex::new(None),
        }
    }

    /// Write `params` to `objnam`, batching with concurrent writers.
    pub async fn set(&self, objnam: &str, params: Params) -> BatchResult {
        let mut pending = self.pending.lock().await;

        // Nothing queued and nothing in flight: go alone.
        if pending.is_none() {
            if let Ok(slot) = self.slot.clone().try_lock_owned() {
                drop(pending);
                let result = self
                    .sink
                    .send_changes(vec![ObjectEntry::new(objnam, params)])
                    .await;
                drop(slot);
                return result;
            }
        }

        let (tx, rx) = oneshot::channel();
        let batch = pending.get_or_insert_with(PendingBatch::default);
        batch.merge(objnam, params);
        batch.waiters.push(tx);
        tracing::debug!(
            objnam,
            objects = batch.changes.len(),
            waiters = batch.waiters.len(),
            "write folded into pending batch"
        );
        drop(pending);

        {
            let _slot = self.slot.lock().await;
            // An earlier waiter may already have sent our batch.
            let claimed = self.pending.lock().await.take();
            if let Some(mut batch) = claimed {
                let entries = batch.entries();
                tracing::debug!(
                    objects = entries.len(),
                    waiters = batch.waiters.len(),
                    "sending coalesced batch"
                );
                let result = self.sink.send_changes(entries).await;
                for waiter in batch.waiters {
                    let _ = waiter.send(result.clone());
                }
            }
        }

        rx.await
            .map_err(|_| CoreError::Internal("coalesced write was dropped".into()))?
    }
}
