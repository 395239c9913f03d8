//! Table of requests awaiting a correlated reply.
//!
//! Each entry owns the completion handle for exactly one request. Whichever
//! of reply, server error or timeout happens first takes the entry out of the
//! table; anything arriving for that id afterwards finds nothing and is
//! ignored.

use crate::error::RequestError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

type Completion = oneshot::Sender<Result<Value, RequestError>>;

struct PendingEntry {
    completion: Completion,
    msg_type: String,
    created: Instant,
}

/// Outstanding requests keyed by message id
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<BTreeMap<u64, PendingEntry>>,
}

impl PendingRequests {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the handle its outcome will arrive on
    pub fn register(
        &self,
        id: u64,
        msg_type: &str,
    ) -> Result<oneshot::Receiver<Result<Value, RequestError>>, RequestError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(RequestError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            id,
            PendingEntry {
                completion: tx,
                msg_type: msg_type.to_string(),
                created: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Complete a request successfully; false if the id is not pending
    pub fn resolve(&self, id: u64, payload: Value) -> bool {
        self.complete(id, Ok(payload))
    }

    /// Fail a request; false if the id is not pending
    pub fn reject(&self, id: u64, error: RequestError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: u64, outcome: Result<Value, RequestError>) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                debug!(
                    "Completed {} request {} after {:?} (ok: {})",
                    entry.msg_type,
                    id,
                    entry.created.elapsed(),
                    outcome.is_ok()
                );
                // Receiver may already be gone if the caller stopped waiting
                let _ = entry.completion.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without completing it
    pub fn remove(&self, id: u64) -> bool {
        self.entries.lock().remove(&id).is_some()
    }

    /// Whether an entry exists for `id`
    pub fn contains(&self, id: u64) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wait for the outcome of a registered request.
    ///
    /// On timeout the entry is removed before returning. If the waiting
    /// future is dropped early the entry is removed as well.
    pub async fn wait(
        &self,
        id: u64,
        completion: oneshot::Receiver<Result<Value, RequestError>>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let guard = RemoveOnDrop { table: self, id };

        let outcome = match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::Dropped(id)),
            Err(_) => {
                debug!("Request {} timed out after {:?}", id, timeout);
                Err(RequestError::Timeout { id, timeout })
            }
        };
        drop(guard);
        outcome
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.len())
            .finish()
    }
}

struct RemoveOnDrop<'a> {
    table: &'a PendingRequests,
    id: u64,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}
