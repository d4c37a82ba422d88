//! Correlation table: in-flight requests keyed by correlation id.
//!
//! Thread-safe via `DashMap`. Every entry is resolved exactly once: by the
//! matching response, by a transport failure, by the deadline sweep, or by
//! close. Whichever removes the entry first wins; later resolutions are
//! ignored.

use actmesh_types::{CorrelationError, Failure, Pattern};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// What a waiting caller eventually receives.
pub type Outcome = Result<Value, Failure>;

/// A registered request awaiting its outcome.
struct PendingRequest {
    pattern: Pattern,
    peer: String,
    deadline: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Outcome>,
}

/// Thread-safe table of pending requests.
pub struct CorrelationTable {
    pending: DashMap<String, PendingRequest>,
    drained: Notify,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            drained: Notify::new(),
        }
    }

    /// Register a request sent to `peer`. The returned receiver yields the
    /// outcome exactly once.
    pub fn register(
        &self,
        correlation_id: &str,
        peer: &str,
        pattern: &Pattern,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, CorrelationError> {
        match self.pending.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => Err(CorrelationError::DuplicateCorrelationId(
                correlation_id.to_string(),
            )),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingRequest {
                    pattern: pattern.clone(),
                    peer: peer.to_string(),
                    deadline: Instant::now() + timeout,
                    timeout,
                    tx,
                });
                Ok(rx)
            }
        }
    }

    /// Deliver an outcome. Returns `false` if the id was not pending
    /// (already resolved, timed out, or never registered).
    pub fn resolve(&self, correlation_id: &str, outcome: Outcome) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, entry)) => {
                // The caller may have given up; nothing to deliver then.
                let _ = entry.tx.send(outcome);
                self.notify_if_drained();
                true
            }
            None => {
                debug!(correlation_id, "Ignoring resolution for non-pending request");
                false
            }
        }
    }

    /// Expire every entry whose deadline is at or before `now`.
    /// Returns the number of requests timed out.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        let count = expired
            .iter()
            .filter(|id| self.time_out(id, |e| e.deadline <= now))
            .count();
        if count > 0 {
            self.notify_if_drained();
        }
        count
    }

    /// Time out one request now, whatever its deadline.
    pub fn expire(&self, correlation_id: &str) -> bool {
        let expired = self.time_out(correlation_id, |_| true);
        if expired {
            self.notify_if_drained();
        }
        expired
    }

    fn time_out(&self, id: &str, due: impl Fn(&PendingRequest) -> bool) -> bool {
        let Some((_, entry)) = self.pending.remove_if(id, |_, e| due(e)) else {
            return false;
        };
        let timeout_ms = entry.timeout.as_millis() as u64;
        warn!(
            correlation_id = %id,
            pattern = %entry.pattern,
            peer = %entry.peer,
            timeout_ms,
            "Request timed out"
        );
        let _ = entry.tx.send(Err(Failure::Timeout { timeout_ms }));
        true
    }

    /// Deadline of a pending request.
    pub fn deadline(&self, correlation_id: &str) -> Option<Instant> {
        self.pending.get(correlation_id).map(|e| e.deadline)
    }

    /// Fail every request pending on `peer`.
    pub fn reject_peer(&self, peer: &str, failure: Failure) -> usize {
        self.reject_where(|entry| entry.peer == peer, failure)
    }

    /// Fail every pending request.
    pub fn reject_all(&self, failure: Failure) -> usize {
        self.reject_where(|_| true, failure)
    }

    fn reject_where(&self, keep: impl Fn(&PendingRequest) -> bool, failure: Failure) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.key().clone())
            .collect();

        let mut count = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(Err(failure.clone()));
                count += 1;
            }
        }
        if count > 0 {
            self.notify_if_drained();
        }
        count
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait until no request is pending.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn notify_if_drained(&self) {
        if self.pending.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}
