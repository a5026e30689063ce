//! Flow control and response correlation.
//!
//! The controller cannot parse overlapping requests, so at most one request
//! is unacknowledged on the wire. Everything else waits in a FIFO of
//! serialized payloads. [`Correlator`] tracks who is waiting for which
//! response.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::Error;
use crate::message::Response;

/// Default wait-queue capacity.
pub const DEFAULT_MAX_QUEUE: usize = 100;

// ── FlowControl ─────────────────────────────────────────────────────

/// A serialized request that has a message id but may not be sent yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub message_id: String,
    pub payload: Bytes,
}

/// What to do with a newly submitted request.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing else is in flight: write it now.
    Write(Outbound),
    /// Parked behind the in-flight request.
    Queued,
    /// Queue at capacity; the request is handed back unsent.
    Overflow(Outbound),
}

/// In-flight counter plus the wait queue.
#[derive(Debug)]
pub struct FlowControl {
    in_flight: usize,
    queue: VecDeque<Outbound>,
    max_queue: usize,
    last_activity: Instant,
}

impl FlowControl {
    pub fn new(max_queue: usize, now: Instant) -> Self {
        Self {
            in_flight: 0,
            queue: VecDeque::new(),
            max_queue,
            last_activity: now,
        }
    }

    /// Submit a request.
    ///
    /// The counter is bumped before deciding, so the request that takes it
    /// from 0 to 1 is the one that writes.
    pub fn submit(&mut self, outbound: Outbound, now: Instant) -> Dispatch {
        self.in_flight += 1;
        if self.in_flight == 1 {
            self.last_activity = now;
            return Dispatch::Write(outbound);
        }
        if self.queue.len() >= self.max_queue {
            self.in_flight -= 1;
            return Dispatch::Overflow(outbound);
        }
        self.queue.push_back(outbound);
        Dispatch::Queued
    }

    /// A response arrived. Returns the next payload to write, if any.
    pub fn on_response(&mut self, now: Instant) -> Option<Outbound> {
        self.last_activity = now;
        let next = self.queue.pop_front();
        self.in_flight = self.in_flight.saturating_sub(1);
        next
    }

    /// Requests are pending and nothing has moved for longer than `window`.
    pub fn is_stalled(&self, now: Instant, window: Duration) -> bool {
        self.in_flight > 0 && now.saturating_duration_since(self.last_activity) > window
    }

    /// Forget everything in flight. Returns the payloads that were never sent.
    pub fn reset(&mut self, now: Instant) -> Vec<Outbound> {
        self.in_flight = 0;
        self.last_activity = now;
        self.queue.drain(..).collect()
    }

    /// Drop a still-queued request. Returns `false` if it was already sent.
    pub fn discard_queued(&mut self, message_id: &str) -> bool {
        let Some(pos) = self.queue.iter().position(|o| o.message_id == message_id) else {
            return false;
        };
        self.queue.remove(pos);
        self.in_flight = self.in_flight.saturating_sub(1);
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

// ── Correlation ─────────────────────────────────────────────────────

/// How an incoming response is matched to a waiting request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationPolicy {
    /// Match on `messageID` only. A response whose id matches nothing is
    /// logged and dropped; the request it belonged to stays pending until
    /// its caller gives up and the entry goes stale.
    StrictId,
    /// Resolve the earliest outstanding request with whatever response
    /// arrives next. Tolerates controllers that echo the wrong id on error
    /// responses; relies on strict one-at-a-time ordering.
    #[default]
    OldestPending,
}

pub(crate) type ResponseSender = oneshot::Sender<Result<Response, Error>>;

#[derive(Debug)]
pub(crate) enum Waiter {
    Caller(ResponseSender),
    Keepalive,
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub message_id: String,
    pub command: String,
    pub created: Instant,
    pub waiter: Waiter,
}

impl PendingRequest {
    /// The caller stopped waiting (timed out or was dropped).
    fn is_abandoned(&self) -> bool {
        match &self.waiter {
            Waiter::Caller(tx) => tx.is_closed(),
            Waiter::Keepalive => false,
        }
    }

    pub fn fail(self, err: Error) {
        if let Waiter::Caller(tx) = self.waiter {
            let _ = tx.send(Err(err));
        }
    }
}

#[derive(Debug)]
pub(crate) struct Correlator {
    policy: CorrelationPolicy,
    pending: VecDeque<PendingRequest>,
}

impl Correlator {
    pub fn new(policy: CorrelationPolicy) -> Self {
        Self {
            policy,
            pending: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> CorrelationPolicy {
        self.policy
    }

    pub fn register(&mut self, request: PendingRequest) {
        self.pending.push_back(request);
    }

    /// Find the waiter for a response according to the policy.
    pub fn resolve(&mut self, message_id: &str) -> Option<PendingRequest> {
        match self.policy {
            CorrelationPolicy::StrictId => self.remove(message_id),
            CorrelationPolicy::OldestPending => {
                let oldest = self.pending.pop_front()?;
                if oldest.message_id != message_id {
                    tracing::debug!(
                        expected = %oldest.message_id,
                        received = %message_id,
                        "response id mismatch, resolving oldest pending request"
                    );
                }
                Some(oldest)
            }
        }
    }

    pub fn remove(&mut self, message_id: &str) -> Option<PendingRequest> {
        let pos = self
            .pending
            .iter()
            .position(|p| p.message_id == message_id)?;
        self.pending.remove(pos)
    }

    /// Ids of abandoned requests older than `max_age`.
    pub fn stale_ids(&self, now: Instant, max_age: Duration) -> Vec<String> {
        self.pending
            .iter()
            .filter(|p| p.is_abandoned() && now.saturating_duration_since(p.created) > max_age)
            .map(|p| p.message_id.clone())
            .collect()
    }

    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
