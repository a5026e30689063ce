// ── Connection metrics ──
//
// Lock-free counters shared between the controller and its write path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    requests_sent: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    successful_connects: AtomicU64,
    reconnect_attempts: AtomicU64,
    attempted: AtomicBool,
    last_connected: ArcSwapOption<DateTime<Utc>>,
}

/// Point-in-time copy of [`ConnectionMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub successful_connects: u64,
    pub reconnect_attempts: u64,
    pub last_connected: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_finished(&self, ok: bool) {
        let counter = if ok {
            &self.requests_completed
        } else {
            &self.requests_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Every attempt after the very first counts as a reconnect.
    pub(crate) fn connect_attempted(&self) {
        if self.attempted.swap(true, Ordering::Relaxed) {
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn connected(&self) {
        self.successful_connects.fetch_add(1, Ordering::Relaxed);
        self.last_connected.store(Some(Arc::new(Utc::now())));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            successful_connects: self.successful_connects.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_connected: self.last_connected.load_full().map(|t| *t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_not_a_reconnect() {
        let metrics = ConnectionMetrics::new();
        metrics.connect_attempted();
        metrics.connected();
        metrics.connect_attempted();

        let snap = metrics.snapshot();
        assert_eq!(snap.successful_connects, 1);
        assert_eq!(snap.reconnect_attempts, 1);
        assert!(snap.last_connected.is_some());
    }

    #[test]
    fn request_outcomes_are_counted() {
        let metrics = ConnectionMetrics::new();
        metrics.request_sent();
        metrics.request_sent();
        metrics.request_finished(true);
        metrics.request_finished(false);

        let snap = metrics.snapshot();
        assert_eq!(
            (snap.requests_sent, snap.requests_completed, snap.requests_failed),
            (2, 1, 1)
        );
    }
}
