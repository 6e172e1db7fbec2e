//! Transaction tracking for acknowledged sends.
//!
//! Every tracked outbound frame gets a pending record keyed by its 16-bit
//! transaction id.  The record moves `New → Sent → Acked`; the absence of a
//! record means the id is free.
//!
//! ```text
//! send()                          receiver/dispatcher
//! ──────                          ───────────────────
//! register(tid)      → New
//! write frame
//! wait_for_ack(tid)  → Sent  ◄─── mark_acked(tid) → Acked
//! record removed
//! ```
//!
//! The wake signal is a `watch` channel owned by the record.  Dropping the
//! record (disconnect, sweep) closes the channel, so a blocked waiter
//! returns `false` immediately instead of waiting out its timeout.
//!
//! The map has its own lock, separate from the connection lock, so ack
//! delivery never waits on socket I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Records older than this are dropped by [`ReliabilityTracker::sweep`].
pub const CLEANUP_HORIZON: Duration = Duration::from_secs(90);

/// Lifecycle of a pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// Registered, frame not yet confirmed written.
    New,
    /// A sender is blocked waiting for the ack.
    Sent,
    /// The ack arrived.
    Acked,
}

struct PendingRequest {
    created_at: Instant,
    /// No waiter will ever consume this record (responses), so it is
    /// removed as soon as it is acked.
    detached: bool,
    signal: watch::Sender<PendingState>,
}

/// Maps transaction id → pending request.
pub struct ReliabilityTracker {
    pending: Mutex<HashMap<u16, PendingRequest>>,
    horizon: Duration,
}

impl ReliabilityTracker {
    pub fn new() -> Self {
        Self::with_horizon(CLEANUP_HORIZON)
    }

    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            horizon,
        }
    }

    /// Inserts a `New` record for `tid`.  Returns `false` if `tid` is already
    /// pending.
    pub fn register(&self, tid: u16) -> bool {
        self.insert(tid, false)
    }

    /// Like [`register`](Self::register), for a record nobody will wait on.
    pub fn register_detached(&self, tid: u16) -> bool {
        self.insert(tid, true)
    }

    /// Draws random ids until one is free, registers it and returns it.
    pub fn reserve(&self) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let tid: u16 = rng.gen();
            if self.register(tid) {
                return tid;
            }
        }
    }

    fn insert(&self, tid: u16, detached: bool) -> bool {
        let mut pending = self.lock();
        if pending.contains_key(&tid) {
            return false;
        }
        let (signal, _) = watch::channel(PendingState::New);
        pending.insert(
            tid,
            PendingRequest {
                created_at: Instant::now(),
                detached,
                signal,
            },
        );
        true
    }

    /// Current state of `tid`, or `None` if it is not pending.
    pub fn state(&self, tid: u16) -> Option<PendingState> {
        self.lock().get(&tid).map(|req| *req.signal.borrow())
    }

    /// Marks `tid` acknowledged and wakes its waiter.  An unknown id is
    /// logged and ignored.
    pub fn mark_acked(&self, tid: u16) -> bool {
        let mut pending = self.lock();
        let Some(req) = pending.get(&tid) else {
            warn!(tid, "ack for unknown transaction");
            return false;
        };
        req.signal.send_replace(PendingState::Acked);
        if req.detached {
            pending.remove(&tid);
        }
        debug!(tid, "transaction acked");
        true
    }

    /// Blocks until `tid` is acked, the record is dropped, or `timeout`
    /// expires.  The record is removed in every case.
    ///
    /// Returns `true` only if the ack arrived.
    pub async fn wait_for_ack(&self, tid: u16, timeout: Duration) -> bool {
        let mut rx = {
            let pending = self.lock();
            let Some(req) = pending.get(&tid) else {
                return false;
            };
            req.signal.send_if_modified(|state| {
                if *state == PendingState::New {
                    *state = PendingState::Sent;
                    true
                } else {
                    false
                }
            });
            req.signal.subscribe()
        };

        let acked = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == PendingState::Acked)).await,
            Ok(Ok(_))
        );
        self.forget(tid);
        if !acked {
            debug!(tid, "no ack within {timeout:?}");
        }
        acked
    }

    /// Removes `tid` without waking anyone as acked.
    pub fn forget(&self, tid: u16) -> bool {
        self.lock().remove(&tid).is_some()
    }

    /// Drops records older than the cleanup horizon, whatever their state.
    pub fn sweep(&self) -> usize {
        let horizon = self.horizon;
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, req| req.created_at.elapsed() < horizon);
        let removed = before - pending.len();
        if removed > 0 {
            debug!(removed, "swept stale transactions");
        }
        removed
    }

    /// Drops every record; blocked waiters return `false`.
    pub fn abort_all(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, PendingRequest>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ReliabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_rejects_pending_tid() {
        let tracker = ReliabilityTracker::new();
        assert!(tracker.register(7));
        assert!(!tracker.register(7), "second register of a pending tid must fail");
        assert_eq!(tracker.state(7), Some(PendingState::New));
    }

    #[test]
    fn test_reserve_returns_registered_unique_ids() {
        let tracker = ReliabilityTracker::new();
        let ids: Vec<u16> = (0..200).map(|_| tracker.reserve()).collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(tracker.len(), 200);
    }

    #[test]
    fn test_mark_acked_unknown_tid_is_not_fatal() {
        let tracker = ReliabilityTracker::new();
        assert!(!tracker.mark_acked(99));
    }

    #[test]
    fn test_detached_record_is_removed_on_ack() {
        let tracker = ReliabilityTracker::new();
        assert!(tracker.register_detached(5));
        assert!(tracker.mark_acked(5));
        assert_eq!(tracker.state(5), None);
        assert!(tracker.register(5), "tid must be reusable after the ack");
    }

    #[tokio::test]
    async fn test_wait_for_ack_returns_true_when_acked() {
        // Arrange
        let tracker = Arc::new(ReliabilityTracker::new());
        assert!(tracker.register(42));
        let acker = Arc::clone(&tracker);

        // Act – ack from another task shortly after the wait starts
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            acker.mark_acked(42);
        });
        let acked = tracker.wait_for_ack(42, Duration::from_secs(2)).await;

        // Assert
        assert!(acked);
        assert_eq!(tracker.state(42), None, "record must be removed");
        assert!(tracker.register(42), "tid must be reusable after ack");
    }

    #[tokio::test]
    async fn test_wait_for_ack_sees_ack_that_arrived_first() {
        let tracker = ReliabilityTracker::new();
        tracker.register(1);
        tracker.mark_acked(1);
        assert!(tracker.wait_for_ack(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_for_ack_times_out() {
        let tracker = ReliabilityTracker::new();
        tracker.register(3);

        let start = Instant::now();
        let acked = tracker.wait_for_ack(3, Duration::from_millis(50)).await;

        assert!(!acked);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(tracker.state(3), None);
    }

    #[tokio::test]
    async fn test_wait_for_ack_marks_sent_while_blocked() {
        let tracker = Arc::new(ReliabilityTracker::new());
        tracker.register(8);
        let waiter = Arc::clone(&tracker);
        let handle = tokio::spawn(async move { waiter.wait_for_ack(8, Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.state(8), Some(PendingState::Sent));
        tracker.mark_acked(8);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_all_wakes_waiter_with_failure() {
        let tracker = Arc::new(ReliabilityTracker::new());
        tracker.register(11);
        let waiter = Arc::clone(&tracker);
        let handle = tokio::spawn(async move { waiter.wait_for_ack(11, Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.abort_all(), 1);

        let acked = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter must return promptly")
            .unwrap();
        assert!(!acked);
    }

    #[tokio::test]
    async fn test_wait_for_unknown_tid_returns_false() {
        let tracker = ReliabilityTracker::new();
        assert!(!tracker.wait_for_ack(1234, Duration::from_secs(5)).await);
    }

    #[test]
    fn test_sweep_drops_records_past_horizon() {
        // Arrange – zero horizon makes every record stale immediately
        let tracker = ReliabilityTracker::with_horizon(Duration::ZERO);
        tracker.register(1);
        tracker.register(2);
        tracker.mark_acked(2);

        // Act
        let removed = tracker.sweep();

        // Assert
        assert_eq!(removed, 2);
        assert!(tracker.is_empty());
        assert!(tracker.register(1), "tid must be reusable after the sweep");
    }

    #[test]
    fn test_sweep_keeps_fresh_records() {
        let tracker = ReliabilityTracker::new();
        tracker.register(1);
        assert_eq!(tracker.sweep(), 0);
        assert_eq!(tracker.len(), 1);
    }
}
