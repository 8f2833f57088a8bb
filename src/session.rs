//! Per-connection session state.
//!
//! A session is created when the connection enters `Ready` and destroyed
//! when it leaves, whatever the cause. Everything that must not survive a
//! reconnect lives here: the read queue, the offline-sync dedup set, and
//! the cooperative cancellation flag the background loops check. Stale
//! tasks from a previous connection hold an `Arc` to a dead session and
//! can never observe a resurrected one.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::ble::queue::ReadQueue;

/// Identity of a buffered offline sample within one sync session.
///
/// The sensor may retransmit a batch it believes was not acknowledged;
/// the same weight at the same relative age is the same sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey {
    weight_bits: u64,
    relative_ms: u64,
}

impl DedupKey {
    /// Build a key from a raw weight and its relative age.
    pub fn new(weight_kg: f64, relative_ms: u64) -> Self {
        Self {
            weight_bits: weight_kg.to_bits(),
            relative_ms,
        }
    }
}

/// State owned by one `Ready` period of the connection.
pub struct Session {
    queue: Arc<ReadQueue>,
    active: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    dedup: Mutex<HashSet<DedupKey>>,
}

impl Session {
    /// Create a session around a fresh read queue.
    pub fn new(queue: Arc<ReadQueue>) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);

        Arc::new(Self {
            queue,
            active: AtomicBool::new(true),
            cancel_tx,
            dedup: Mutex::new(HashSet::new()),
        })
    }

    /// The session's read queue.
    pub fn queue(&self) -> &Arc<ReadQueue> {
        &self.queue
    }

    /// Whether the session is still live. Loops check this before every
    /// iteration.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel the session: stop the loops and close the queue.
    ///
    /// Idempotent; safe to call from both explicit disconnect and link
    /// drop handling.
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!("Session cancelled");
        }
        self.cancel_tx.send_replace(true);
        self.queue.close();
    }

    /// Resolve once the session is cancelled.
    ///
    /// Loops that block on an event stream select against this so they
    /// wake even when the closed queue will never broadcast again.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Record a dedup key; returns true if it was not seen this session.
    pub fn dedup_insert(&self, key: DedupKey) -> bool {
        self.dedup.lock().insert(key)
    }

    /// Whether a dedup key was already seen this session.
    pub fn dedup_contains(&self, key: DedupKey) -> bool {
        self.dedup.lock().contains(&key)
    }

    /// Number of distinct offline samples seen this session.
    pub fn dedup_len(&self) -> usize {
        self.dedup.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::link::GattLink;
    use crate::ble::queue::ReadRequest;
    use crate::mock::{MockLink, MockPermissionGate};

    fn session() -> Arc<Session> {
        let link = Arc::new(MockLink::with_all_characteristics()) as Arc<dyn GattLink>;
        let gate = Arc::new(MockPermissionGate::granted());
        Session::new(ReadQueue::new(link, gate))
    }

    #[tokio::test]
    async fn test_cancel_closes_queue() {
        let session = session();
        assert!(session.is_active());

        session.cancel();
        assert!(!session.is_active());
        assert!(session.queue().enqueue(ReadRequest::Weight).is_err());

        // Idempotent.
        session.cancel();
        assert!(!session.is_active());
    }

    #[test]
    fn test_dedup_key_equality() {
        assert_eq!(DedupKey::new(25.1, 300_000), DedupKey::new(25.1, 300_000));
        assert_ne!(DedupKey::new(25.1, 300_000), DedupKey::new(25.1, 240_000));
        assert_ne!(DedupKey::new(25.2, 300_000), DedupKey::new(25.1, 300_000));
    }

    #[tokio::test]
    async fn test_dedup_insert() {
        let session = session();
        assert!(session.dedup_insert(DedupKey::new(25.1, 300_000)));
        assert!(!session.dedup_insert(DedupKey::new(25.1, 300_000)));
        assert_eq!(session.dedup_len(), 1);

        assert!(session.dedup_contains(DedupKey::new(25.1, 300_000)));
        assert!(!session.dedup_contains(DedupKey::new(25.2, 300_000)));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let session = session();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.cancelled().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        session.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not wake after cancel")
            .unwrap();

        // Resolves immediately once already cancelled.
        session.cancelled().await;
    }
}
