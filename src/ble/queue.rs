//! Single-flight read operation queue.
//!
//! The sensor exposes one physical link, so at most one read transaction
//! may be outstanding at any instant. All characteristic reads funnel
//! through this queue: callers enqueue and return, completions are
//! published as broadcast events.
//!
//! A watchdog bounds every dispatch: if the sensor does not answer within
//! the timeout, the in-flight slot is forcibly cleared and the next queued
//! operation dispatches. A response that arrives after its timeout is
//! discarded; operation identity is not tracked across the recycle.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::link::GattLink;
use crate::ble::uuids::{
    HISTORY_CHARACTERISTIC_UUID, INCLINATION_CHARACTERISTIC_UUID, WEIGHT_CHARACTERISTIC_UUID,
};
use crate::error::{Error, Result};
use crate::traits::PermissionGate;

/// Default watchdog window for a single read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A queued read operation.
///
/// Carries only what is needed to dispatch; the queue never holds
/// closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRequest {
    /// Read the live weight characteristic.
    Weight,
    /// Read the live inclination characteristic.
    Inclination,
    /// Read one page of the offline-history characteristic.
    HistoryPage,
}

impl ReadRequest {
    /// The characteristic this request reads.
    pub fn characteristic(&self) -> Uuid {
        match self {
            Self::Weight => WEIGHT_CHARACTERISTIC_UUID,
            Self::Inclination => INCLINATION_CHARACTERISTIC_UUID,
            Self::HistoryPage => HISTORY_CHARACTERISTIC_UUID,
        }
    }
}

/// How a dispatched read ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The sensor answered with a payload.
    Payload(Vec<u8>),
    /// No answer within the watchdog window; the slot was recycled.
    TimedOut,
    /// The transport or the sensor reported an error.
    Failed(String),
}

/// Completion event for one queued read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    /// The request that completed.
    pub request: ReadRequest,
    /// How it completed.
    pub outcome: ReadOutcome,
}

struct QueueState {
    pending: VecDeque<ReadRequest>,
    /// Generation of the operation currently on the link, if any.
    in_flight: Option<u64>,
    /// Bumped on every dispatch and on every clear, so late completions
    /// from a recycled or torn-down slot are recognized and dropped.
    generation: u64,
    closed: bool,
}

/// FIFO queue enforcing the single-flight read invariant.
///
/// One queue exists per session and dies with it; a new connection gets a
/// fresh queue, so no stale completion can leak across sessions.
pub struct ReadQueue {
    link: Arc<dyn GattLink>,
    gate: Arc<dyn PermissionGate>,
    timeout: Duration,
    state: Mutex<QueueState>,
    event_tx: broadcast::Sender<ReadEvent>,
}

impl ReadQueue {
    /// Create a queue over a link with the default watchdog window.
    pub fn new(link: Arc<dyn GattLink>, gate: Arc<dyn PermissionGate>) -> Arc<Self> {
        Self::with_timeout(link, gate, DEFAULT_READ_TIMEOUT)
    }

    /// Create a queue with a custom watchdog window.
    pub fn with_timeout(
        link: Arc<dyn GattLink>,
        gate: Arc<dyn PermissionGate>,
        timeout: Duration,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            link,
            gate,
            timeout,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: None,
                generation: 0,
                closed: false,
            }),
            event_tx,
        })
    }

    /// Append a read request; dispatches immediately if the link is idle.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` once the queue has been closed.
    pub fn enqueue(self: &Arc<Self>, request: ReadRequest) -> Result<()> {
        let mut state = self.state.lock();

        if state.closed {
            return Err(Error::NotConnected);
        }

        trace!("Enqueueing {:?}", request);
        state.pending.push_back(request);
        self.dispatch_next(&mut state);

        Ok(())
    }

    /// Subscribe to completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReadEvent> {
        self.event_tx.subscribe()
    }

    /// Number of queued (not yet dispatched) requests.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether nothing is queued or on the link.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_none()
    }

    /// Drop all queued operations and refuse new ones.
    ///
    /// An operation already on the link is orphaned: its completion is
    /// discarded via the generation counter, and no stale timeout can
    /// fire into a later session.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        state.in_flight = None;
        state.generation += 1;
        debug!("Read queue closed");
    }

    fn dispatch_next(self: &Arc<Self>, state: &mut QueueState) {
        if state.in_flight.is_some() || state.closed {
            return;
        }
        let Some(request) = state.pending.pop_front() else {
            return;
        };

        state.generation += 1;
        let generation = state.generation;
        state.in_flight = Some(generation);

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.perform(request, generation).await;
        });
    }

    async fn perform(self: Arc<Self>, request: ReadRequest, generation: u64) {
        let outcome = if !self.gate.is_granted() {
            ReadOutcome::Failed(Error::PermissionDenied.to_string())
        } else {
            let characteristic = request.characteristic();
            match tokio::time::timeout(self.timeout, self.link.read(&characteristic)).await {
                Ok(Ok(data)) => ReadOutcome::Payload(data),
                Ok(Err(e)) => {
                    warn!("{:?} read failed: {}", request, e);
                    ReadOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    warn!(
                        "{:?} read produced no response within {:?}, recycling queue",
                        request, self.timeout
                    );
                    ReadOutcome::TimedOut
                }
            }
        };

        self.complete(request, generation, outcome);
    }

    fn complete(self: &Arc<Self>, request: ReadRequest, generation: u64, outcome: ReadOutcome) {
        {
            let mut state = self.state.lock();
            if state.in_flight != Some(generation) {
                debug!("Discarding stale completion for {:?}", request);
                return;
            }
            state.in_flight = None;
        }

        let _ = self.event_tx.send(ReadEvent { request, outcome });

        let mut state = self.state.lock();
        self.dispatch_next(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLink, MockPermissionGate};
    use std::time::Instant;

    fn granted() -> Arc<MockPermissionGate> {
        Arc::new(MockPermissionGate::granted())
    }

    async fn next_event(rx: &mut broadcast::Receiver<ReadEvent>) -> ReadEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for read event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_fifo_order_and_single_flight() {
        let link = Arc::new(MockLink::with_all_characteristics());
        link.set_read_latency(Duration::from_millis(20));
        link.connect().await.unwrap();

        let queue = ReadQueue::new(link.clone() as Arc<dyn GattLink>, granted());
        let mut rx = queue.subscribe();

        queue.enqueue(ReadRequest::Weight).unwrap();
        queue.enqueue(ReadRequest::Inclination).unwrap();
        queue.enqueue(ReadRequest::HistoryPage).unwrap();

        assert_eq!(next_event(&mut rx).await.request, ReadRequest::Weight);
        assert_eq!(next_event(&mut rx).await.request, ReadRequest::Inclination);
        assert_eq!(next_event(&mut rx).await.request, ReadRequest::HistoryPage);

        // Never more than one read on the link at once.
        assert_eq!(link.max_concurrent_reads(), 1);
    }

    #[tokio::test]
    async fn test_timeout_recycles_queue() {
        let link = Arc::new(MockLink::with_all_characteristics());
        link.connect().await.unwrap();
        link.stall_next_read(WEIGHT_CHARACTERISTIC_UUID);

        let queue = ReadQueue::with_timeout(
            link.clone() as Arc<dyn GattLink>,
            granted(),
            Duration::from_millis(50),
        );
        let mut rx = queue.subscribe();

        queue.enqueue(ReadRequest::Weight).unwrap();
        queue.enqueue(ReadRequest::Inclination).unwrap();

        let started = Instant::now();
        let first = next_event(&mut rx).await;
        assert_eq!(first.request, ReadRequest::Weight);
        assert_eq!(first.outcome, ReadOutcome::TimedOut);

        // The next operation dispatches promptly after the recycle.
        let second = next_event(&mut rx).await;
        assert_eq!(second.request, ReadRequest::Inclination);
        assert!(matches!(second.outcome, ReadOutcome::Payload(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_device_error_continues_queue() {
        let link = Arc::new(MockLink::with_all_characteristics());
        link.connect().await.unwrap();
        link.fail_next_read(WEIGHT_CHARACTERISTIC_UUID, "busy");

        let queue = ReadQueue::new(link.clone() as Arc<dyn GattLink>, granted());
        let mut rx = queue.subscribe();

        queue.enqueue(ReadRequest::Weight).unwrap();
        queue.enqueue(ReadRequest::Inclination).unwrap();

        let first = next_event(&mut rx).await;
        assert!(matches!(first.outcome, ReadOutcome::Failed(_)));

        let second = next_event(&mut rx).await;
        assert!(matches!(second.outcome, ReadOutcome::Payload(_)));
    }

    #[tokio::test]
    async fn test_close_clears_pending_and_refuses_new() {
        let link = Arc::new(MockLink::with_all_characteristics());
        link.set_read_latency(Duration::from_millis(50));
        link.connect().await.unwrap();

        let queue = ReadQueue::new(link.clone() as Arc<dyn GattLink>, granted());
        queue.enqueue(ReadRequest::Weight).unwrap();
        queue.enqueue(ReadRequest::Inclination).unwrap();

        queue.close();
        assert_eq!(queue.pending_len(), 0);
        assert!(matches!(
            queue.enqueue(ReadRequest::Weight),
            Err(Error::NotConnected)
        ));

        // The orphaned in-flight read completes without an event.
        let mut rx = queue.subscribe();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permission_denied_fails_dispatch() {
        let link = Arc::new(MockLink::with_all_characteristics());
        link.connect().await.unwrap();

        let gate = Arc::new(MockPermissionGate::denied());
        let queue = ReadQueue::new(link as Arc<dyn GattLink>, gate);
        let mut rx = queue.subscribe();

        queue.enqueue(ReadRequest::Weight).unwrap();

        let event = next_event(&mut rx).await;
        assert!(matches!(event.outcome, ReadOutcome::Failed(_)));
    }
}
