// Copyright 2022 Jeff Kim <hiking90@gmail.com>
// SPDX-License-Identifier: Apache-2.0

//! The seam between the queue system and the vitals controller.
//!
//! The controller attaches an [`EventSink`] to a [`JobEventSource`] when
//! sampling starts and detaches it when sampling stops. [`JobEventBus`] is the
//! in-process source a queue system publishes into.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use crate::job::{EventKind, JobEvent, JobSnapshot};

/// Receiving half handed to a [`JobEventSource`] on subscription.
pub type EventSink = mpsc::UnboundedSender<JobEvent>;

/// Token identifying one attached [`EventSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSubscription(u64);

impl SourceSubscription {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A subscribable stream of `(kind, snapshot)` job events.
pub trait JobEventSource: Send + Sync + 'static {
    /// Starts delivering events to `sink` until [`unsubscribe`](Self::unsubscribe)
    /// is called with the returned token.
    fn subscribe(&self, sink: EventSink) -> SourceSubscription;

    /// Stops delivering to the sink behind `subscription`. Returns `false` if
    /// it was not attached.
    fn unsubscribe(&self, subscription: SourceSubscription) -> bool;
}

#[derive(Debug, Default)]
struct BusInner {
    next_id: AtomicU64,
    sinks: Mutex<Vec<(SourceSubscription, EventSink)>>,
}

/// In-process [`JobEventSource`] that fans published events out to every
/// attached sink. Clones share the same subscribers.
///
/// ```rust
/// use jobvitals::{JobEventBus, JobSnapshot};
///
/// let bus = JobEventBus::new();
/// // nobody is listening yet
/// assert_eq!(bus.publish("create", JobSnapshot::new("1", "send-email")), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobEventBus {
    inner: Arc<BusInner>,
}

impl JobEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sinks(&self) -> MutexGuard<'_, Vec<(SourceSubscription, EventSink)>> {
        // the sink list stays consistent even if a holder panicked
        self.inner
            .sinks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes an event and returns how many sinks received it.
    ///
    /// Sinks whose receiving side is gone are dropped on the way.
    pub fn publish(
        &self,
        kind: impl Into<EventKind>,
        job: impl Into<Arc<JobSnapshot>>,
    ) -> usize {
        let event = JobEvent::new(kind, job);
        let mut sinks = self.sinks();
        sinks.retain(|(_, sink)| sink.send(event.clone()).is_ok());
        sinks.len()
    }

    /// Number of sinks currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.sinks().len()
    }

    /// Drops every attached sink, ending their event streams. Returns how many
    /// were attached.
    ///
    /// Events already delivered stay queued on the receiving side.
    pub fn close(&self) -> usize {
        let closed = std::mem::take(&mut *self.sinks()).len();
        debug!(closed, "Closed job event bus");
        closed
    }
}

impl JobEventSource for JobEventBus {
    fn subscribe(&self, sink: EventSink) -> SourceSubscription {
        let subscription =
            SourceSubscription(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks().push((subscription, sink));
        debug!(subscription = subscription.id(), "Attached event sink");
        subscription
    }

    fn unsubscribe(&self, subscription: SourceSubscription) -> bool {
        let mut sinks = self.sinks();
        match sinks.iter().position(|(id, _)| *id == subscription) {
            Some(index) => {
                sinks.remove(index);
                debug!(subscription = subscription.id(), "Detached event sink");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_fans_out_to_all_sinks() {
        let bus = JobEventBus::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus.subscribe(tx_a);
        bus.subscribe(tx_b);

        let delivered = bus.publish("success", JobSnapshot::new("1", "a"));

        assert_eq!(delivered, 2);
        assert_eq!(rx_a.try_recv().unwrap().kind, EventKind::Success);
        assert_eq!(rx_b.try_recv().unwrap().job.id, "1");
    }

    #[test]
    fn test_unsubscribe_detaches_only_that_sink() {
        let bus = JobEventBus::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let first = bus.subscribe(tx_a);
        bus.subscribe(tx_b);

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.publish("fail", JobSnapshot::new("1", "a"));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_closed_sinks_are_pruned() {
        let bus = JobEventBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(tx);
        drop(rx);

        assert_eq!(bus.publish("create", JobSnapshot::new("1", "a")), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let bus = JobEventBus::new();
        let producer = bus.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(tx);

        producer.publish("queued", JobSnapshot::new("9", "b"));

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Queued);
    }

    #[test]
    fn test_close_ends_every_stream() {
        let bus = JobEventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = bus.subscribe(tx);
        bus.publish("create", JobSnapshot::new("1", "a"));

        assert_eq!(bus.close(), 1);

        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Created);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(!bus.unsubscribe(subscription));
    }
}
