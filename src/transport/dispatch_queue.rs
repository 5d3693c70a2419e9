//! # Dispatch Queue
//!
//! Hands inbound messages and lifecycle events from producer threads to the single
//! consumer tick.
//!
//! ## Backpressure
//! Inbound messages are bounded by `capacity`. When the queue is full the new
//! message is dropped (its buffer goes straight back to the pool) and one overflow
//! notification is scheduled for the next drain. The notification re-arms only
//! after the queue has drained to empty, so sustained overflow produces one warning
//! per episode instead of one per message. Lifecycle events are never dropped.
//!
//! The reported count covers the drops up to the drain that reports them. Drops
//! later in the same episode are only counted in the `frames_dropped` metric.
//!
//! ## Ownership
//! An [`InboundItem`] owns its pooled buffer from enqueue until the sink has seen
//! it; dropping the item returns the buffer, whatever the sink did.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::transport::{deliver_event, TransportEvent, TransportSink};
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};
use crate::utils::metrics::Metrics;

/// One inbound message waiting for the consumer
#[derive(Debug)]
pub struct InboundItem {
    pub session_id: u64,
    pub buffer: PooledBuffer,
}

impl InboundItem {
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[derive(Debug)]
enum Queued {
    Event(TransportEvent),
    Message(InboundItem),
}

#[derive(Debug)]
struct QueuedItem {
    attempt: u64,
    item: Queued,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<QueuedItem>,
    messages: usize,
    overflow_armed: bool,
    overflow_scheduled: bool,
    dropped_in_episode: u64,
}

/// Bounded FIFO between producers and the consumer tick
#[derive(Debug)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    pool: BufferPool,
    capacity: usize,
    metrics: Arc<Metrics>,
}

impl DispatchQueue {
    pub fn new(capacity: usize, pool: BufferPool, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                messages: 0,
                overflow_armed: true,
                overflow_scheduled: false,
                dropped_in_episode: 0,
            }),
            pool,
            capacity,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panicking sink never holds this lock, so the state is consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a lifecycle event for `attempt`
    pub fn enqueue_event(&self, attempt: u64, event: TransportEvent) {
        trace!(attempt, ?event, "Queueing transport event");
        self.lock().items.push_back(QueuedItem {
            attempt,
            item: Queued::Event(event),
        });
    }

    /// Copy `message` into a pooled buffer and queue it.
    ///
    /// Returns `false` when the queue was full and the message was dropped.
    pub fn enqueue_message(&self, attempt: u64, session_id: u64, message: &[u8]) -> bool {
        let buffer = self.pool.rent_copy(message);

        let mut state = self.lock();
        if state.messages >= self.capacity {
            state.dropped_in_episode += 1;
            if state.overflow_armed {
                state.overflow_armed = false;
                state.overflow_scheduled = true;
            }
            drop(state);
            drop(buffer);
            self.metrics.frame_dropped();
            return false;
        }

        state.messages += 1;
        state.items.push_back(QueuedItem {
            attempt,
            item: Queued::Message(InboundItem { session_id, buffer }),
        });
        true
    }

    /// Deliver the items present when the drain starts, in FIFO order.
    ///
    /// Items queued by an attempt other than `current_attempt` are discarded.
    /// Returns the number of items delivered to `sink`.
    pub fn drain(&self, current_attempt: u64, sink: &mut dyn TransportSink) -> usize {
        self.drain_with(&|| current_attempt, sink)
    }

    /// Like [`drain`](Self::drain), but reads the current attempt from `current`
    /// before each item, so a connect issued by the sink mid-drain discards the
    /// rest of the superseded attempt.
    pub fn drain_tracking(&self, current: &AtomicU64, sink: &mut dyn TransportSink) -> usize {
        self.drain_with(&|| current.load(Ordering::Acquire), sink)
    }

    fn drain_with(&self, current: &dyn Fn() -> u64, sink: &mut dyn TransportSink) -> usize {
        let (budget, overflow) = {
            let mut state = self.lock();
            let overflow = if state.overflow_scheduled {
                state.overflow_scheduled = false;
                Some(std::mem::take(&mut state.dropped_in_episode))
            } else {
                None
            };
            (state.items.len(), overflow)
        };

        if let Some(dropped) = overflow {
            warn!(
                dropped,
                capacity = self.capacity,
                "Dispatch queue overflow, dropping inbound messages"
            );
            sink.on_overflow(dropped);
        }

        let mut delivered = 0;
        for _ in 0..budget {
            let Some(queued) = self.pop() else {
                break;
            };

            let current_attempt = current();
            if queued.attempt != current_attempt {
                trace!(
                    attempt = queued.attempt,
                    current_attempt,
                    "Discarding item from superseded attempt"
                );
                continue;
            }

            sink.begin_item(queued.attempt);
            match queued.item {
                Queued::Event(event) => deliver_event(sink, event),
                Queued::Message(item) => sink.on_message(item.session_id, &item.buffer),
            }
            delivered += 1;
        }
        delivered
    }

    fn pop(&self) -> Option<QueuedItem> {
        let mut state = self.lock();
        let queued = state.items.pop_front()?;
        if matches!(queued.item, Queued::Message(_)) {
            state.messages -= 1;
        }
        if state.items.is_empty() {
            state.overflow_armed = true;
            state.dropped_in_episode = 0;
        }
        Some(queued)
    }

    /// Number of queued items (events and messages)
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued inbound messages
    pub fn message_count(&self) -> usize {
        self.lock().messages
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Vec<Vec<u8>>,
        events: Vec<String>,
        overflows: Vec<u64>,
        panic_on: Option<u8>,
    }

    impl TransportSink for Recorder {
        fn on_open(&mut self, protocol: &str) {
            self.events.push(format!("open:{protocol}"));
        }
        fn on_connect_failed(&mut self, reason: &str) {
            self.events.push(format!("connect_failed:{reason}"));
        }
        fn on_error(&mut self, message: &str) {
            self.events.push(format!("error:{message}"));
        }
        fn on_close(&mut self, code: u16, reason: &str) {
            self.events.push(format!("close:{code}:{reason}"));
        }
        fn on_message(&mut self, _session_id: u64, message: &[u8]) {
            if self.panic_on == message.first().copied() {
                panic!("sink failure");
            }
            self.messages.push(message.to_vec());
        }
        fn on_overflow(&mut self, dropped: u64) {
            self.overflows.push(dropped);
        }
    }

    fn queue(capacity: usize) -> DispatchQueue {
        DispatchQueue::new(capacity, BufferPool::new(4), Arc::new(Metrics::new()))
    }

    #[test]
    fn drains_in_fifo_order() {
        let q = queue(8);
        q.enqueue_event(1, TransportEvent::Open { protocol: "p".into() });
        q.enqueue_message(1, 7, b"A");
        q.enqueue_message(1, 7, b"B");

        let mut sink = Recorder::default();
        assert_eq!(q.drain(1, &mut sink), 3);
        assert_eq!(sink.events, vec!["open:p"]);
        assert_eq!(sink.messages, vec![b"A".to_vec(), b"B".to_vec()]);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_only_covers_items_present_at_start() {
        struct Refill<'a> {
            queue: &'a DispatchQueue,
            seen: usize,
        }
        impl TransportSink for Refill<'_> {
            fn on_open(&mut self, _: &str) {}
            fn on_connect_failed(&mut self, _: &str) {}
            fn on_error(&mut self, _: &str) {}
            fn on_close(&mut self, _: u16, _: &str) {}
            fn on_message(&mut self, _: u64, _: &[u8]) {
                self.seen += 1;
                self.queue.enqueue_message(1, 0, b"later");
            }
        }

        let q = queue(8);
        q.enqueue_message(1, 0, b"now");
        let mut sink = Refill { queue: &q, seen: 0 };
        assert_eq!(q.drain(1, &mut sink), 1);
        assert_eq!(sink.seen, 1);
        assert_eq!(q.message_count(), 1);
    }

    #[test]
    fn overflow_drops_newest_and_notifies_once() {
        let q = queue(3);
        for i in 0..4u8 {
            q.enqueue_message(1, 0, &[i]);
        }
        assert_eq!(q.message_count(), 3);
        assert_eq!(q.pool().outstanding(), 3);

        let mut sink = Recorder::default();
        q.drain(1, &mut sink);
        assert_eq!(sink.overflows, vec![1]);
        assert_eq!(sink.messages, vec![vec![0], vec![1], vec![2]]);

        // Re-armed after draining to empty
        for i in 0..4u8 {
            q.enqueue_message(1, 0, &[i]);
        }
        q.drain(1, &mut sink);
        assert_eq!(sink.overflows, vec![1, 1]);
    }

    #[test]
    fn sustained_overflow_notifies_once_per_episode() {
        let q = queue(2);
        for i in 0..10u8 {
            q.enqueue_message(1, 0, &[i]);
        }
        let mut sink = Recorder::default();
        q.drain(1, &mut sink);
        q.drain(1, &mut sink);
        assert_eq!(sink.overflows, vec![8]);
    }

    #[test]
    fn drops_after_the_report_stay_in_the_metric() {
        struct Flood<'a> {
            queue: &'a DispatchQueue,
            overflows: Vec<u64>,
        }
        impl TransportSink for Flood<'_> {
            fn on_open(&mut self, _: &str) {}
            fn on_connect_failed(&mut self, _: &str) {}
            fn on_error(&mut self, _: &str) {}
            fn on_close(&mut self, _: u16, _: &str) {}
            fn on_message(&mut self, _: u64, _: &[u8]) {
                for _ in 0..3 {
                    self.queue.enqueue_message(1, 0, b"more");
                }
            }
            fn on_overflow(&mut self, dropped: u64) {
                self.overflows.push(dropped);
            }
        }

        let metrics = Arc::new(Metrics::new());
        let q = DispatchQueue::new(2, BufferPool::new(4), metrics.clone());
        for i in 0..3u8 {
            q.enqueue_message(1, 0, &[i]);
        }

        let mut sink = Flood {
            queue: &q,
            overflows: Vec::new(),
        };
        q.drain(1, &mut sink);
        assert_eq!(sink.overflows, vec![1]);

        // Same episode: the queue never emptied, so no second report
        q.drain(1, &mut sink);
        assert_eq!(sink.overflows, vec![1]);
        assert!(metrics.snapshot().frames_dropped > 1);
    }

    #[test]
    fn connect_during_drain_discards_rest_of_old_attempt() {
        struct Reconnect<'a> {
            current: &'a AtomicU64,
            seen: Vec<(u64, String)>,
            attempt: u64,
        }
        impl TransportSink for Reconnect<'_> {
            fn begin_item(&mut self, attempt: u64) {
                self.attempt = attempt;
            }
            fn on_open(&mut self, p: &str) {
                self.seen.push((self.attempt, format!("open:{p}")));
            }
            fn on_connect_failed(&mut self, _: &str) {}
            fn on_error(&mut self, _: &str) {}
            fn on_close(&mut self, code: u16, _: &str) {
                self.seen.push((self.attempt, format!("close:{code}")));
            }
            fn on_message(&mut self, _: u64, _: &[u8]) {
                self.seen.push((self.attempt, "message".into()));
                self.current.store(2, Ordering::Release);
            }
        }

        let q = queue(8);
        q.enqueue_event(1, TransportEvent::Open { protocol: "old".into() });
        q.enqueue_message(1, 0, b"x");
        q.enqueue_event(1, TransportEvent::Close { code: 1000, reason: String::new() });
        q.enqueue_event(2, TransportEvent::Open { protocol: "new".into() });

        let current = AtomicU64::new(1);
        let mut sink = Reconnect {
            current: &current,
            seen: Vec::new(),
            attempt: 0,
        };
        assert_eq!(q.drain_tracking(&current, &mut sink), 3);
        assert_eq!(
            sink.seen,
            vec![
                (1, "open:old".to_string()),
                (1, "message".to_string()),
                (2, "open:new".to_string()),
            ]
        );
    }

    #[test]
    fn events_bypass_capacity() {
        let q = queue(1);
        q.enqueue_message(1, 0, b"x");
        q.enqueue_event(1, TransportEvent::Close { code: 1000, reason: String::new() });
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn stale_attempt_items_are_discarded_and_returned() {
        let q = queue(8);
        q.enqueue_message(1, 0, b"old");
        q.enqueue_event(1, TransportEvent::Close { code: 1006, reason: String::new() });
        q.enqueue_message(2, 0, b"new");

        let mut sink = Recorder::default();
        assert_eq!(q.drain(2, &mut sink), 1);
        assert!(sink.events.is_empty());
        assert_eq!(sink.messages, vec![b"new".to_vec()]);
        assert_eq!(q.pool().outstanding(), 0);
    }

    #[test]
    fn buffer_returned_when_sink_panics() {
        let q = queue(8);
        q.enqueue_message(1, 0, &[1]);
        q.enqueue_message(1, 0, &[2]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut sink = Recorder {
                panic_on: Some(1),
                ..Recorder::default()
            };
            q.drain(1, &mut sink);
        }));
        assert!(result.is_err());
        assert_eq!(q.pool().rented(), 2);
        assert_eq!(q.pool().returned(), 1);

        let mut sink = Recorder::default();
        q.drain(1, &mut sink);
        assert_eq!(sink.messages, vec![vec![2]]);
        assert_eq!(q.pool().outstanding(), 0);
    }
}
