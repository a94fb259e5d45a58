use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::protocol::PipelineEvent;

#[derive(Default)]
struct Inner {
    senders: Vec<flume::Sender<PipelineEvent>>,
    backlog: VecDeque<PipelineEvent>,
    backlog_cap: usize,
}

/// Fan-out of pipeline events over flume channels.
///
/// Every subscriber gets its own unbounded receiver. A bus built with
/// [`EventBus::with_backlog`] also keeps the most recent events and replays
/// them to new subscribers, so a client that attaches after the pipeline has
/// started still sees the plan. Clones share subscribers and backlog.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep up to `cap` of the latest events for replay.
    pub fn with_backlog(cap: usize) -> Self {
        let bus = Self::new();
        bus.lock().backlog_cap = cap;
        bus
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber. Backlogged events are queued on it first, in
    /// publish order.
    pub fn subscribe(&self) -> flume::Receiver<PipelineEvent> {
        let (tx, rx) = flume::unbounded();
        let mut inner = self.lock();
        for event in &inner.backlog {
            // The receiver is still in hand, so this cannot fail.
            let _ = tx.send(event.clone());
        }
        inner.senders.push(tx);
        rx
    }

    /// Send to every live subscriber, pruning those whose receiver is gone.
    pub fn publish(&self, event: PipelineEvent) {
        tracing::trace!(kind = event.kind(), "publish");
        let mut inner = self.lock();
        if inner.backlog_cap > 0 {
            if inner.backlog.len() == inner.backlog_cap {
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(event.clone());
        }
        inner.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }
}
