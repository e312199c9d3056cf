//! Process-wide, topic-addressed publish/subscribe.
//!
//! Every topic owns a bounded `tokio::sync::broadcast` channel and a sequence
//! counter. Publishing assigns the next sequence number and hands the event to
//! the channel while the topic table is locked, so all subscribers of a topic
//! observe events in sequence order.
//!
//! Back-pressure policy is drop-oldest: a subscriber that falls more than the
//! topic capacity behind skips the oldest events. The skipped count is
//! reported by [`Subscription::missed`] and the `events_dropped` metric.
//! Publishers never wait on subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::event::{Event, EventPayload, Topic};
use crate::metrics::METRICS;

/// Per-topic buffer size used by [`EventBus::new`].
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

struct TopicChannel {
    sender: broadcast::Sender<Event>,
    next_seq: u64,
}

impl TopicChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_seq: 0,
        }
    }
}

struct BusInner {
    capacity: usize,
    topics: Mutex<HashMap<Topic, TopicChannel>>,
    shut_down: AtomicBool,
}

/// Cloneable handle to the shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("shut_down", &self.inner.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a bus whose topics buffer at most `capacity` undelivered events
    /// per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<Topic, TopicChannel>> {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish `payload` on `topic` and return the sequence number it was given.
    ///
    /// Topics need no registration. With no subscribers this is a no-op that
    /// still advances the topic's sequence counter.
    pub fn publish(&self, topic: Topic, payload: EventPayload) -> u64 {
        let capacity = self.inner.capacity;
        let mut topics = self.topics();
        let channel = topics
            .entry(topic.clone())
            .or_insert_with(|| TopicChannel::new(capacity));

        let seq = channel.next_seq;
        channel.next_seq += 1;

        let event = Event {
            topic,
            seq,
            timestamp: Utc::now(),
            payload,
        };

        METRICS.inc_events_published();
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return seq;
        }
        // Err only means nobody is listening.
        let _ = channel.sender.send(event);
        seq
    }

    /// Subscribe to events published on `topic` from now on.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let capacity = self.inner.capacity;
        let mut topics = self.topics();
        let receiver = if self.inner.shut_down.load(Ordering::SeqCst) {
            None
        } else {
            let channel = topics
                .entry(topic.clone())
                .or_insert_with(|| TopicChannel::new(capacity));
            Some(channel.sender.subscribe())
        };
        debug!(topic = %topic, "subscribed");

        Subscription {
            topic,
            receiver,
            missed: 0,
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics()
            .get(topic)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// End every live subscription. Later publishes are counted but not
    /// delivered and later subscriptions are already finished.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let capacity = self.inner.capacity;
        for channel in self.topics().values_mut() {
            // Dropping the old sender closes its receivers.
            channel.sender = broadcast::channel(capacity).0;
        }
        debug!("event bus shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

/// A live binding from one consumer to one topic.
///
/// Single pass and never replays history. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    receiver: Option<broadcast::Receiver<Event>>,
    missed: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.receiver.is_some())
            .field("missed", &self.missed)
            .finish()
    }
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Whether the subscription can still yield events.
    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }

    /// Events skipped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn record_lag(&mut self, skipped: u64) {
        self.missed += skipped;
        METRICS.add_events_dropped(skipped);
        warn!(topic = %self.topic, skipped, "subscriber lagged, oldest events dropped");
    }

    /// Wait for the next event. Returns `None` once the subscription has been
    /// cancelled or the bus shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Take the next already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Release the subscription. Calling it again does nothing.
    pub fn unsubscribe(&mut self) {
        if self.receiver.take().is_some() {
            debug!(topic = %self.topic, "unsubscribed");
        }
    }

    /// Adapt into a [`Stream`] that ends with the subscription.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceId;

    fn line(text: &str) -> EventPayload {
        EventPayload::SerialLine {
            device_id: DeviceId::new("rx1"),
            text: text.to_string(),
        }
    }

    fn topic() -> Topic {
        Topic::Serial(DeviceId::new("rx1"))
    }

    #[test]
    fn publish_without_subscribers_advances_sequence() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(topic(), line("a")), 0);
        assert_eq!(bus.publish(topic(), line("b")), 1);

        let mut sub = bus.subscribe(topic());
        bus.publish(topic(), line("c"));
        let event = sub.try_recv().unwrap();
        assert_eq!(event.seq, 2);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn topics_have_independent_counters() {
        let bus = EventBus::new();
        bus.publish(topic(), line("a"));
        let other = Topic::Serial(DeviceId::new("rx2"));
        assert_eq!(bus.publish(other, line("b")), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(topic());
        assert_eq!(bus.subscriber_count(&topic()), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(&topic()), 0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_drops_oldest() {
        let bus = EventBus::with_capacity(4);
        let mut sub = bus.subscribe(topic());
        for i in 0..10 {
            bus.publish(topic(), line(&i.to_string()));
        }
        let first = sub.try_recv().unwrap();
        assert_eq!(first.seq, 6);
        assert_eq!(sub.missed(), 6);
        let rest: Vec<u64> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.seq).collect();
        assert_eq!(rest, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn shutdown_ends_subscriptions() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(topic());
        bus.shutdown();
        assert!(sub.recv().await.is_none());
        assert!(!sub.is_active());

        let mut late = bus.subscribe(topic());
        assert!(late.recv().await.is_none());
    }
}
