//! Typed publish/subscribe backbone for the pipeline.
//!
//! Every component talks to the others exclusively through this bus. Publishing
//! never runs subscriber code inline: each subscriber owns a bounded queue and a
//! topic-specific overflow policy. Blocking topics exert back-pressure on the
//! publisher when a queue fills; lossy topics discard the oldest queued event so
//! stale data cannot grow latency. Fan-out for a topic is serialized, so every
//! subscriber observes that topic's events in one publish order. There is no
//! ordering guarantee across topics.
//!
//! Delivery is at-most-once per subscriber and stays in-process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::events::{Event, Payload};

/// Topics events are published on. Each [`Payload`](crate::events::Payload)
/// variant maps to exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Capture audio chunks.
    Audio,
    /// Utterance boundaries and voiced-frame progress from the segmenter.
    Vad,
    /// Partial and final transcripts.
    Transcripts,
    /// Turn lifecycle: generation requests, cancellations, completions.
    Turns,
    /// Generated response text increments.
    Responses,
    /// Synthesized audio increments.
    Synthesis,
    /// Playback sink commands.
    Playback,
    /// Session state and stream availability.
    Control,
    /// Reserved diagnostics topic: warnings, data loss, handler faults.
    Diagnostics,
}

impl Topic {
    /// Every topic, in a fixed order used for internal indexing.
    pub const ALL: [Topic; 9] = [
        Topic::Audio,
        Topic::Vad,
        Topic::Transcripts,
        Topic::Turns,
        Topic::Responses,
        Topic::Synthesis,
        Topic::Playback,
        Topic::Control,
        Topic::Diagnostics,
    ];

    /// Overflow policy applied when a subscriber queue on this topic is full.
    ///
    /// Live audio and diagnostics drop oldest so a slow consumer cannot grow
    /// end-to-end latency or jam the pipeline; everything else blocks the
    /// publisher to guarantee no loss.
    pub fn policy(self) -> OverflowPolicy {
        match self {
            Topic::Audio | Topic::Diagnostics => OverflowPolicy::DropOldest,
            _ => OverflowPolicy::BlockPublisher,
        }
    }

    fn index(self) -> usize {
        match self {
            Topic::Audio => 0,
            Topic::Vad => 1,
            Topic::Transcripts => 2,
            Topic::Turns => 3,
            Topic::Responses => 4,
            Topic::Synthesis => 5,
            Topic::Playback => 6,
            Topic::Control => 7,
            Topic::Diagnostics => 8,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Topic::Audio => "audio",
            Topic::Vad => "vad",
            Topic::Transcripts => "transcripts",
            Topic::Turns => "turns",
            Topic::Responses => "responses",
            Topic::Synthesis => "synthesis",
            Topic::Playback => "playback",
            Topic::Control => "control",
            Topic::Diagnostics => "diagnostics",
        };
        write!(f, "{name}")
    }
}

/// What happens to new events when a subscriber queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Publishing waits for queue space; nothing is lost.
    BlockPublisher,
    /// The oldest queued event is discarded and counted; publishing never waits.
    DropOldest,
}

/// Single-consumer drop-oldest queue used for lossy topics.
struct LossyQueue {
    capacity: usize,
    items: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    detached: AtomicBool,
}

impl LossyQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    fn push(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) || self.detached.load(Ordering::Acquire) {
            return;
        }
        {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            if items.len() == self.capacity {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Cancel-safe: an abandoned wait consumes nothing.
    async fn pop(&self) -> Option<Event> {
        loop {
            let front = self
                .items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if let Some(event) = front {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[derive(Clone)]
enum SlotQueue {
    Blocking(mpsc::Sender<Event>),
    Lossy(Arc<LossyQueue>),
}

#[derive(Clone)]
struct SubscriberSlot {
    name: Arc<str>,
    queue: SlotQueue,
}

impl SubscriberSlot {
    /// Delivers one event; returns false when the subscriber is gone.
    async fn deliver(&self, event: Event) -> bool {
        match &self.queue {
            SlotQueue::Blocking(tx) => tx.send(event).await.is_ok(),
            SlotQueue::Lossy(queue) => {
                if queue.detached.load(Ordering::Acquire) {
                    return false;
                }
                queue.push(event);
                true
            }
        }
    }
}

struct TopicState {
    /// Serializes fan-out so all subscribers see one publish order per topic.
    dispatch: tokio::sync::Mutex<()>,
    slots: Mutex<Vec<SubscriberSlot>>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            dispatch: tokio::sync::Mutex::new(()),
            slots: Mutex::new(Vec::new()),
        }
    }
}

struct BusInner {
    config: BusConfig,
    topics: [TopicState; Topic::ALL.len()],
}

/// In-process typed event bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                topics: std::array::from_fn(|_| TopicState::new()),
            }),
        }
    }

    /// Publish one event to every current subscriber of its topic.
    ///
    /// Never runs subscriber code inline. On lossy topics this returns without
    /// waiting; on blocking topics it waits for space in any full subscriber
    /// queue, which is the back-pressure the policy asks for.
    pub async fn publish(&self, event: Event) {
        let topic = event.topic();
        let state = &self.inner.topics[topic.index()];
        let _order = state.dispatch.lock().await;

        let snapshot: Vec<SubscriberSlot> = state
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut gone: Vec<Arc<str>> = Vec::new();
        for slot in &snapshot {
            if !slot.deliver(event.clone()).await {
                gone.push(Arc::clone(&slot.name));
            }
        }

        if !gone.is_empty() {
            let mut slots = state.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|slot| {
                let keep = !gone.iter().any(|g| Arc::ptr_eq(g, &slot.name));
                if !keep {
                    debug!("bus: pruned subscriber '{}' from {topic}", slot.name);
                }
                keep
            });
        }
    }

    /// Publish a payload for `session`, stamped with the current time.
    pub async fn emit(&self, session: crate::events::SessionId, payload: Payload) {
        self.publish(Event::new(session, payload)).await;
    }

    /// Register a pull-style subscriber on `topic`. The name appears in fault
    /// diagnostics and logs.
    pub fn subscribe(&self, topic: Topic, name: &str) -> Subscription {
        let name: Arc<str> = Arc::from(name);
        let depth = if topic == Topic::Audio {
            self.inner.config.audio_queue_depth
        } else {
            self.inner.config.queue_depth
        };

        let source = match topic.policy() {
            OverflowPolicy::BlockPublisher => {
                let (tx, rx) = mpsc::channel(depth.max(1));
                self.add_slot(topic, Arc::clone(&name), SlotQueue::Blocking(tx));
                SubscriptionSource::Blocking(rx)
            }
            OverflowPolicy::DropOldest => {
                let queue = Arc::new(LossyQueue::new(depth));
                self.add_slot(topic, Arc::clone(&name), SlotQueue::Lossy(Arc::clone(&queue)));
                SubscriptionSource::Lossy(queue)
            }
        };

        debug!("bus: subscriber '{name}' attached to {topic}");
        Subscription {
            topic,
            name,
            source,
        }
    }

    /// Spawn a drain task invoking `handler` for every event on `topic`.
    ///
    /// A handler returning `Err` is isolated: the failure is republished as a
    /// `HandlerFault` on [`Topic::Diagnostics`] (or only logged when the
    /// faulting handler itself listens on diagnostics) and delivery continues.
    /// The task ends when the bus closes.
    pub fn attach<F, Fut>(
        &self,
        topic: Topic,
        name: &str,
        mut handler: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send,
    {
        let mut subscription = self.subscribe(topic, name);
        let bus = self.clone();
        let name = Arc::clone(&subscription.name);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let session = event.session;
                if let Err(error) = handler(event).await {
                    warn!("bus: handler '{name}' failed on {topic}: {error}");
                    if topic != Topic::Diagnostics {
                        bus.emit(
                            session,
                            Payload::HandlerFault {
                                topic,
                                subscriber: name.to_string(),
                                detail: error.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            debug!("bus: handler '{name}' on {topic} finished");
        })
    }

    /// Detach every subscriber and wake pending receivers; subsequent
    /// `recv` calls return `None`.
    pub fn close(&self) {
        for state in &self.inner.topics {
            let slots = {
                let mut slots = state.slots.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *slots)
            };
            for slot in slots {
                if let SlotQueue::Lossy(queue) = slot.queue {
                    queue.close();
                }
                // Blocking senders drop here, ending their receivers.
            }
        }
    }

    fn add_slot(&self, topic: Topic, name: Arc<str>, queue: SlotQueue) {
        let state = &self.inner.topics[topic.index()];
        state
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SubscriberSlot { name, queue });
    }
}

enum SubscriptionSource {
    Blocking(mpsc::Receiver<Event>),
    Lossy(Arc<LossyQueue>),
}

/// Receiving end of one subscriber queue.
pub struct Subscription {
    topic: Topic,
    name: Arc<str>,
    source: SubscriptionSource,
}

impl Subscription {
    /// Next event on the topic, or `None` once the bus is closed.
    ///
    /// Cancel-safe: dropping the future never loses an event.
    pub async fn recv(&mut self) -> Option<Event> {
        match &mut self.source {
            SubscriptionSource::Blocking(rx) => rx.recv().await,
            SubscriptionSource::Lossy(queue) => queue.pop().await,
        }
    }

    /// Events discarded by the drop-oldest policy since subscribing.
    /// Always zero on blocking topics.
    pub fn dropped(&self) -> u64 {
        match &self.source {
            SubscriptionSource::Blocking(_) => 0,
            SubscriptionSource::Lossy(queue) => queue.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let SubscriptionSource::Lossy(queue) = &self.source {
            queue.detached.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::events::{AudioChunk, SessionId, SessionState};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn state_event(session: SessionId, to: SessionState) -> Event {
        Event::new(
            session,
            Payload::StateChanged {
                from: SessionState::Idle,
                to,
            },
        )
    }

    fn audio_event(session: SessionId, sequence: u64) -> Event {
        Event::new(
            session,
            Payload::Audio(AudioChunk {
                samples: vec![0; 16],
                sample_rate: 16_000,
                sequence,
                captured_at: Instant::now(),
                energy: 0.0,
            }),
        )
    }

    #[tokio::test]
    async fn delivers_in_publish_order_to_every_subscriber() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut first = bus.subscribe(Topic::Transcripts, "first");
        let mut second = bus.subscribe(Topic::Transcripts, "second");

        for i in 0..50u32 {
            bus.emit(
                session,
                Payload::Transcript(crate::events::Transcript {
                    utterance: crate::events::UtteranceId::new(1),
                    text: format!("t{i}"),
                    is_final: false,
                    sequence: i,
                    at: Instant::now(),
                }),
            )
            .await;
        }

        for sub in [&mut first, &mut second] {
            for i in 0..50u32 {
                let event = sub.recv().await.unwrap();
                match event.payload {
                    Payload::Transcript(t) => assert_eq!(t.sequence, i),
                    other => panic!("unexpected payload: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn lossy_topic_drops_oldest_and_counts() {
        let config = BusConfig {
            audio_queue_depth: 4,
            ..BusConfig::default()
        };
        let bus = EventBus::new(config);
        let session = SessionId::new();
        let mut sub = bus.subscribe(Topic::Audio, "stt");

        for sequence in 0..10u64 {
            bus.publish(audio_event(session, sequence)).await;
        }

        assert_eq!(sub.dropped(), 6);
        let first = sub.recv().await.unwrap();
        match first.payload {
            Payload::Audio(chunk) => assert_eq!(chunk.sequence, 6),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocking_topic_applies_back_pressure() {
        let config = BusConfig {
            queue_depth: 1,
            ..BusConfig::default()
        };
        let bus = EventBus::new(config);
        let session = SessionId::new();
        let mut sub = bus.subscribe(Topic::Control, "observer");

        bus.publish(state_event(session, SessionState::Listening)).await;

        let blocked = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.publish(state_event(session, SessionState::Thinking)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "publish should wait for queue space");

        sub.recv().await.unwrap();
        blocked.await.unwrap();
        sub.recv().await.unwrap();
    }

    #[tokio::test]
    async fn failing_handler_is_isolated_and_reported() {
        let bus = EventBus::new(BusConfig::default());
        let session = SessionId::new();
        let mut diagnostics = bus.subscribe(Topic::Diagnostics, "test");
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_in_handler = Arc::clone(&seen);
        bus.attach(Topic::Control, "flaky", move |_event| {
            let seen = Arc::clone(&seen_in_handler);
            async move {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(crate::OrchestratorError::Bus("boom".into()))
                } else {
                    Ok(())
                }
            }
        });

        bus.publish(state_event(session, SessionState::Listening)).await;
        bus.publish(state_event(session, SessionState::Thinking)).await;

        let fault = diagnostics.recv().await.unwrap();
        match fault.payload {
            Payload::HandlerFault {
                topic, subscriber, ..
            } => {
                assert_eq!(topic, Topic::Control);
                assert_eq!(subscriber, "flaky");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        // The handler kept receiving after the fault.
        tokio::time::timeout(Duration::from_secs(1), async {
            while seen.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = EventBus::new(BusConfig::default());
        let mut control = bus.subscribe(Topic::Control, "a");
        let mut audio = bus.subscribe(Topic::Audio, "b");

        bus.close();
        assert!(control.recv().await.is_none());
        assert!(audio.recv().await.is_none());
    }
}
