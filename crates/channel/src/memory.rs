//! In-process broker implementing [`TaskChannel`].
//!
//! Each `(pattern, group)` pair owns one work queue. Publishing copies a
//! message into every matching queue; subscribers of the same group compete
//! for it. A delivery moves the message to the group's pending table until it
//! is acked, nacked, or its ack-wait expires, at which point it is queued
//! again. After `max_deliver` deliveries a message is dropped (dead letter).
//!
//! Durable publishes that match no group are retained and handed to the
//! first group that subscribes with a matching pattern. Broadcasts only reach
//! groups with at least one live subscription. A detached group with nothing
//! queued is forgotten.
//!
//! Messages older than their topic's `max_age` are discarded wherever they
//! wait: retained, queued, or awaiting redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{Acknowledger, Delivery, Subscription, TaskChannel};
use crate::error::ChannelError;
use crate::subject::{matches, validate_pattern, validate_topic};

/// Default time a delivery may stay unsettled before redelivery.
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Default delivery ceiling before a message is dead-lettered.
const DEFAULT_MAX_DELIVER: u32 = 5;

const DEFAULT_NACK_DELAY: Duration = Duration::from_secs(1);

/// Work queues keep messages for a day.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunable delivery parameters shared by every consumer group.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub ack_wait: Duration,
    /// `None` redelivers forever.
    pub max_deliver: Option<u32>,
    /// Pause before a nacked message is offered again.
    pub nack_delay: Duration,
    /// Age at which an undelivered or unsettled message is discarded.
    pub max_age: Duration,
    /// `(pattern, max_age)` pairs checked in order before `max_age`.
    pub max_age_overrides: Vec<(String, Duration)>,
}

impl BrokerConfig {
    /// The `max_age` that applies to messages published on `topic`.
    pub fn max_age_for(&self, topic: &str) -> Duration {
        self.max_age_overrides
            .iter()
            .find(|(pattern, _)| matches(pattern, topic))
            .map(|(_, age)| *age)
            .unwrap_or(self.max_age)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: Some(DEFAULT_MAX_DELIVER),
            nack_delay: DEFAULT_NACK_DELAY,
            max_age: DEFAULT_MAX_AGE,
            max_age_overrides: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Message {
    id: u64,
    topic: String,
    payload: Vec<u8>,
    deliveries: u32,
    /// `None` when the max age does not fit in an `Instant`.
    expires_at: Option<Instant>,
}

impl Message {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Pending {
    message: Message,
    deadline: Instant,
}

#[derive(Default)]
struct GroupQueue {
    ready: VecDeque<Message>,
    pending: HashMap<u64, Pending>,
}

impl GroupQueue {
    /// Move deliveries whose ack-wait or nack delay has passed back to the
    /// front of the ready queue.
    fn requeue_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        // Oldest first so redelivery order follows publish order.
        expired.sort_unstable_by(|a, b| b.cmp(a));
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                tracing::debug!(
                    topic = %p.message.topic,
                    deliveries = p.message.deliveries,
                    "Delivery unsettled or nacked, redelivering",
                );
                self.ready.push_front(p.message);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    fn drop_expired(&mut self, now: Instant) {
        let before = self.ready.len();
        self.ready.retain(|m| !m.is_expired(now));
        let dropped = before - self.ready.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded queued messages past max age");
        }
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty()
    }
}

struct ConsumerGroup {
    pattern: String,
    name: String,
    queue: Mutex<GroupQueue>,
    notify: Notify,
    /// Live `MemorySubscription`s on this group.
    subscribers: AtomicUsize,
}

impl ConsumerGroup {
    async fn enqueue(&self, message: Message) {
        let mut queue = self.queue.lock().await;
        queue.drop_expired(Instant::now());
        queue.ready.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    fn is_attached(&self) -> bool {
        self.subscribers.load(Ordering::Acquire) > 0
    }

    /// Detached with nothing queued or in flight. A queue that is busy
    /// right now counts as not idle.
    fn is_idle(&self) -> bool {
        !self.is_attached() && self.queue.try_lock().is_ok_and(|q| q.is_empty())
    }
}

#[derive(Default)]
struct BrokerState {
    groups: Vec<Arc<ConsumerGroup>>,
    retained: VecDeque<Message>,
    next_id: u64,
}

impl BrokerState {
    fn prune(&mut self, now: Instant) {
        let before = self.retained.len();
        self.retained.retain(|m| !m.is_expired(now));
        let expired = before - self.retained.len();
        if expired > 0 {
            tracing::debug!(expired, "Discarded retained messages past max age");
        }

        self.groups.retain(|g| {
            let idle = g.is_idle();
            if idle {
                tracing::debug!(pattern = %g.pattern, group = %g.name, "Forgetting detached consumer group");
            }
            !idle
        });
    }
}

/// Process-local broker. Cheap to share behind an `Arc`.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    config: BrokerConfig,
    closed: CancellationToken,
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            config,
            closed: CancellationToken::new(),
        }
    }

    /// Number of durable messages waiting for a matching group.
    pub async fn retained_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        state.retained.len()
    }

    /// Number of consumer groups the broker still tracks.
    pub async fn group_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        state.groups.len()
    }

    async fn route(
        &self,
        topic: &str,
        payload: Vec<u8>,
        durable: bool,
    ) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        validate_topic(topic)?;

        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.prune(now);
        state.next_id += 1;
        let message = Message {
            id: state.next_id,
            topic: topic.to_string(),
            payload,
            deliveries: 0,
            expires_at: now.checked_add(self.config.max_age_for(topic)),
        };

        // Durable groups keep receiving while detached; broadcasts only
        // reach groups someone is listening on.
        let targets: Vec<Arc<ConsumerGroup>> = state
            .groups
            .iter()
            .filter(|g| matches(&g.pattern, topic) && (durable || g.is_attached()))
            .cloned()
            .collect();

        if targets.is_empty() {
            if durable {
                tracing::trace!(topic, "No consumer group yet, retaining message");
                state.retained.push_back(message);
            } else {
                tracing::trace!(topic, "No consumer group, dropping broadcast");
            }
            return Ok(());
        }
        drop(state);

        for group in targets {
            group.enqueue(message.clone()).await;
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl TaskChannel for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.route(topic, payload, true).await
    }

    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.route(topic, payload, false).await
    }

    async fn subscribe(
        &self,
        pattern: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        validate_pattern(pattern)?;

        let mut state = self.state.lock().await;
        state.prune(Instant::now());
        let existing = state
            .groups
            .iter()
            .find(|g| g.pattern == pattern && g.name == group)
            .cloned();

        let consumer_group = match existing {
            Some(g) => g,
            None => {
                let g = Arc::new(ConsumerGroup {
                    pattern: pattern.to_string(),
                    name: group.to_string(),
                    queue: Mutex::new(GroupQueue::default()),
                    notify: Notify::new(),
                    subscribers: AtomicUsize::new(0),
                });

                // Hand over retained work this group is the first to match.
                let (claimed, kept): (VecDeque<Message>, VecDeque<Message>) = state
                    .retained
                    .drain(..)
                    .partition(|m| matches(pattern, &m.topic));
                state.retained = kept;
                if !claimed.is_empty() {
                    tracing::debug!(
                        pattern,
                        group,
                        count = claimed.len(),
                        "Delivering retained messages to new consumer group",
                    );
                    g.queue.lock().await.ready.extend(claimed);
                }

                state.groups.push(Arc::clone(&g));
                tracing::debug!(pattern, group, "Consumer group created");
                g
            }
        };

        consumer_group.subscribers.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemorySubscription {
            group: consumer_group,
            config: self.config.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        tracing::info!("Closing in-memory broker");
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

struct MemorySubscription {
    group: Arc<ConsumerGroup>,
    config: BrokerConfig,
    closed: CancellationToken,
}

impl MemorySubscription {
    /// Pop the next deliverable message, or report when to look again.
    async fn try_take(&self) -> Result<Delivery, Option<Instant>> {
        let mut queue = self.group.queue.lock().await;
        let now = Instant::now();
        queue.requeue_expired(now);

        while let Some(mut message) = queue.ready.pop_front() {
            if message.is_expired(now) {
                tracing::debug!(
                    topic = %message.topic,
                    group = %self.group.name,
                    "Message past max age, discarding",
                );
                continue;
            }
            message.deliveries += 1;
            if let Some(max) = self.config.max_deliver {
                if message.deliveries > max {
                    tracing::error!(
                        topic = %message.topic,
                        group = %self.group.name,
                        deliveries = max,
                        "Message exceeded max deliveries, dropping",
                    );
                    continue;
                }
            }

            queue.pending.insert(
                message.id,
                Pending {
                    message: message.clone(),
                    deadline: now + self.config.ack_wait,
                },
            );

            let acker = MemoryAcker {
                group: Arc::clone(&self.group),
                id: message.id,
                delivery: message.deliveries,
                nack_delay: self.config.nack_delay,
            };
            return Ok(Delivery::new(
                message.topic,
                message.payload,
                message.deliveries,
                Box::new(acker),
            ));
        }

        Err(queue.next_deadline())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if self.group.subscribers.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!(
                pattern = %self.group.pattern,
                group = %self.group.name,
                "Consumer group detached",
            );
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }

            let wake_at = match self.try_take().await {
                Ok(delivery) => return Some(delivery),
                Err(wake_at) => wake_at,
            };

            let notified = self.group.notify.notified();
            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = self.closed.cancelled() => return None,
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.closed.cancelled() => return None,
                        _ = notified => {}
                    }
                }
            }
        }
    }
}

struct MemoryAcker {
    group: Arc<ConsumerGroup>,
    id: u64,
    delivery: u32,
    nack_delay: Duration,
}

impl MemoryAcker {
    /// Remove the pending entry if it still belongs to this delivery. A
    /// settle that arrives after the ack-wait already requeued the message
    /// is ignored.
    fn take_pending(&self, queue: &mut GroupQueue) -> Option<Message> {
        match queue.pending.get(&self.id) {
            Some(p) if p.message.deliveries == self.delivery => {
                queue.pending.remove(&self.id).map(|p| p.message)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) {
        let mut queue = self.group.queue.lock().await;
        self.take_pending(&mut queue);
    }

    /// Offer the message again once `nack_delay` has passed.
    async fn nack(&self) {
        let mut queue = self.group.queue.lock().await;
        if let Some(message) = self.take_pending(&mut queue) {
            if self.nack_delay.is_zero() {
                queue.ready.push_front(message);
            } else {
                let deadline = Instant::now() + self.nack_delay;
                queue.pending.insert(message.id, Pending { message, deadline });
            }
            drop(queue);
            self.group.notify.notify_one();
        }
    }
}
