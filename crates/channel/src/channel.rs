//! The transport seam between the planner and the message broker.
//!
//! A [`TaskChannel`] is shared process-wide behind an `Arc` and must be safe
//! for concurrent publish and subscribe. Subscriptions join a named consumer
//! group: every message matching the group's pattern is delivered to exactly
//! one subscriber of that group and must be settled with [`Delivery::ack`] or
//! [`Delivery::nack`]. A delivery that is dropped unsettled is redelivered
//! once the broker's ack-wait expires.

use async_trait::async_trait;

use crate::error::ChannelError;

/// Pub/sub transport with durable, competing-consumer queues.
#[async_trait]
pub trait TaskChannel: Send + Sync {
    /// Publish durably. A message that no consumer group matches yet is
    /// retained until one subscribes.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Publish best-effort. Delivered only to groups attached right now.
    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Join consumer group `group` on `pattern`.
    ///
    /// Subscribing twice with the same pattern and group yields competing
    /// consumers on one queue.
    async fn subscribe(
        &self,
        pattern: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, ChannelError>;

    /// Close the channel. Pending `next` calls return `None`.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One consumer's handle on a consumer group.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. Returns `None` once the channel closes.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self);
    async fn nack(&self);
}

/// A message handed to one consumer.
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        topic: String,
        payload: Vec<u8>,
        delivery_count: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            topic,
            payload,
            delivery_count,
            acker,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Last token of the topic. Topics here are sub-addressed by job id.
    pub fn topic_tail(&self) -> &str {
        self.topic.rsplit('.').next().unwrap_or_default()
    }

    /// Processing succeeded; the broker forgets the message.
    pub async fn ack(self) {
        self.acker.ack().await;
    }

    /// Processing failed; the broker redelivers the message.
    pub async fn nack(self) {
        self.acker.nack().await;
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
