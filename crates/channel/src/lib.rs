//! Message transport for the RUKH analysis planner.
//!
//! - [`TaskChannel`]: the pub/sub seam: durable competing-consumer queues
//!   with explicit ack and nack.
//! - [`InMemoryBroker`]: process-local implementation with ack-wait
//!   redelivery and dead-lettering.
//! - [`connect`]: resolve a broker URL to a shared channel.
//! - [`reconnect`]: exponential-backoff connection helper.

pub mod channel;
pub mod error;
pub mod memory;
pub mod reconnect;
pub mod subject;

use std::sync::Arc;

pub use channel::{Acknowledger, Delivery, Subscription, TaskChannel};
pub use error::ChannelError;
pub use memory::{BrokerConfig, InMemoryBroker};
pub use reconnect::{connect_with_backoff, ReconnectConfig};

/// URL scheme of the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// Open a channel for `url`.
///
/// Only `memory://` is built in; every other scheme is
/// [`ChannelError::Unsupported`].
pub async fn connect(
    url: &str,
    config: BrokerConfig,
) -> Result<Arc<dyn TaskChannel>, ChannelError> {
    if url.starts_with(MEMORY_SCHEME) {
        tracing::info!(url, "Using in-memory broker");
        return Ok(Arc::new(InMemoryBroker::new(config)));
    }
    Err(ChannelError::Unsupported(url.to_string()))
}
