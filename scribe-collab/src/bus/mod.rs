//! Cross-process fan-out bus.
//!
//! ```text
//!  instance A                    broker                     instance B
//! ┌─────────┐  publish(doc:x)  ┌────────┐  psubscribe(doc:*) ┌─────────┐
//! │   Hub   │ ───────────────► │        │ ─────────────────► │   Hub   │
//! │         │ ◄─────────────── │        │ ◄───────────────── │         │
//! └─────────┘                  └────────┘                    └─────────┘
//! ```
//!
//! Delivery is fire-and-forget and at-most-once. There is no deduplication
//! and no ordering across documents; within one document topic, order is
//! whatever the broker delivers.

pub mod local;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::protocol::{BusMessage, ProtocolError};

pub use self::local::LocalBus;
pub use self::redis::RedisBus;

/// Bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Broker error: {0}")]
    Broker(#[from] ::redis::RedisError),
    #[error("Encoding error: {0}")]
    Encode(#[from] ProtocolError),
    #[error("Subscription closed by broker")]
    Closed,
}

/// Receiver of bus deliveries.
pub trait BusSink: Send + Sync + 'static {
    /// A well-formed message arrived for some document.
    fn deliver(&self, msg: BusMessage);

    /// A message arrived that could not be decoded (or had no document id).
    /// It is dropped either way.
    fn malformed(&self, _topic: &str, _err: ProtocolError) {}
}

/// Topic-based publish/subscribe keyed by document id.
#[async_trait]
pub trait FanoutBus: Send + Sync + 'static {
    /// Publish to the message's document topic. Does not wait for any
    /// subscriber to receive it.
    async fn publish(&self, msg: &BusMessage) -> Result<(), BusError>;

    /// Subscribe to every document topic and feed deliveries to `sink` until
    /// `shutdown` fires, then release the subscription.
    async fn subscribe(
        &self,
        sink: Arc<dyn BusSink>,
        shutdown: CancellationToken,
    ) -> Result<(), BusError>;
}
