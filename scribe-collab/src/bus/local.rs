//! In-process bus.
//!
//! Stands in for the broker when a single instance runs alone, and lets tests
//! wire several hubs to one shared bus. Cloning yields another handle to the
//! same channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use super::{BusError, BusSink, FanoutBus};
use crate::protocol::{is_document_topic, BusMessage};

/// Default channel depth; a subscriber lagging further behind loses messages.
pub const DEFAULT_CAPACITY: usize = 1024;

/// `tokio::sync::broadcast`-backed bus carrying encoded messages by topic.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<(String, Bytes)>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish raw bytes on an arbitrary topic, bypassing encoding.
    pub fn publish_raw(&self, topic: impl Into<String>, bytes: impl Into<Bytes>) {
        let _ = self.tx.send((topic.into(), bytes.into()));
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn publish(&self, msg: &BusMessage) -> Result<(), BusError> {
        let raw = msg.encode()?;
        // No subscribers is not an error: delivery is at-most-once.
        let _ = self.tx.send((msg.doc_id.topic(), Bytes::from(raw)));
        Ok(())
    }

    async fn subscribe(
        &self,
        sink: Arc<dyn BusSink>,
        shutdown: CancellationToken,
    ) -> Result<(), BusError> {
        let mut rx = self.tx.subscribe();

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Ok((topic, raw)) => {
                    if !is_document_topic(&topic) {
                        continue;
                    }
                    match BusMessage::decode(&raw) {
                        Ok(msg) => sink.deliver(msg),
                        Err(e) => sink.malformed(&topic, e),
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Local bus subscriber lagged, {n} messages lost");
                }
                Err(RecvError::Closed) => return Err(BusError::Closed),
            }
        }
        Ok(())
    }
}
