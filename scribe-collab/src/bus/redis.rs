//! Redis pub/sub bus.
//!
//! Publishes on `doc:<id>` through a multiplexed connection and receives
//! every document topic through one pattern subscription (`PSUBSCRIBE doc:*`)
//! on a dedicated pub/sub connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use super::{BusError, BusSink, FanoutBus};
use crate::protocol::{BusMessage, ProtocolError, TOPIC_PATTERN};

pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    /// Connect and verify the broker answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let mut publisher = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut publisher).await?;
        log::info!("Connected to redis bus at {url}");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn publish(&self, msg: &BusMessage) -> Result<(), BusError> {
        let raw = msg.encode()?;
        let mut conn = self.publisher.clone();
        let _: () = conn.publish(msg.doc_id.topic(), raw).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        sink: Arc<dyn BusSink>,
        shutdown: CancellationToken,
    ) -> Result<(), BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(TOPIC_PATTERN).await?;
        log::info!("Subscribed to {TOPIC_PATTERN}");

        let closed = {
            let mut messages = pubsub.on_message();
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break false,
                    next = messages.next() => next,
                };
                let Some(msg) = next else {
                    break true;
                };
                let topic = msg.get_channel_name().to_string();
                let decoded = msg
                    .get_payload::<Vec<u8>>()
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))
                    .and_then(|raw| BusMessage::decode(&raw));
                match decoded {
                    Ok(msg) => sink.deliver(msg),
                    Err(e) => sink.malformed(&topic, e),
                }
            }
        };

        if closed {
            return Err(BusError::Closed);
        }
        if let Err(e) = pubsub.punsubscribe(TOPIC_PATTERN).await {
            log::debug!("PUNSUBSCRIBE failed during shutdown: {e}");
        }
        Ok(())
    }
}
