//! One client socket and its two bounded queues.
//!
//! ```text
//!                 ┌──────────────────── Connection ─────────────────────┐
//!   socket ──────►│ read()  ──► Frame                                   │
//!                 │                                                     │
//!   Room ────────►│ ConnectionHandle::enqueue_outbound ─► outbound (256)│──► write loop ──► socket
//!   Hub  ────────►│ ConnectionHandle::queue_save       ─► saves    (64) │──► persistence loop
//!                 └─────────────────────────────────────────────────────┘
//! ```
//!
//! Producers never block: both queues drop the *newest* item when full.
//! A slow client observes gaps instead of growing latency, and a slow
//! member never stalls the broadcaster.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{DocumentId, Frame};
use crate::stats::HubStats;

/// Queue sizes and keepalive period for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Outbound (to client) queue capacity
    pub outbound_capacity: usize,
    /// Pending-save queue capacity
    pub save_capacity: usize,
    /// Idle period between keepalive pings
    pub keepalive: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            save_capacity: 64,
            keepalive: Duration::from_secs(20),
        }
    }
}

/// The shareable half of a connection: what rooms and the hub hold on to.
///
/// Identity is the `id`; two handles are the same member only if their ids
/// match.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    doc_id: DocumentId,
    outbound: mpsc::Sender<Frame>,
    saves: mpsc::Sender<Bytes>,
    stats: Arc<HubStats>,
}

/// Receiving ends of a handle's queues.
#[derive(Debug)]
pub struct ConnectionQueues {
    pub outbound: mpsc::Receiver<Frame>,
    pub saves: mpsc::Receiver<Bytes>,
}

impl ConnectionHandle {
    /// Create a handle and the receivers for its queues.
    pub fn new(
        doc_id: DocumentId,
        limits: ConnectionLimits,
        stats: Arc<HubStats>,
    ) -> (Arc<Self>, ConnectionQueues) {
        let (out_tx, out_rx) = mpsc::channel(limits.outbound_capacity.max(1));
        let (save_tx, save_rx) = mpsc::channel(limits.save_capacity.max(1));
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            doc_id,
            outbound: out_tx,
            saves: save_tx,
            stats,
        });
        let queues = ConnectionQueues {
            outbound: out_rx,
            saves: save_rx,
        };
        (handle, queues)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Push a frame towards the client without blocking.
    ///
    /// Returns `false` if the frame was dropped (queue full or writer gone).
    pub fn enqueue_outbound(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.outbound_dropped();
                log::trace!("Outbound queue full for {} on doc {}, frame dropped", self.id, self.doc_id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Push a snapshot payload towards the persistence loop without blocking.
    pub fn queue_save(&self, payload: Bytes) -> bool {
        match self.saves.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.save_dropped();
                log::debug!("Save queue full for {} on doc {}, payload dropped", self.id, self.doc_id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// A live client socket.
///
/// The read side is driven by the caller through [`Connection::read`]; the
/// write side runs as its own task once [`Connection::spawn_write_loop`] is
/// called. Cancelling the connection's token (directly, through
/// [`Connection::close`], or through process shutdown) ends the write loop,
/// which sends a normal-closure close frame on its way out when the peer is
/// still accepting data.
pub struct Connection<S> {
    handle: Arc<ConnectionHandle>,
    stream: SplitStream<WebSocketStream<S>>,
    sink: Option<WsSink<S>>,
    outbound_rx: Option<mpsc::Receiver<Frame>>,
    saves_rx: Option<mpsc::Receiver<Bytes>>,
    writer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        ws: WebSocketStream<S>,
        doc_id: DocumentId,
        limits: ConnectionLimits,
        stats: Arc<HubStats>,
        cancel: CancellationToken,
    ) -> Self {
        let (sink, stream) = ws.split();
        let (handle, queues) = ConnectionHandle::new(doc_id, limits, stats);
        Self {
            handle,
            stream,
            sink: Some(sink),
            outbound_rx: Some(queues.outbound),
            saves_rx: Some(queues.saves),
            writer: None,
            cancel,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Take the receiving end of the pending-save queue (once).
    pub fn take_saves(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.saves_rx.take()
    }

    /// Start the outbound write loop as an independent task. No-op if
    /// already started.
    pub fn spawn_write_loop(&mut self, keepalive: Duration) {
        if let (Some(sink), Some(rx)) = (self.sink.take(), self.outbound_rx.take()) {
            let cancel = self.cancel.clone();
            self.writer = Some(tokio::spawn(write_loop(sink, rx, keepalive, cancel)));
        }
    }

    /// Wait for the next text or binary frame.
    ///
    /// Control frames are skipped. Returns `None` once the peer closes, the
    /// transport fails, or the connection is cancelled.
    pub async fn read(&mut self) -> Option<Frame> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = self.stream.next() => next,
            };
            match next {
                Some(Ok(Message::Binary(data))) => return Some(Frame::from(data)),
                Some(Ok(Message::Text(text))) => {
                    return Some(Frame::from(Bytes::copy_from_slice(text.as_str().as_bytes())))
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::debug!("Read error on {} (doc {}): {e}", self.handle.id, self.handle.doc_id);
                    return None;
                }
            }
        }
    }

    /// Close the socket with a normal-closure code. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                log::warn!("Write loop for {} ended abnormally: {e}", self.handle.id);
            }
        } else if let Some(mut sink) = self.sink.take() {
            send_close(&mut sink).await;
        }
    }
}

/// Upper bound on the closing handshake. A peer that has stopped reading
/// cannot hold the connection open past it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

fn close_message() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static("bye"),
    }))
}

async fn send_close<S>(sink: &mut WsSink<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = async {
        let _ = sink.send(close_message()).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, handshake).await.is_err() {
        log::trace!("Close handshake timed out");
    }
}

/// Drain the outbound queue to the socket, pinging on an idle timer.
///
/// Send failures are swallowed: delivery is best-effort and the loop keeps
/// going until cancelled (or every sender is gone). Cancellation also
/// interrupts a send that is blocked on the peer; in that case the socket is
/// dropped without a close frame.
pub async fn write_loop<S>(
    mut sink: WsSink<S>,
    mut rx: mpsc::Receiver<Frame>,
    keepalive: Duration,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => Message::Binary(frame.into_bytes()),
                None => break,
            },
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                log::trace!("Write loop cancelled during a blocked send");
                return;
            }
            result = sink.send(msg) => {
                if let Err(e) = result {
                    log::trace!("Outbound send failed: {e}");
                }
            }
        }
    }

    send_close(&mut sink).await;
}
