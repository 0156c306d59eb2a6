//! Debounced snapshot persistence.
//!
//! Turns a high-frequency stream of snapshot payloads into at most one
//! durable write per debounce window, always writing the newest payload
//! available at flush time.
//!
//! ```text
//!            offer(p)                 deadline reached
//!   Idle ───────────────► Pending(p) ─────────────────► Flushing ──► Idle
//!                          │     ▲                         │
//!                          └─────┘ offer(p'): keep p',     │ offer(p'')
//!                                  re-arm deadline         ▼
//!                                                      Pending(p'')
//! ```
//!
//! Cancellation in any state drops the pending payload: persistence is
//! best-effort and a later edit triggers a fresh save.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::protocol::DocumentId;
use crate::stats::HubStats;
use crate::storage::DocumentStore;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Coalescing state for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Pending { payload: Bytes, deadline: Instant },
    Flushing,
}

/// Explicit state machine behind the persistence loop.
#[derive(Debug)]
pub struct SaveDebouncer {
    window: Duration,
    state: SaveState,
}

impl SaveDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: SaveState::Idle,
        }
    }

    pub fn state(&self) -> &SaveState {
        &self.state
    }

    /// Record a new payload, replacing any unflushed one, and re-arm the
    /// deadline to `now + window`.
    pub fn offer(&mut self, payload: Bytes, now: Instant) {
        self.state = SaveState::Pending {
            payload,
            deadline: now + self.window,
        };
    }

    /// When the pending payload is due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            SaveState::Pending { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// Move `Pending → Flushing` once the deadline has passed, handing out
    /// the payload to write. Returns `None` in any other case.
    pub fn begin_flush(&mut self, now: Instant) -> Option<Bytes> {
        match &self.state {
            SaveState::Pending { deadline, .. } if *deadline <= now => {}
            _ => return None,
        }
        match std::mem::replace(&mut self.state, SaveState::Flushing) {
            SaveState::Pending { payload, .. } => Some(payload),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// `Flushing → Idle`. A payload offered during the flush stays pending.
    pub fn finish_flush(&mut self) {
        if self.state == SaveState::Flushing {
            self.state = SaveState::Idle;
        }
    }

    /// Drop whatever is pending.
    pub fn cancel(&mut self) -> Option<Bytes> {
        match std::mem::replace(&mut self.state, SaveState::Idle) {
            SaveState::Pending { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Drive a [`SaveDebouncer`] from a connection's save queue.
///
/// Runs until `cancel` fires or the queue's sender side is gone. A failed
/// write is logged and counted; the payload is not retried.
pub async fn run_persistence_loop(
    doc_id: DocumentId,
    mut saves: mpsc::Receiver<Bytes>,
    store: Arc<dyn DocumentStore>,
    window: Duration,
    stats: Arc<HubStats>,
    cancel: CancellationToken,
) {
    let mut debouncer = SaveDebouncer::new(window);

    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = saves.recv() => match payload {
                Some(payload) => debouncer.offer(payload, Instant::now()),
                None => break,
            },
            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some(payload) = debouncer.begin_flush(Instant::now()) {
                    match store.save_document(&doc_id, &payload).await {
                        Ok(()) => {
                            stats.snapshot_written();
                            log::debug!("Persisted snapshot for doc {doc_id} ({} bytes)", payload.len());
                        }
                        Err(e) => {
                            stats.snapshot_write_failed();
                            log::error!("Failed to persist snapshot for doc {doc_id}: {e}");
                        }
                    }
                    debouncer.finish_flush();
                }
            }
        }
    }

    if let Some(lost) = debouncer.cancel() {
        log::debug!("Dropped unflushed snapshot for doc {doc_id} ({} bytes) on close", lost.len());
    }
}
