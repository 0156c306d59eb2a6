//! Hub: the document → room registry and the bridge to the fan-out bus.
//!
//! ```text
//!             on_connect(doc, ws)
//!                    │
//!                    ▼
//!  ┌──────── Hub ───────────────────────────────────────────┐
//!  │ rooms: doc_id → Room          instance_id              │
//!  │                                                        │
//!  │ read loop ── frame ──┬─► queue_save (tag 3 only)       │
//!  │                      ├─► Room::broadcast_from (local)  │
//!  │                      └─► publish queue ─► publisher ─► FanoutBus
//!  │                                                        │
//!  │                                                        │
//!  │ bus ── deliver(msg) ───► Room::broadcast (if present)  │
//!  └────────────────────────────────────────────────────────┘
//! ```
//!
//! The read loop never awaits the broker. Each connection hands its bus
//! messages to a bounded queue drained by its own publisher task; a full
//! queue drops the newest message and every publish is bounded by
//! `publish_timeout`.
//!
//! Lock order is always hub registry first, then a room's membership lock.
//! Joins and evictions both take the registry's exclusive lock, so an idle
//! sweep can never remove a room a concurrent join is entering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{BusSink, FanoutBus};
use crate::connection::{Connection, ConnectionHandle, ConnectionLimits};
use crate::persistence::{run_persistence_loop, DEFAULT_DEBOUNCE};
use crate::protocol::{BusMessage, DocumentId, Frame, ProtocolError};
use crate::room::Room;
use crate::stats::HubStats;
use crate::storage::DocumentStore;

/// Minimum period of the idle-room sweep.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// First delay before resubscribing after the bus subscription ends.
pub const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(500);
/// Cap on the resubscribe delay. A subscription that lived at least this
/// long resets the backoff.
pub const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Per-hub tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Queue sizes and keepalive for every connection. The outbound
    /// capacity also bounds each connection's publish queue.
    pub limits: ConnectionLimits,
    /// Snapshot coalescing window
    pub save_debounce: Duration,
    /// How long a room may stay empty before it is evicted (None = never)
    pub room_idle_grace: Option<Duration>,
    /// Upper bound on a single bus publish
    pub publish_timeout: Duration,
    /// Period of the stats log line (None = off)
    pub stats_interval: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            limits: ConnectionLimits::default(),
            save_debounce: DEFAULT_DEBOUNCE,
            room_idle_grace: Some(Duration::from_secs(60)),
            publish_timeout: Duration::from_secs(5),
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

pub struct Hub {
    instance_id: String,
    rooms: RwLock<HashMap<DocumentId, Arc<Room>>>,
    bus: Arc<dyn FanoutBus>,
    store: Arc<dyn DocumentStore>,
    config: HubConfig,
    stats: Arc<HubStats>,
}

impl Hub {
    pub fn new(bus: Arc<dyn FanoutBus>, store: Arc<dyn DocumentStore>, config: HubConfig) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            rooms: RwLock::new(HashMap::new()),
            bus,
            store,
            config,
            stats: Arc::new(HubStats::new()),
        }
    }

    /// Id stamped on every bus message this hub publishes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<HubStats> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    // ─── Registry ───────────────────────────────────────────────

    /// The room for `doc_id`, created and registered on first reference.
    /// Concurrent first references all observe the same instance.
    pub fn get_or_create_room(&self, doc_id: &DocumentId) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(doc_id) {
            return room.clone();
        }
        let mut rooms = self.rooms.write();
        Self::entry(&mut rooms, doc_id, &self.stats)
    }

    fn entry(
        rooms: &mut HashMap<DocumentId, Arc<Room>>,
        doc_id: &DocumentId,
        stats: &Arc<HubStats>,
    ) -> Arc<Room> {
        rooms
            .entry(doc_id.clone())
            .or_insert_with(|| {
                stats.room_created();
                log::debug!("Created room for doc {doc_id}");
                Arc::new(Room::new(doc_id.clone(), stats.clone()))
            })
            .clone()
    }

    /// The live room for `doc_id`, if any.
    pub fn room(&self, doc_id: &DocumentId) -> Option<Arc<Room>> {
        self.rooms.read().get(doc_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Join a connection to its document's room under the registry lock.
    pub fn attach(&self, conn: Arc<ConnectionHandle>) -> Arc<Room> {
        let mut rooms = self.rooms.write();
        let room = Self::entry(&mut rooms, conn.doc_id(), &self.stats);
        room.join(conn);
        room
    }

    /// Evict rooms that have been empty for at least `grace`. Returns how
    /// many were removed.
    pub fn sweep_idle_rooms(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut rooms = self.rooms.write();
        let before = rooms.len();
        rooms.retain(|doc_id, room| match room.idle_for(now) {
            Some(idle) if idle >= grace => {
                log::debug!("Evicting idle room for doc {doc_id}");
                false
            }
            _ => true,
        });
        let evicted = before - rooms.len();
        if evicted > 0 {
            self.stats.rooms_evicted(evicted as u64);
            log::info!("Evicted {evicted} idle rooms ({} remain)", rooms.len());
        }
        evicted
    }

    // ─── Connections ────────────────────────────────────────────

    /// Serve one upgraded socket for `doc_id` until it closes.
    ///
    /// Joins the room, starts the write, persistence and publisher loops as
    /// their own tasks, then drives the read loop inline. On exit the
    /// connection has left the room before its socket is closed.
    pub async fn on_connect<S>(
        &self,
        doc_id: DocumentId,
        ws: WebSocketStream<S>,
        shutdown: &CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = shutdown.child_token();
        let mut conn = Connection::new(
            ws,
            doc_id.clone(),
            self.config.limits,
            self.stats.clone(),
            cancel.clone(),
        );
        let handle = conn.handle().clone();
        let room = self.attach(handle.clone());
        self.stats.connection_opened();
        log::info!("Connection {} joined doc {doc_id} ({} members)", handle.id(), room.len());

        conn.spawn_write_loop(self.config.limits.keepalive);
        let persistence = conn.take_saves().map(|saves| {
            tokio::spawn(run_persistence_loop(
                doc_id.clone(),
                saves,
                self.store.clone(),
                self.config.save_debounce,
                self.stats.clone(),
                cancel.clone(),
            ))
        });

        // Detached: drains what this connection queued after it is gone,
        // and stops at process shutdown.
        let (publish_tx, publish_rx) = mpsc::channel(self.config.limits.outbound_capacity.max(1));
        tokio::spawn(run_publisher(
            self.bus.clone(),
            publish_rx,
            self.config.publish_timeout,
            self.stats.clone(),
            shutdown.clone(),
        ));

        while let Some(frame) = conn.read().await {
            self.handle_frame(&room, &handle, &publish_tx, frame);
        }
        drop(publish_tx);

        room.leave(handle.id());
        conn.close().await;
        if let Some(task) = persistence {
            if let Err(e) = task.await {
                log::warn!("Persistence loop for {} ended abnormally: {e}", handle.id());
            }
        }
        self.stats.connection_closed();
        log::info!("Connection {} left doc {doc_id}", handle.id());
    }

    fn handle_frame(
        &self,
        room: &Room,
        sender: &ConnectionHandle,
        publish: &mpsc::Sender<BusMessage>,
        frame: Frame,
    ) {
        self.stats.frame_received();

        if let Some(payload) = frame.snapshot_payload() {
            sender.queue_save(payload);
        }

        room.broadcast_from(sender.id(), &frame);

        let msg = BusMessage::with_origin(room.doc_id().clone(), self.instance_id.as_str(), &frame);
        match publish.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.bus_publish_dropped();
                log::debug!("Publish queue full for {} on doc {}, frame not published", sender.id(), room.doc_id());
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    // ─── Bus bridge ─────────────────────────────────────────────

    /// Route a bus message into the local room for its document. No-op when
    /// the document has no local room or the message is this hub's own.
    pub fn deliver(&self, msg: BusMessage) {
        if msg.is_from(&self.instance_id) {
            return;
        }
        let Some(room) = self.room(&msg.doc_id) else {
            return;
        };
        self.stats.bus_delivered();
        room.broadcast(&msg.into_frame());
    }

    /// Consume bus deliveries until `shutdown` fires.
    ///
    /// A subscription that ends early (broker connection lost) is retried
    /// with exponential backoff. The idle-room sweep and the stats log line
    /// keep running meanwhile.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut sweep = self
            .config
            .room_idle_grace
            .map(|grace| periodic((grace / 2).max(MIN_SWEEP_PERIOD)));
        let mut report = self.config.stats_interval.map(periodic);
        let mut backoff = RESUBSCRIBE_BACKOFF_MIN;

        log::info!("Hub {} running", self.instance_id);
        loop {
            let started = Instant::now();
            let sink: Arc<dyn BusSink> = self.clone();
            let subscription = self.bus.subscribe(sink, shutdown.clone());
            tokio::pin!(subscription);

            let result = loop {
                tokio::select! {
                    result = &mut subscription => break result,
                    _ = next_tick(&mut sweep) => self.sweep_tick(),
                    _ = next_tick(&mut report) => self.log_stats(),
                }
            };
            if shutdown.is_cancelled() {
                break;
            }

            if started.elapsed() >= RESUBSCRIBE_BACKOFF_MAX {
                backoff = RESUBSCRIBE_BACKOFF_MIN;
            }
            self.stats.bus_resubscribed();
            match result {
                Ok(()) => log::warn!("Bus subscription ended, resubscribing in {backoff:?}"),
                Err(e) => log::error!("Bus subscription failed: {e}, resubscribing in {backoff:?}"),
            }

            let wait = tokio::time::sleep(backoff);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = &mut wait => break,
                    _ = next_tick(&mut sweep) => self.sweep_tick(),
                    _ = next_tick(&mut report) => self.log_stats(),
                }
            }
            if shutdown.is_cancelled() {
                break;
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
        }
        log::info!("Hub {} stopped", self.instance_id);
    }

    fn sweep_tick(&self) {
        if let Some(grace) = self.config.room_idle_grace {
            self.sweep_idle_rooms(grace);
        }
    }

    /// Emit the current counters as one info line.
    pub fn log_stats(&self) {
        log::info!("Hub {} stats: {} rooms, {}", self.instance_id, self.room_count(), self.stats.snapshot());
    }
}

/// Ticker whose first tick is one `period` from now.
fn periodic(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Publish one connection's bus messages in order, each bounded by
/// `timeout`. Failures and timeouts are counted and logged, never retried.
async fn run_publisher(
    bus: Arc<dyn FanoutBus>,
    mut queue: mpsc::Receiver<BusMessage>,
    timeout: Duration,
    stats: Arc<HubStats>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = tokio::time::timeout(timeout, bus.publish(&msg)) => result,
        };
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.bus_publish_failed();
                log::warn!("Bus publish failed for doc {}: {e}", msg.doc_id);
            }
            Err(_) => {
                stats.bus_publish_failed();
                log::warn!("Bus publish for doc {} timed out after {timeout:?}", msg.doc_id);
            }
        }
    }
}

impl BusSink for Hub {
    fn deliver(&self, msg: BusMessage) {
        Hub::deliver(self, msg);
    }

    fn malformed(&self, topic: &str, err: ProtocolError) {
        self.stats.bus_malformed();
        log::debug!("Dropped malformed bus message on {topic}: {err}");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("instance_id", &self.instance_id)
            .field("rooms", &self.room_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, LocalBus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;

    /// A bus whose publish never completes.
    struct StalledBus;

    #[async_trait]
    impl FanoutBus for StalledBus {
        async fn publish(&self, _msg: &BusMessage) -> Result<(), BusError> {
            std::future::pending().await
        }

        async fn subscribe(
            &self,
            _sink: Arc<dyn BusSink>,
            shutdown: CancellationToken,
        ) -> Result<(), BusError> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    /// A bus whose first subscription fails straight away.
    #[derive(Default)]
    struct FlakyBus {
        subscribes: AtomicUsize,
    }

    #[async_trait]
    impl FanoutBus for FlakyBus {
        async fn publish(&self, _msg: &BusMessage) -> Result<(), BusError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _sink: Arc<dyn BusSink>,
            shutdown: CancellationToken,
        ) -> Result<(), BusError> {
            if self.subscribes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(BusError::Closed);
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn hub_with(bus: Arc<dyn FanoutBus>) -> (Arc<Hub>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(bus, store.clone(), HubConfig::default()));
        (hub, store)
    }

    type ClientWs = WebSocketStream<DuplexStream>;

    /// Connect a client to `hub` for `doc`, returning the client socket and
    /// the task running the server side.
    async fn connect(
        hub: &Arc<Hub>,
        doc: &str,
        shutdown: &CancellationToken,
    ) -> (ClientWs, tokio::task::JoinHandle<()>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let before = hub.room(&DocumentId::from(doc)).map_or(0, |r| r.len());

        let task = {
            let hub = hub.clone();
            let shutdown = shutdown.clone();
            let doc = DocumentId::from(doc);
            tokio::spawn(async move { hub.on_connect(doc, server, &shutdown).await })
        };
        while hub.room(&DocumentId::from(doc)).map_or(0, |r| r.len()) <= before {
            tokio::task::yield_now().await;
        }
        (client, task)
    }

    async fn next_binary(client: &mut ClientWs) -> Vec<u8> {
        loop {
            match client.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(_)) => continue,
                other => panic!("expected binary frame, got {other:?}"),
            }
        }
    }

    async fn nothing_arrives(client: &mut ClientWs) -> bool {
        tokio::time::timeout(Duration::from_millis(100), client.next())
            .await
            .is_err()
    }

    #[test]
    fn test_concurrent_first_access_creates_one_room() {
        let (hub, _) = hub_with(Arc::new(LocalBus::default()));
        let doc = DocumentId::from("doc1");

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let hub = hub.clone();
                let doc = doc.clone();
                std::thread::spawn(move || hub.get_or_create_room(&doc))
            })
            .collect();
        let rooms: Vec<Arc<Room>> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert!(rooms.iter().all(|r| Arc::ptr_eq(r, &rooms[0])));
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.stats().snapshot().rooms_created, 1);
    }

    #[tokio::test]
    async fn test_frame_reaches_peer_not_sender() {
        let (hub, store) = hub_with(Arc::new(LocalBus::default()));
        let shutdown = CancellationToken::new();
        let (mut a, _ta) = connect(&hub, "doc1", &shutdown).await;
        let (mut b, _tb) = connect(&hub, "doc1", &shutdown).await;

        a.send(Message::Binary(Bytes::from_static(&[1, 0xFF]))).await.unwrap();

        assert_eq!(next_binary(&mut b).await, vec![1, 0xFF]);
        assert!(nothing_arrives(&mut a).await);
        assert!(store.writes().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_local_delivery_does_not_wait_for_bus() {
        let (hub, _) = hub_with(Arc::new(StalledBus));
        let shutdown = CancellationToken::new();
        let (mut a, _ta) = connect(&hub, "doc1", &shutdown).await;
        let (mut b, _tb) = connect(&hub, "doc1", &shutdown).await;

        a.send(Message::Binary(Bytes::from_static(&[1, 0x01]))).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), next_binary(&mut b)).await;
        assert_eq!(got.unwrap(), vec![1, 0x01]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stalled_bus_does_not_block_later_frames_or_saves() {
        let (hub, store) = hub_with(Arc::new(StalledBus));
        let shutdown = CancellationToken::new();
        let (mut a, _ta) = connect(&hub, "doc1", &shutdown).await;
        let (mut b, _tb) = connect(&hub, "doc1", &shutdown).await;

        a.send(Message::Binary(Bytes::from_static(&[1, 0x01]))).await.unwrap();
        a.send(Message::Binary(Bytes::from_static(&[3, 0x41, 0x42]))).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), next_binary(&mut b)).await;
        assert_eq!(first.unwrap(), vec![1, 0x01]);
        let second = tokio::time::timeout(Duration::from_secs(1), next_binary(&mut b)).await;
        assert_eq!(second.unwrap(), vec![3, 0x41, 0x42]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.writes_for(&DocumentId::from("doc1")), vec![b"AB".to_vec()]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_publish_timeout_is_counted() {
        let store = Arc::new(MemoryStore::new());
        let config = HubConfig {
            publish_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        };
        let hub = Arc::new(Hub::new(Arc::new(StalledBus), store, config));
        let shutdown = CancellationToken::new();
        let (mut a, _ta) = connect(&hub, "doc1", &shutdown).await;

        a.send(Message::Binary(Bytes::from_static(&[1, 0x01]))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let snap = hub.stats().snapshot();
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bus_publish_failures, 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_full_publish_queue_drops_newest() {
        let store = Arc::new(MemoryStore::new());
        let config = HubConfig {
            limits: ConnectionLimits {
                outbound_capacity: 1,
                ..ConnectionLimits::default()
            },
            ..HubConfig::default()
        };
        let hub = Arc::new(Hub::new(Arc::new(StalledBus), store, config));
        let shutdown = CancellationToken::new();
        let (mut a, _ta) = connect(&hub, "doc1", &shutdown).await;

        // The first message parks the publisher inside the stalled publish.
        a.send(Message::Binary(Bytes::from_static(&[1, 0]))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 1..5u8 {
            a.send(Message::Binary(Bytes::from(vec![1, i]))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // One more fits in the queue; the rest are dropped.
        let snap = hub.stats().snapshot();
        assert_eq!(snap.frames_received, 5);
        assert_eq!(snap.bus_publish_dropped, 3);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let (hub, _) = hub_with(Arc::new(LocalBus::default()));
        let shutdown = CancellationToken::new();
        let (mut a, _ta) = connect(&hub, "docA", &shutdown).await;
        let (mut a2, _ta2) = connect(&hub, "docA", &shutdown).await;
        let (mut b, _tb) = connect(&hub, "docB", &shutdown).await;

        a.send(Message::Binary(Bytes::from_static(&[1, 0xAA]))).await.unwrap();

        assert_eq!(next_binary(&mut a2).await, vec![1, 0xAA]);
        assert!(nothing_arrives(&mut b).await);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_snapshot_frame_is_persisted_once() {
        let (hub, store) = hub_with(Arc::new(LocalBus::default()));
        let shutdown = CancellationToken::new();
        let (mut a, _ta) = connect(&hub, "doc1", &shutdown).await;

        a.send(Message::Binary(Bytes::from_static(&[3, 0x41, 0x42]))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(store.writes_for(&DocumentId::from("doc1")), vec![b"AB".to_vec()]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_leaves_room_before_close() {
        let (hub, _) = hub_with(Arc::new(LocalBus::default()));
        let shutdown = CancellationToken::new();
        let (mut a, ta) = connect(&hub, "doc1", &shutdown).await;
        let room = hub.room(&DocumentId::from("doc1")).unwrap();
        assert_eq!(room.len(), 1);

        a.close(None).await.unwrap();
        ta.await.unwrap();

        assert!(room.is_empty());
        let snap = hub.stats().snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (hub, _) = hub_with(Arc::new(LocalBus::default()));
        let shutdown = CancellationToken::new();
        let (mut a, ta) = connect(&hub, "doc1", &shutdown).await;

        shutdown.cancel();
        ta.await.unwrap();

        loop {
            match a.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), 1000);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_cross_instance_delivery_via_shared_bus() {
        let bus = LocalBus::default();
        let (hub1, _) = hub_with(Arc::new(bus.clone()));
        let (hub2, _) = hub_with(Arc::new(bus.clone()));
        let shutdown = CancellationToken::new();
        tokio::spawn(hub1.clone().run(shutdown.clone()));
        tokio::spawn(hub2.clone().run(shutdown.clone()));
        while bus.subscriber_count() < 2 {
            tokio::task::yield_now().await;
        }

        let (mut a, _ta) = connect(&hub1, "doc1", &shutdown).await;
        let (mut b, _tb) = connect(&hub2, "doc1", &shutdown).await;

        a.send(Message::Binary(Bytes::from_static(&[1, 0x10]))).await.unwrap();

        assert_eq!(next_binary(&mut b).await, vec![1, 0x10]);
        // hub1 ignores its own echo, so the sender sees nothing.
        assert!(nothing_arrives(&mut a).await);
        assert_eq!(hub2.stats().snapshot().bus_delivered, 1);
        assert_eq!(hub1.stats().snapshot().bus_delivered, 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_deliver_without_local_room_is_noop() {
        let (hub, _) = hub_with(Arc::new(LocalBus::default()));
        hub.deliver(BusMessage::new(DocumentId::from("ghost"), &Frame::from(vec![1])));
        assert_eq!(hub.room_count(), 0);
        assert_eq!(hub.stats().snapshot().bus_delivered, 0);
    }

    #[tokio::test]
    async fn test_malformed_bus_message_is_counted() {
        let bus = LocalBus::default();
        let (hub, _) = hub_with(Arc::new(bus.clone()));
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(hub.clone().run(shutdown.clone()));
        while bus.subscriber_count() < 1 {
            tokio::task::yield_now().await;
        }

        bus.publish_raw("doc:x", vec![0xFF]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hub.stats().snapshot().bus_malformed, 1);
        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_idle_rooms() {
        let (hub, _) = hub_with(Arc::new(LocalBus::default()));
        let limits = ConnectionLimits::default();
        let (busy, _q) = ConnectionHandle::new(DocumentId::from("busy"), limits, hub.stats().clone());
        hub.attach(busy);
        hub.get_or_create_room(&DocumentId::from("idle"));

        assert_eq!(hub.sweep_idle_rooms(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(hub.sweep_idle_rooms(Duration::from_secs(60)), 1);

        assert!(hub.room(&DocumentId::from("busy")).is_some());
        assert!(hub.room(&DocumentId::from("idle")).is_none());
        assert_eq!(hub.stats().snapshot().rooms_evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_periodically() {
        let bus = Arc::new(LocalBus::default());
        let store = Arc::new(MemoryStore::new());
        let config = HubConfig {
            room_idle_grace: Some(Duration::from_secs(2)),
            ..HubConfig::default()
        };
        let hub = Arc::new(Hub::new(bus, store, config));
        hub.get_or_create_room(&DocumentId::from("doc1"));

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(hub.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(hub.room_count(), 0);
        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_resubscribes_after_bus_failure() {
        let bus = Arc::new(FlakyBus::default());
        let (hub, _) = hub_with(bus.clone());
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(hub.clone().run(shutdown.clone()));

        tokio::time::sleep(RESUBSCRIBE_BACKOFF_MIN * 2).await;

        assert_eq!(bus.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(hub.stats().snapshot().bus_resubscribes, 1);
        assert!(!run.is_finished());

        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_during_backoff_on_shutdown() {
        let bus = Arc::new(FlakyBus::default());
        let (hub, _) = hub_with(bus.clone());
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(hub.clone().run(shutdown.clone()));

        tokio::time::sleep(RESUBSCRIBE_BACKOFF_MIN / 2).await;
        shutdown.cancel();
        run.await.unwrap();

        assert_eq!(bus.subscribes.load(Ordering::SeqCst), 1);
    }
}
