//! Room: the live set of connections viewing one document.
//!
//! Membership is mutated under the room's exclusive lock; fan-out takes the
//! shared lock, so concurrent broadcasts proceed in parallel and only
//! serialize against join/leave. Fan-out calls each member's non-blocking
//! enqueue, so no socket I/O ever happens while the lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::protocol::{DocumentId, Frame};
use crate::stats::HubStats;

struct Members {
    conns: HashMap<Uuid, Arc<ConnectionHandle>>,
    /// When the room last became empty (`None` while occupied).
    emptied_at: Option<Instant>,
}

/// Thread-safe membership and fan-out for one document.
pub struct Room {
    doc_id: DocumentId,
    members: RwLock<Members>,
    stats: Arc<HubStats>,
}

impl Room {
    pub fn new(doc_id: DocumentId, stats: Arc<HubStats>) -> Self {
        Self {
            doc_id,
            members: RwLock::new(Members {
                conns: HashMap::new(),
                emptied_at: Some(Instant::now()),
            }),
            stats,
        }
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Add a connection. Returns `false` if it was already a member.
    pub fn join(&self, conn: Arc<ConnectionHandle>) -> bool {
        let mut members = self.members.write();
        members.emptied_at = None;
        members.conns.insert(conn.id(), conn).is_none()
    }

    /// Remove a connection. Returns `false` if it was not a member.
    pub fn leave(&self, conn_id: Uuid) -> bool {
        let mut members = self.members.write();
        let removed = members.conns.remove(&conn_id).is_some();
        if removed && members.conns.is_empty() {
            members.emptied_at = Some(Instant::now());
        }
        removed
    }

    /// Enqueue a frame for every member. Never blocks on a slow member.
    ///
    /// Returns the number of members the frame was queued for.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.fan_out(frame, None)
    }

    /// Enqueue a frame for every member except `sender`.
    pub fn broadcast_from(&self, sender: Uuid, frame: &Frame) -> usize {
        self.fan_out(frame, Some(sender))
    }

    fn fan_out(&self, frame: &Frame, skip: Option<Uuid>) -> usize {
        let members = self.members.read();
        let mut delivered = 0;
        for (id, conn) in members.conns.iter() {
            if Some(*id) == skip {
                continue;
            }
            if conn.enqueue_outbound(frame.clone()) {
                delivered += 1;
            }
        }
        if delivered > 0 {
            self.stats.frame_broadcast();
        }
        delivered
    }

    pub fn contains(&self, conn_id: Uuid) -> bool {
        self.members.read().conns.contains_key(&conn_id)
    }

    pub fn len(&self) -> usize {
        self.members.read().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().conns.is_empty()
    }

    /// Member ids (unordered).
    pub fn member_ids(&self) -> Vec<Uuid> {
        self.members.read().conns.keys().copied().collect()
    }

    /// How long the room has been empty, or `None` while occupied.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        let members = self.members.read();
        if !members.conns.is_empty() {
            return None;
        }
        members
            .emptied_at
            .map(|at| now.saturating_duration_since(at))
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("doc_id", &self.doc_id)
            .field("members", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionLimits, ConnectionQueues};

    fn member(room: &Room, capacity: usize) -> (Arc<ConnectionHandle>, ConnectionQueues) {
        let limits = ConnectionLimits {
            outbound_capacity: capacity,
            ..ConnectionLimits::default()
        };
        ConnectionHandle::new(room.doc_id().clone(), limits, room.stats.clone())
    }

    fn room(id: &str) -> Room {
        Room::new(DocumentId::from(id), Arc::new(HubStats::new()))
    }

    #[test]
    fn test_join_leave() {
        let room = room("doc1");
        let (a, _qa) = member(&room, 16);

        assert!(room.join(a.clone()));
        assert!(!room.join(a.clone()));
        assert_eq!(room.len(), 1);
        assert!(room.contains(a.id()));

        assert!(room.leave(a.id()));
        assert!(!room.leave(a.id()));
        assert!(room.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let room = room("doc1");
        let (a, mut qa) = member(&room, 16);
        let (b, mut qb) = member(&room, 16);
        room.join(a);
        room.join(b);

        assert_eq!(room.broadcast(&Frame::from(vec![1, 0xFF])), 2);
        assert_eq!(qa.outbound.recv().await.unwrap().as_bytes(), &[1, 0xFF]);
        assert_eq!(qb.outbound.recv().await.unwrap().as_bytes(), &[1, 0xFF]);
    }

    #[tokio::test]
    async fn test_broadcast_from_skips_sender() {
        let room = room("doc1");
        let (a, mut qa) = member(&room, 16);
        let (b, mut qb) = member(&room, 16);
        let sender = a.id();
        room.join(a);
        room.join(b);

        assert_eq!(room.broadcast_from(sender, &Frame::from(vec![1, 7])), 1);
        assert_eq!(qb.outbound.recv().await.unwrap().as_bytes(), &[1, 7]);
        assert!(qa.outbound.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_never_blocks_on_full_member() {
        let room = room("doc1");
        let (slow, mut slow_q) = member(&room, 4);
        let (fast, mut fast_q) = member(&room, 64);
        room.join(slow);
        room.join(fast);

        for i in 0..10u8 {
            room.broadcast(&Frame::from(vec![1, i]));
        }

        // Slow member kept the first four; the newer six were dropped.
        let kept: Vec<u8> = std::iter::from_fn(|| slow_q.outbound.try_recv().ok())
            .map(|f| f.as_bytes()[1])
            .collect();
        assert_eq!(kept, vec![0, 1, 2, 3]);

        let fast_count = std::iter::from_fn(|| fast_q.outbound.try_recv().ok()).count();
        assert_eq!(fast_count, 10);
        assert_eq!(room.stats.snapshot().outbound_dropped, 6);
    }

    #[test]
    fn test_idle_tracking() {
        let room = room("doc1");
        let (a, _qa) = member(&room, 4);

        room.join(a.clone());
        assert_eq!(room.idle_for(Instant::now()), None);

        room.leave(a.id());
        assert!(room.idle_for(Instant::now()).is_some());
    }

    #[test]
    fn test_concurrent_broadcast_and_membership() {
        let room = Arc::new(room("doc1"));
        let mut queues = Vec::new();
        let mut threads = Vec::new();

        for _ in 0..8 {
            let (h, q) = member(&room, 1024);
            queues.push(q);
            let room = room.clone();
            threads.push(std::thread::spawn(move || {
                room.join(h.clone());
                for i in 0..100u8 {
                    room.broadcast(&Frame::from(vec![1, i]));
                }
                room.leave(h.id());
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert!(room.is_empty());
    }
}
