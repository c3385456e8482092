//! Room and membership index.
//!
//! Three independently concurrent maps: connections by id, room membership,
//! and per-user connections (multi-tab). Fan-out iterates a room bucket and
//! enqueues into each member's bounded queue; no global lock is ever held.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::Serialize;
use tracing::info;

use crate::connection::{ClientId, Connection, Enqueue};
use crate::metrics::{CONNECTIONS_CURRENT, CONNECTIONS_TOTAL, ROOMS_TOTAL};

type Bucket = DashMap<ClientId, Arc<Connection>>;

/// Current gateway statistics, served on `/stats` and `/health`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub total_connections: i64,
    pub current_connections: i64,
    pub total_rooms: i64,
}

/// Thread-safe index of all connections and their room/user membership.
pub struct RoomManager {
    /// Authoritative connection map.
    connections: DashMap<ClientId, Arc<Connection>>,
    /// Room name → member connections.
    rooms: DashMap<String, Bucket>,
    /// User id → that user's connections (multi-tab support).
    user_connections: DashMap<String, Bucket>,
    /// Lifetime connection count.
    total_connections: AtomicI64,
    /// Current room count; moves in lock-step with `rooms` keys.
    total_rooms: AtomicI64,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            user_connections: DashMap::new(),
            total_connections: AtomicI64::new(0),
            total_rooms: AtomicI64::new(0),
        }
    }

    /// Register a connection in all three indexes.
    pub fn add(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id, conn.clone());

        self.user_connections
            .entry(conn.identity.user_id.clone())
            .or_default()
            .insert(conn.id, conn.clone());

        for room in conn.rooms() {
            self.add_to_room(&room, conn.clone());
        }

        let total = self.total_connections.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_CURRENT).set(self.connections.len() as f64);

        info!(
            "Connection added: conn_id={} user_id={} brand_id={} type={} total={}",
            conn.id, conn.identity.user_id, conn.identity.brand_id, conn.identity.user_type, total
        );
    }

    /// Remove a connection from all indexes and close it. Idempotent.
    pub fn remove(&self, conn_id: ClientId) {
        let Some((_, conn)) = self.connections.remove(&conn_id) else {
            return;
        };

        for room in conn.rooms() {
            self.remove_from_room(&room, conn_id);
        }

        if let Some(user_conns) = self.user_connections.get(&conn.identity.user_id) {
            user_conns.remove(&conn_id);
        }
        self.user_connections
            .remove_if(&conn.identity.user_id, |_, bucket| bucket.is_empty());

        conn.close();
        gauge!(CONNECTIONS_CURRENT).set(self.connections.len() as f64);

        info!(
            "Connection removed: conn_id={} user_id={}",
            conn.id, conn.identity.user_id
        );
    }

    pub fn connection(&self, conn_id: ClientId) -> Option<Arc<Connection>> {
        self.connections.get(&conn_id).map(|r| r.clone())
    }

    /// All connections belonging to a user.
    pub fn user_connections(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.user_connections
            .get(user_id)
            .map(|bucket| bucket.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// All connections in a room.
    pub fn room_connections(&self, room: &str) -> Vec<Arc<Connection>> {
        self.rooms
            .get(room)
            .map(|bucket| bucket.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Add an existing connection to a room.
    pub fn join(&self, conn_id: ClientId, room: &str) {
        let Some(conn) = self.connection(conn_id) else {
            return;
        };
        conn.join(room);
        self.add_to_room(room, conn);
    }

    /// Remove a connection from a room.
    pub fn leave(&self, conn_id: ClientId, room: &str) {
        let Some(conn) = self.connection(conn_id) else {
            return;
        };
        conn.leave(room);
        self.remove_from_room(room, conn_id);
    }

    fn add_to_room(&self, room: &str, conn: Arc<Connection>) {
        match self.rooms.entry(room.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().insert(conn.id, conn);
            }
            Entry::Vacant(entry) => {
                let bucket = Bucket::new();
                bucket.insert(conn.id, conn);
                entry.insert(bucket);
                self.total_rooms.fetch_add(1, Ordering::Relaxed);
                gauge!(ROOMS_TOTAL).increment(1.0);
            }
        }
    }

    fn remove_from_room(&self, room: &str, conn_id: ClientId) {
        if let Some(bucket) = self.rooms.get(room) {
            bucket.remove(&conn_id);
        }
        if self
            .rooms
            .remove_if(room, |_, bucket| bucket.is_empty())
            .is_some()
        {
            self.total_rooms.fetch_sub(1, Ordering::Relaxed);
            gauge!(ROOMS_TOTAL).decrement(1.0);
        }
    }

    /// Enqueue a frame to every member of a room, skipping `exclude`.
    ///
    /// Returns the number of accepted enqueues; full queues drop the frame
    /// for that recipient without blocking.
    pub fn broadcast_to_room(
        &self,
        room: &str,
        frame: &Utf8Bytes,
        exclude: Option<ClientId>,
    ) -> usize {
        let Some(bucket) = self.rooms.get(room) else {
            return 0;
        };

        let mut count = 0;
        for entry in bucket.iter() {
            if Some(*entry.key()) == exclude {
                continue;
            }
            if entry.value().enqueue(frame.clone()) == Enqueue::Accepted {
                count += 1;
            }
        }
        count
    }

    /// Enqueue a frame to every connection of a user, skipping `exclude`.
    pub fn broadcast_to_user(
        &self,
        user_id: &str,
        frame: &Utf8Bytes,
        exclude: Option<ClientId>,
    ) -> usize {
        let mut count = 0;
        for conn in self.user_connections(user_id) {
            if Some(conn.id) == exclude {
                continue;
            }
            if conn.enqueue(frame.clone()) == Enqueue::Accepted {
                count += 1;
            }
        }
        count
    }

    pub fn stats(&self) -> Stats {
        Stats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            current_connections: self.connections.len() as i64,
            total_rooms: self.total_rooms.load(Ordering::Relaxed),
        }
    }

    /// Close and remove every connection (shutdown drain).
    pub fn drain(&self) {
        let ids: Vec<ClientId> = self.connections.iter().map(|e| *e.key()).collect();
        info!("Draining {} connections", ids.len());
        for id in ids {
            self.remove(id);
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Identity;
    use tokio::sync::mpsc;

    fn connect(
        manager: &RoomManager,
        user_id: &str,
        rooms: &[&str],
    ) -> (Arc<Connection>, mpsc::Receiver<Utf8Bytes>) {
        let identity = Identity {
            user_id: user_id.to_string(),
            ..Default::default()
        };
        let claim_rooms: Vec<String> = rooms.iter().map(|r| r.to_string()).collect();
        let (conn, rx) = Connection::new(identity, &claim_rooms, 8);
        let conn = Arc::new(conn);
        manager.add(conn.clone());
        (conn, rx)
    }

    /// Every connection must be indexed under its user and each of its rooms.
    fn assert_consistent(manager: &RoomManager, conn: &Arc<Connection>) {
        assert!(manager.connection(conn.id).is_some());
        assert!(manager
            .user_connections(&conn.identity.user_id)
            .iter()
            .any(|c| c.id == conn.id));
        for room in conn.rooms() {
            assert!(manager
                .room_connections(&room)
                .iter()
                .any(|c| c.id == conn.id));
        }
    }

    #[test]
    fn add_indexes_connection_in_all_maps() {
        let manager = RoomManager::new();
        let (conn, _rx) = connect(&manager, "42", &["chat:7"]);
        assert_consistent(&manager, &conn);
        assert_eq!(manager.stats().current_connections, 1);
        // user:42 plus chat:7
        assert_eq!(manager.stats().total_rooms, 2);
    }

    #[test]
    fn add_then_remove_restores_empty_state() {
        let manager = RoomManager::new();
        let (conn, _rx) = connect(&manager, "42", &["chat:7"]);
        manager.remove(conn.id);

        assert!(manager.connection(conn.id).is_none());
        assert!(manager.user_connections("42").is_empty());
        assert!(manager.room_connections("chat:7").is_empty());
        assert!(manager.room_connections("user:42").is_empty());
        assert_eq!(manager.stats().current_connections, 0);
        assert_eq!(manager.stats().total_rooms, 0);
        assert!(conn.is_closed());
    }

    #[test]
    fn remove_is_idempotent() {
        let manager = RoomManager::new();
        let (conn, _rx) = connect(&manager, "42", &[]);
        manager.remove(conn.id);
        manager.remove(conn.id);
        assert_eq!(manager.stats().current_connections, 0);
    }

    #[test]
    fn join_then_leave_restores_pre_state() {
        let manager = RoomManager::new();
        let (conn, _rx) = connect(&manager, "42", &[]);
        let rooms_before = manager.stats().total_rooms;

        manager.join(conn.id, "chat:7");
        assert!(conn.in_room("chat:7"));
        assert_eq!(manager.stats().total_rooms, rooms_before + 1);

        manager.leave(conn.id, "chat:7");
        assert!(!conn.in_room("chat:7"));
        assert_eq!(manager.stats().total_rooms, rooms_before);
        assert!(manager.room_connections("chat:7").is_empty());
    }

    #[test]
    fn empty_room_is_deleted_when_last_member_leaves() {
        let manager = RoomManager::new();
        let (a, _rx_a) = connect(&manager, "1", &["chat:7"]);
        let (b, _rx_b) = connect(&manager, "2", &["chat:7"]);

        manager.leave(a.id, "chat:7");
        assert_eq!(manager.room_connections("chat:7").len(), 1);
        manager.leave(b.id, "chat:7");
        assert!(manager.room_connections("chat:7").is_empty());
        // user:1 and user:2 remain
        assert_eq!(manager.stats().total_rooms, 2);
    }

    #[test]
    fn broadcast_to_room_excludes_sender() {
        let manager = RoomManager::new();
        let (a, mut rx_a) = connect(&manager, "1", &["chat:7"]);
        let (_b, mut rx_b) = connect(&manager, "2", &["chat:7"]);

        let frame = Utf8Bytes::from(r#"{"type":"message"}"#);
        let delivered = manager.broadcast_to_room("chat:7", &frame, Some(a.id));

        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().as_str(), r#"{"type":"message"}"#);
    }

    #[test]
    fn broadcast_to_user_reaches_all_tabs() {
        let manager = RoomManager::new();
        let (_a, mut rx_a) = connect(&manager, "42", &[]);
        let (_b, mut rx_b) = connect(&manager, "42", &[]);

        let frame = Utf8Bytes::from("notify");
        let delivered = manager.broadcast_to_user("42", &frame, None);

        assert_eq!(delivered, 2);
        assert_eq!(rx_a.try_recv().unwrap().as_str(), "notify");
        assert_eq!(rx_b.try_recv().unwrap().as_str(), "notify");
    }

    #[test]
    fn broadcast_to_unknown_room_delivers_nothing() {
        let manager = RoomManager::new();
        assert_eq!(
            manager.broadcast_to_room("nowhere", &Utf8Bytes::from("x"), None),
            0
        );
    }

    #[test]
    fn slow_consumer_drops_but_stays_attached() {
        let manager = RoomManager::new();
        let identity = Identity {
            user_id: "42".to_string(),
            ..Default::default()
        };
        let (conn, _rx) = Connection::new(identity, &["chat:7".to_string()], 4);
        let conn = Arc::new(conn);
        manager.add(conn.clone());

        let frame = Utf8Bytes::from("burst");
        for _ in 0..4 {
            assert_eq!(manager.broadcast_to_room("chat:7", &frame, None), 1);
        }
        // Queue full: the frame is dropped for this recipient, nothing blocks
        // and the session stays registered.
        assert_eq!(manager.broadcast_to_room("chat:7", &frame, None), 0);
        assert!(manager.connection(conn.id).is_some());
    }

    #[test]
    fn drain_closes_and_removes_everything() {
        let manager = RoomManager::new();
        let (a, _rx_a) = connect(&manager, "1", &["chat:7"]);
        let (b, _rx_b) = connect(&manager, "2", &[]);

        manager.drain();

        assert_eq!(manager.stats().current_connections, 0);
        assert_eq!(manager.stats().total_rooms, 0);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
