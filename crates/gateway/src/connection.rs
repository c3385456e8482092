//! Per-socket connection state.
//!
//! A `Connection` owns the identity bound at authentication time, the set of
//! rooms it has joined, and the bounded queue feeding its writer task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::{MESSAGES_SENT, SLOW_CONSUMER_DROPPED};

/// Unique connection identifier; never reused within the process.
pub type ClientId = Uuid;

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    Dropped,
}

/// Identity bound to a connection after token validation.
///
/// Claims override query parameters; fields left empty simply had no value
/// from either source. `user_id` is the decimal rendering of the claim.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: String,
    pub brand_id: String,
    pub role: String,
    /// "cskh" or "customer".
    pub user_type: String,
    pub device: String,
    pub tags: String,
    pub tz: String,
    pub channel: String,
    pub room_id: String,
}

/// State for a single connected client.
pub struct Connection {
    pub id: ClientId,
    pub identity: Identity,
    /// Rooms this connection is currently joined to.
    rooms: Mutex<HashSet<String>>,
    /// Sender side of the outbound queue. `None` once closed; dropping the
    /// sender is what terminates the writer.
    sender: Mutex<Option<mpsc::Sender<Utf8Bytes>>>,
    closed: AtomicBool,
    pub created_at: DateTime<Utc>,
    /// Millisecond timestamp of the last inbound frame.
    last_activity: AtomicI64,
}

impl Connection {
    /// Create a connection with its auto-joined rooms and outbound queue.
    ///
    /// Returns the receiver half of the queue for the writer task.
    pub fn new(
        identity: Identity,
        claim_rooms: &[String],
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let now = Utc::now();
        let conn = Self {
            id: Uuid::new_v4(),
            rooms: Mutex::new(initial_rooms(&identity, claim_rooms)),
            identity,
            sender: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
        };
        (conn, rx)
    }

    /// Enqueue an already-serialized frame for delivery.
    ///
    /// Never blocks. A full queue drops the frame (slow consumer); a closed
    /// connection accepts it as a no-op.
    pub fn enqueue(&self, frame: Utf8Bytes) -> Enqueue {
        let sender = self.sender.lock().expect("connection sender lock poisoned");
        let Some(tx) = sender.as_ref() else {
            return Enqueue::Accepted;
        };
        match tx.try_send(frame) {
            Ok(()) => {
                counter!(MESSAGES_SENT).increment(1);
                Enqueue::Accepted
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Send buffer full, dropping frame for conn {} (user {})",
                    self.id, self.identity.user_id
                );
                counter!(SLOW_CONSUMER_DROPPED).increment(1);
                Enqueue::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Accepted,
        }
    }

    pub fn join(&self, room: &str) {
        self.rooms
            .lock()
            .expect("connection rooms lock poisoned")
            .insert(room.to_string());
        debug!(
            "Conn {} (user {}) joined room {}",
            self.id, self.identity.user_id, room
        );
    }

    pub fn leave(&self, room: &str) {
        self.rooms
            .lock()
            .expect("connection rooms lock poisoned")
            .remove(room);
        debug!(
            "Conn {} (user {}) left room {}",
            self.id, self.identity.user_id, room
        );
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.rooms
            .lock()
            .expect("connection rooms lock poisoned")
            .contains(room)
    }

    /// Snapshot of the joined room set.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms
            .lock()
            .expect("connection rooms lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_millis(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the outbound queue. Idempotent; the first call drops the sender,
    /// which lets the writer drain and exit.
    pub fn close(&self) {
        let mut sender = self.sender.lock().expect("connection sender lock poisoned");
        if sender.take().is_some() {
            self.closed.store(true, Ordering::Release);
        }
    }
}

/// Rooms a connection is placed in at construction time.
///
/// Always the user's own room; the brand room when a brand is bound; the
/// folder rooms for operator ("cskh") sessions; any rooms asserted by the
/// token; and an explicit `room_id` from the upgrade request.
fn initial_rooms(identity: &Identity, claim_rooms: &[String]) -> HashSet<String> {
    let mut rooms = HashSet::new();
    rooms.insert(format!("user:{}", identity.user_id));
    if !identity.brand_id.is_empty() {
        rooms.insert(format!("brand:{}", identity.brand_id));
    }
    if identity.user_type == "cskh" {
        rooms.insert(format!("folder:{}:all", identity.brand_id));
        rooms.insert(format!("folder:{}:waiting", identity.brand_id));
        rooms.insert(format!("folder:{}:active", identity.brand_id));
    }
    for room in claim_rooms {
        rooms.insert(room.clone());
    }
    if !identity.room_id.is_empty() {
        rooms.insert(identity.room_id.clone());
    }
    rooms
}
