//! Room fan-out and per-user delivery.
//!
//! ```text
//!                       ┌──────────── Hub ─────────────┐
//!  RoomGuard::broadcast │ rooms: code → BroadcastGroup │──► forwarder ─► conn outbound queue
//!  (room lock held)     │ users: user → {conn → queue} │──► unicast ───► conn outbound queue
//!                       └──────────────────────────────┘
//! ```
//!
//! Each room owns one tokio broadcast channel. Events are encoded once and
//! shared as `Arc` bytes. A forwarder task per subscription moves them into
//! the connection's bounded outbound queue with `try_send`; a lagged receiver
//! or a full queue trips the connection's kill switch instead of blocking the
//! room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::protocol::{ProtocolError, RoomEvent, ServerFrame};
use crate::room::{ConnId, RoomCode, UserId};

/// Bounded queue of encoded frames feeding one connection's socket writer.
pub type Outbound = mpsc::Sender<Arc<Vec<u8>>>;

/// One encoded room event plus the connection it must not be echoed to.
#[derive(Debug)]
pub struct Envelope {
    pub origin: Option<ConnId>,
    /// Set on the room-closed event; the subscription ends after it
    pub terminal: bool,
    pub encoded: Arc<Vec<u8>>,
}

/// A connection subscribed to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub conn_id: ConnId,
    pub user_id: UserId,
    pub display_name: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Room events fanned out
    pub messages_sent: u64,
    /// Subscriptions cut off for lagging or a full queue
    pub subscribers_dropped: u64,
    pub notices_sent: u64,
    /// Notices that found a full queue; that connection is dropped
    pub notices_dropped: u64,
}

/// Atomic broadcast stats; the send path never takes a lock for them.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    subscribers_dropped: AtomicU64,
    notices_sent: AtomicU64,
    notices_dropped: AtomicU64,
}

/// A live connection as seen by unicast.
struct Connection {
    outbound: Outbound,
    kill: Arc<Notify>,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    subscribers: RwLock<HashMap<ConnId, Subscriber>>,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a receiver may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscriber and hand back its receiver.
    ///
    /// A connection subscribing twice replaces its previous entry.
    pub async fn add_subscriber(&self, sub: Subscriber) -> broadcast::Receiver<Arc<Envelope>> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(sub.conn_id, sub);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, conn_id: &ConnId) -> Option<Subscriber> {
        self.subscribers.write().await.remove(conn_id)
    }

    /// Send to every receiver. Returns how many receivers were live.
    pub fn broadcast(&self, envelope: Arc<Envelope>) -> usize {
        self.sender.send(envelope).unwrap_or(0)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.read().await.values().cloned().collect()
    }
}

/// Room manager: maps room codes to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomCode, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get(&self, code: &RoomCode) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(code).cloned()
    }

    /// Get or create the group for a room.
    pub async fn get_or_create(&self, code: RoomCode) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&code) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&code) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(code, room.clone());
        room
    }

    /// Remove a group with no subscribers left.
    pub async fn remove_if_empty(&self, code: &RoomCode) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(code) {
            if room.subscriber_count().await == 0 {
                rooms.remove(code);
                return true;
            }
        }
        false
    }

    /// Remove a group unconditionally. Its sender drops with the last `Arc`.
    pub async fn remove(&self, code: &RoomCode) -> Option<Arc<BroadcastGroup>> {
        self.rooms.write().await.remove(code)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// Delivery hub shared by the registry and the gateway.
pub struct Hub {
    rooms: RoomManager,
    users: RwLock<HashMap<UserId, HashMap<ConnId, Connection>>>,
    stats: AtomicBroadcastStats,
}

impl Hub {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            rooms: RoomManager::new(broadcast_capacity),
            users: RwLock::new(HashMap::new()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            subscribers_dropped: self.stats.subscribers_dropped.load(Ordering::Relaxed),
            notices_sent: self.stats.notices_sent.load(Ordering::Relaxed),
            notices_dropped: self.stats.notices_dropped.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self) {
        self.stats.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Subscribe a connection to a room's channel.
    ///
    /// Callers hold the room lock so the receiver starts exactly after the
    /// state they snapshot.
    pub async fn subscribe(&self, code: RoomCode, sub: Subscriber) -> broadcast::Receiver<Arc<Envelope>> {
        self.rooms.get_or_create(code).await.add_subscriber(sub).await
    }

    /// Remove a connection from a room's channel. Returns the removed entry.
    pub async fn unsubscribe(&self, code: RoomCode, conn_id: &ConnId) -> Option<Subscriber> {
        match self.rooms.get(&code).await {
            Some(group) => group.remove_subscriber(conn_id).await,
            None => None,
        }
    }

    /// Drop the room's group once nobody listens. Call under the room lock.
    pub async fn release_if_idle(&self, code: RoomCode) -> bool {
        self.rooms.remove_if_empty(&code).await
    }

    /// Encode `event` once and fan it out to the room's subscribers,
    /// skipping `origin`. Returns the number of live receivers.
    pub async fn broadcast(
        &self,
        code: RoomCode,
        event: RoomEvent,
        origin: Option<ConnId>,
    ) -> Result<usize, ProtocolError> {
        let Some(group) = self.rooms.get(&code).await else {
            return Ok(0);
        };
        let terminal = event.is_terminal();
        let encoded = ServerFrame::Event { room: code, event }.encode()?;
        let count = group.broadcast(Arc::new(Envelope {
            origin,
            terminal,
            encoded: Arc::new(encoded),
        }));
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        log::trace!("Room {code}: event fanned out to {count} receiver(s)");
        Ok(count)
    }

    /// Tear down a room's channel. Receivers drain what is buffered and then
    /// observe the channel as closed.
    pub async fn close_room(&self, code: RoomCode) -> usize {
        match self.rooms.remove(&code).await {
            Some(group) => group.subscriber_count().await,
            None => 0,
        }
    }

    pub async fn subscriber_count(&self, code: RoomCode) -> usize {
        match self.rooms.get(&code).await {
            Some(group) => group.subscriber_count().await,
            None => 0,
        }
    }

    pub async fn subscribers(&self, code: RoomCode) -> Vec<Subscriber> {
        match self.rooms.get(&code).await {
            Some(group) => group.subscribers().await,
            None => Vec::new(),
        }
    }

    // ─── Per-user delivery ────────────────────────────────────────────

    /// Track a live connection so it can receive unicast frames.
    ///
    /// `kill` is fired if the connection cannot keep up with its notices.
    pub async fn register(&self, user_id: UserId, conn_id: ConnId, outbound: Outbound, kill: Arc<Notify>) {
        self.users
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id, Connection { outbound, kill });
    }

    pub async fn unregister(&self, user_id: UserId, conn_id: &ConnId) {
        let mut users = self.users.write().await;
        if let Some(conns) = users.get_mut(&user_id) {
            conns.remove(conn_id);
            if conns.is_empty() {
                users.remove(&user_id);
            }
        }
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.users.read().await.get(&user_id).map_or(0, HashMap::len)
    }

    /// Deliver a frame to every live connection of one user.
    ///
    /// Returns how many queues accepted it. A connection whose queue is full
    /// is dropped, so it reconnects and finds the current state instead of
    /// silently missing the notice.
    pub async fn unicast(&self, user_id: UserId, frame: &ServerFrame) -> Result<usize, ProtocolError> {
        let users = self.users.read().await;
        let Some(conns) = users.get(&user_id) else {
            return Ok(0);
        };
        let encoded = Arc::new(frame.encode()?);
        let mut delivered = 0;
        for (conn_id, conn) in conns {
            match conn.outbound.try_send(encoded.clone()) {
                Ok(()) => {
                    self.stats.notices_sent.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!("Notice for {user_id} found connection {conn_id} queue full; dropping it");
                    self.stats.notices_dropped.fetch_add(1, Ordering::Relaxed);
                    conn.kill.notify_one();
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    /// Pump one room subscription into a connection's outbound queue.
    ///
    /// Ends after the terminal event or when the channel closes. Falling
    /// behind the channel or finding the queue full fires `kill` so the
    /// gateway drops the connection.
    pub fn spawn_forwarder(
        self: &Arc<Self>,
        code: RoomCode,
        conn_id: ConnId,
        mut rx: broadcast::Receiver<Arc<Envelope>>,
        outbound: Outbound,
        kill: Arc<Notify>,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.origin != Some(conn_id) {
                            match outbound.try_send(envelope.encoded.clone()) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    log::warn!("Connection {conn_id} outbound queue full in room {code}; dropping");
                                    hub.record_drop();
                                    kill.notify_one();
                                    return;
                                }
                                Err(TrySendError::Closed(_)) => return,
                            }
                        }
                        if envelope.terminal {
                            log::debug!("Subscription of {conn_id} to room {code} closed by room end");
                            return;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Connection {conn_id} lagged {missed} event(s) in room {code}; dropping");
                        hub.record_drop();
                        kill.notify_one();
                        return;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn subscriber(name: &str) -> Subscriber {
        Subscriber {
            conn_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            display_name: name.into(),
        }
    }

    fn decode_event(bytes: &[u8]) -> RoomEvent {
        match ServerFrame::decode(bytes).unwrap() {
            ServerFrame::Event { event, .. } => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = subscriber("Alice");
        let conn = alice.conn_id;

        let _rx = group.add_subscriber(alice.clone()).await;
        assert_eq!(group.subscriber_count().await, 1);

        assert_eq!(group.remove_subscriber(&conn).await, Some(alice));
        assert_eq!(group.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_hub_broadcast_reaches_all_receivers() {
        let hub = Hub::new(16);
        let code = RoomCode::generate();
        let mut rx1 = hub.subscribe(code, subscriber("Alice")).await;
        let mut rx2 = hub.subscribe(code, subscriber("Bob")).await;

        let event = RoomEvent::Typing {
            user_id: Uuid::new_v4(),
            typing: true,
        };
        let count = hub.broadcast(code, event.clone(), None).await.unwrap();
        assert_eq!(count, 2);

        assert_eq!(decode_event(&rx1.recv().await.unwrap().encoded), event);
        assert_eq!(decode_event(&rx2.recv().await.unwrap().encoded), event);
    }

    #[tokio::test]
    async fn test_broadcast_without_group_is_noop() {
        let hub = Hub::new(16);
        let sent = hub
            .broadcast(RoomCode::generate(), RoomEvent::ParticipantLeft { user_id: Uuid::new_v4() }, None)
            .await
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_forwarder_skips_origin() {
        let hub = Arc::new(Hub::new(16));
        let code = RoomCode::generate();
        let alice = subscriber("Alice");
        let conn = alice.conn_id;
        let rx = hub.subscribe(code, alice).await;
        let (tx, mut out) = mpsc::channel(8);
        let kill = Arc::new(Notify::new());
        let task = hub.spawn_forwarder(code, conn, rx, tx, kill);

        let own = RoomEvent::Typing { user_id: Uuid::new_v4(), typing: true };
        let other = RoomEvent::Typing { user_id: Uuid::new_v4(), typing: false };
        hub.broadcast(code, own, Some(conn)).await.unwrap();
        hub.broadcast(code, other.clone(), Some(Uuid::new_v4())).await.unwrap();

        assert_eq!(decode_event(&out.recv().await.unwrap()), other);

        hub.close_room(code).await;
        task.await.unwrap();
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_ends_on_terminal_event() {
        let hub = Arc::new(Hub::new(16));
        let code = RoomCode::generate();
        let alice = subscriber("Alice");
        let conn = alice.conn_id;
        let rx = hub.subscribe(code, alice).await;
        let (tx, mut out) = mpsc::channel(8);
        let task = hub.spawn_forwarder(code, conn, rx, tx, Arc::new(Notify::new()));

        let closed = RoomEvent::Closed { actual_end: 9, duration_minutes: 0 };
        hub.broadcast(code, closed.clone(), None).await.unwrap();
        task.await.unwrap();
        assert_eq!(decode_event(&out.recv().await.unwrap()), closed);
    }

    #[tokio::test]
    async fn test_full_queue_trips_kill_switch() {
        let hub = Arc::new(Hub::new(16));
        let code = RoomCode::generate();
        let alice = subscriber("Alice");
        let conn = alice.conn_id;
        let rx = hub.subscribe(code, alice).await;
        let (tx, _out) = mpsc::channel(1);
        let kill = Arc::new(Notify::new());
        let task = hub.spawn_forwarder(code, conn, rx, tx, kill.clone());

        for _ in 0..3 {
            let event = RoomEvent::Typing { user_id: Uuid::new_v4(), typing: true };
            hub.broadcast(code, event, None).await.unwrap();
        }
        // notify_one stores a permit, so this resolves even if it fired first
        kill.notified().await;
        task.await.unwrap();
        assert_eq!(hub.stats().subscribers_dropped, 1);
        assert_eq!(hub.stats().messages_sent, 3);
    }

    #[tokio::test]
    async fn test_lagged_receiver_trips_kill_switch() {
        let hub = Arc::new(Hub::new(2));
        let code = RoomCode::generate();
        let alice = subscriber("Alice");
        let conn = alice.conn_id;
        let rx = hub.subscribe(code, alice).await;

        // Overrun the channel before the forwarder starts reading
        for _ in 0..5 {
            let event = RoomEvent::Typing { user_id: Uuid::new_v4(), typing: true };
            hub.broadcast(code, event, None).await.unwrap();
        }
        let (tx, _out) = mpsc::channel(64);
        let kill = Arc::new(Notify::new());
        let task = hub.spawn_forwarder(code, conn, rx, tx, kill.clone());
        kill.notified().await;
        task.await.unwrap();
        assert_eq!(hub.stats().subscribers_dropped, 1);
    }

    #[tokio::test]
    async fn test_unicast_reaches_every_connection_of_user() {
        let hub = Hub::new(16);
        let user = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        hub.register(user, Uuid::new_v4(), tx1, Arc::new(Notify::new())).await;
        hub.register(user, Uuid::new_v4(), tx2, Arc::new(Notify::new())).await;
        hub.register(Uuid::new_v4(), Uuid::new_v4(), tx3, Arc::new(Notify::new())).await;

        let frame = ServerFrame::Refused { code: crate::protocol::ErrorCode::Busy };
        assert_eq!(hub.unicast(user, &frame).await.unwrap(), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unicast_to_full_queue_drops_connection() {
        let hub = Hub::new(16);
        let user = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        let kill = Arc::new(Notify::new());
        hub.register(user, Uuid::new_v4(), tx, kill.clone()).await;

        let frame = ServerFrame::Refused { code: crate::protocol::ErrorCode::Busy };
        assert_eq!(hub.unicast(user, &frame).await.unwrap(), 1);
        assert_eq!(hub.unicast(user, &frame).await.unwrap(), 0);
        kill.notified().await;

        let stats = hub.stats();
        assert_eq!(stats.notices_sent, 1);
        assert_eq!(stats.notices_dropped, 1);
    }

    #[tokio::test]
    async fn test_unregister_drops_empty_user() {
        let hub = Hub::new(16);
        let user = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        hub.register(user, conn, tx, Arc::new(Notify::new())).await;
        assert_eq!(hub.connection_count(user).await, 1);
        hub.unregister(user, &conn).await;
        assert_eq!(hub.connection_count(user).await, 0);
    }

    #[tokio::test]
    async fn test_release_if_idle() {
        let hub = Hub::new(16);
        let code = RoomCode::generate();
        let alice = subscriber("Alice");
        let conn = alice.conn_id;
        let _rx = hub.subscribe(code, alice).await;

        assert!(!hub.release_if_idle(code).await);
        hub.unsubscribe(code, &conn).await;
        assert!(hub.release_if_idle(code).await);
        assert_eq!(hub.rooms().room_count().await, 0);
    }
}
