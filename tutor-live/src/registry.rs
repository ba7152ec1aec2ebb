//! Room registry: lifecycle, authorization and per-room serialization.
//!
//! ```text
//!  live: RwLock<HashMap<code, Slot>>        (lookup/insert only, never held across I/O)
//!                    │
//!                    ▼  Slot = OnceCell filled by the first caller to load the room
//!              ┌────────────┐
//!              │ RoomState  │  room record · stamp clock · whiteboard board
//!              └────────────┘
//!                    │  RoomGuard: persist → mutate → broadcast, all under the lock
//! ```
//!
//! A room's state is loaded from the store on first use and cached. The
//! whole acquisition (slot lookup, load and room mutex) is bounded by
//! `lock_timeout`. Ended and idle rooms are retired from the cache; a waiter
//! that wakes on a retired state looks the room up again, so there is only
//! ever one live serialization point per room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, OnceCell, OwnedMutexGuard, RwLock};

use crate::broadcast::{Envelope, Hub, Subscriber};
use crate::error::{RoomError, RoomResult};
use crate::protocol::{Notice, RoomEvent, ServerFrame};
use crate::room::{now_millis, ConnId, Principal, Room, RoomCode, RoomStatus, Stamp, StampClock, UserId};
use crate::storage::{RetryPolicy, RoomStore};
use crate::whiteboard::Board;

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Longest wait for a room's serialization point
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// Snapshot of a room for monitoring and the `Stats` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomStats {
    pub code: RoomCode,
    pub status: RoomStatus,
    pub actual_start: Option<u64>,
    pub actual_end: Option<u64>,
    pub tutor_joined_at: Option<u64>,
    pub student_joined_at: Option<u64>,
    pub tutor_left_at: Option<u64>,
    pub student_left_at: Option<u64>,
    pub duration_minutes: u32,
    /// Distinct users with at least one subscribed connection
    pub online: Vec<UserId>,
    pub visible_strokes: usize,
    pub tombstones: usize,
}

/// Mutable per-room state guarded by the room lock.
pub struct RoomState {
    room: Room,
    clock: StampClock,
    board: Board,
    /// Set once this state left the live map; holders must look up again
    retired: bool,
}

type SharedState = Arc<Mutex<RoomState>>;

/// A room's entry in the live map, filled by whichever caller loads it first.
type Slot = Arc<OnceCell<SharedState>>;

/// Exclusive access to one room. Dropping it releases the room.
pub struct RoomGuard {
    code: RoomCode,
    state: OwnedMutexGuard<RoomState>,
    hub: Arc<Hub>,
}

impl RoomGuard {
    pub fn code(&self) -> RoomCode {
        self.code
    }

    pub fn room(&self) -> &Room {
        &self.state.room
    }

    pub fn board(&self) -> &Board {
        &self.state.board
    }

    pub(crate) fn board_mut(&mut self) -> &mut Board {
        &mut self.state.board
    }

    fn set_room(&mut self, room: Room) {
        self.state.room = room;
    }

    /// Allocate the next ordering stamp for this room.
    pub fn next_stamp(&mut self) -> Stamp {
        self.state.clock.next(now_millis())
    }

    /// Chat and whiteboard writes need an active room.
    pub fn ensure_active(&self) -> RoomResult<()> {
        match self.state.room.status {
            RoomStatus::Active => Ok(()),
            RoomStatus::Scheduled => Err(RoomError::NotActive(self.code)),
            RoomStatus::Ended => Err(RoomError::AlreadyEnded(self.code)),
        }
    }

    /// Fan an event out to the room's subscribers except `origin`.
    pub async fn broadcast(&self, event: RoomEvent, origin: Option<ConnId>) -> usize {
        match self.hub.broadcast(self.code, event, origin).await {
            Ok(count) => count,
            Err(e) => {
                log::error!("Room {}: failed to encode event: {e}", self.code);
                0
            }
        }
    }

    /// Subscribe a connection; it receives every event broadcast after this
    /// guard is released.
    pub async fn subscribe(&self, sub: Subscriber) -> broadcast::Receiver<Arc<Envelope>> {
        self.hub.subscribe(self.code, sub).await
    }
}

/// Owner of every room's lifecycle.
pub struct RoomRegistry {
    store: Arc<dyn RoomStore>,
    hub: Arc<Hub>,
    live: RwLock<HashMap<RoomCode, Slot>>,
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn RoomStore>, hub: Arc<Hub>, config: RegistryConfig) -> Self {
        Self {
            store,
            hub,
            live: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn retry(&self) -> RetryPolicy {
        self.config.retry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Number of rooms with cached live state.
    pub async fn live_count(&self) -> usize {
        self.live
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Schedule a new room. Validation happens before any side effect.
    pub async fn create_room(
        &self,
        tutor_id: UserId,
        student_id: UserId,
        scheduled_start: u64,
        scheduled_end: u64,
    ) -> RoomResult<Room> {
        if scheduled_end <= scheduled_start {
            return Err(RoomError::Validation(
                "scheduled end must be after scheduled start".into(),
            ));
        }
        if tutor_id == student_id {
            return Err(RoomError::Validation(
                "tutor and student must be different users".into(),
            ));
        }

        let room = Room::scheduled(
            RoomCode::generate(),
            tutor_id,
            student_id,
            scheduled_start,
            scheduled_end,
        );
        self.persist_room(&room).await?;
        log::info!("Room {} scheduled: tutor {tutor_id}, student {student_id}", room.code);
        Ok(room)
    }

    /// Current room record, or `NotFound`.
    pub async fn resolve_by_code(&self, code: RoomCode) -> RoomResult<Room> {
        if self.cached(code).await.is_some() {
            let guard = self.lock_state(code).await?;
            return Ok(guard.room.clone());
        }
        self.config
            .retry
            .run("load room", || self.store.load_room(code))
            .await?
            .ok_or(RoomError::NotFound(code))
    }

    /// Ok iff the principal is the room's tutor or student.
    pub fn authorize(room: &Room, principal: &Principal) -> RoomResult<()> {
        if room.is_participant(principal.user_id) {
            Ok(())
        } else {
            log::debug!("User {} denied access to room {}", principal.user_id, room.code);
            Err(RoomError::AccessDenied(room.code))
        }
    }

    /// Lock a room on behalf of a member.
    pub async fn lock(&self, code: RoomCode, principal: &Principal) -> RoomResult<RoomGuard> {
        let state = self.lock_state(code).await?;
        Self::authorize(&state.room, principal)?;
        Ok(self.guard(code, state))
    }

    /// Lock a room on behalf of a member and require it to be active.
    pub async fn lock_active(&self, code: RoomCode, principal: &Principal) -> RoomResult<RoomGuard> {
        let guard = self.lock(code, principal).await?;
        guard.ensure_active()?;
        Ok(guard)
    }

    /// Enter a room: `Scheduled → Active` on the first join.
    pub async fn join(&self, code: RoomCode, principal: &Principal) -> RoomResult<Room> {
        let mut guard = self.lock(code, principal).await?;
        self.join_locked(&mut guard, principal).await
    }

    /// [`join`](Self::join) for a caller already holding the room.
    pub async fn join_locked(&self, guard: &mut RoomGuard, principal: &Principal) -> RoomResult<Room> {
        if guard.room().is_ended() {
            return Err(RoomError::AlreadyEnded(guard.code()));
        }

        let now = now_millis();
        let mut next = guard.room().clone();
        let activated = next.activate(now);
        let rejoined = next.record_join(principal.user_id, now);
        if activated || rejoined {
            self.persist_room(&next).await?;
            guard.set_room(next);
        }

        if activated {
            log::info!("Room {} activated by {}", guard.code(), principal.user_id);
            guard.broadcast(RoomEvent::Activated { actual_start: now }, None).await;
        }
        Ok(guard.room().clone())
    }

    /// End a room. Ending an ended room succeeds and keeps the first end stamp.
    pub async fn end(&self, code: RoomCode, principal: &Principal) -> RoomResult<Room> {
        let mut guard = self.lock(code, principal).await?;
        if guard.room().is_ended() {
            return Ok(guard.room().clone());
        }

        let mut next = guard.room().clone();
        next.finish(now_millis());
        self.persist_room(&next).await?;
        guard.set_room(next.clone());

        let actual_end = next.actual_end.unwrap_or_default();
        guard
            .broadcast(
                RoomEvent::Closed {
                    actual_end,
                    duration_minutes: next.duration_minutes,
                },
                None,
            )
            .await;
        let closed = self.hub.close_room(code).await;

        let notice = ServerFrame::Notice(Notice::RoomEnded {
            room: code,
            duration_minutes: next.duration_minutes,
        });
        for user in [next.tutor_id, next.student_id] {
            if let Err(e) = self.hub.unicast(user, &notice).await {
                log::error!("Room {code}: end notice for {user} not sent: {e}");
            }
        }

        self.retire(guard).await;
        log::info!(
            "Room {code} ended by {} after {} minute(s); {closed} subscription(s) closed",
            principal.user_id,
            next.duration_minutes
        );
        Ok(next)
    }

    /// Drop one connection's subscription and announce it.
    ///
    /// When it was the user's last connection in the room, the leave time is
    /// recorded; a later join clears it again. Returns whether a subscription
    /// existed.
    pub async fn leave(&self, code: RoomCode, conn_id: ConnId) -> bool {
        let Some(state) = self.cached(code).await else {
            return self.hub.unsubscribe(code, &conn_id).await.is_some();
        };

        match tokio::time::timeout(self.config.lock_timeout, state.lock_owned()).await {
            Ok(state) if !state.retired => {
                let mut guard = self.guard(code, state);
                let Some(sub) = self.hub.unsubscribe(code, &conn_id).await else {
                    return false;
                };
                let still_here = self
                    .hub
                    .subscribers(code)
                    .await
                    .iter()
                    .any(|s| s.user_id == sub.user_id);
                if !still_here {
                    self.record_leave(&mut guard, sub.user_id).await;
                }
                guard
                    .broadcast(RoomEvent::ParticipantLeft { user_id: sub.user_id }, Some(conn_id))
                    .await;
                self.hub.release_if_idle(code).await;
                true
            }
            Ok(_) => self.hub.unsubscribe(code, &conn_id).await.is_some(),
            Err(_) => {
                log::warn!("Room {code}: leave of {conn_id} not recorded, room busy");
                self.hub.unsubscribe(code, &conn_id).await.is_some()
            }
        }
    }

    async fn record_leave(&self, guard: &mut RoomGuard, user_id: UserId) {
        let mut next = guard.room().clone();
        if !next.record_leave(user_id, now_millis()) {
            return;
        }
        match self.persist_room(&next).await {
            Ok(()) => guard.set_room(next),
            Err(e) => log::error!("Room {}: leave of {user_id} not persisted: {e}", guard.code()),
        }
    }

    /// Broadcast an ephemeral typing indicator.
    pub async fn typing(
        &self,
        code: RoomCode,
        principal: &Principal,
        typing: bool,
        origin: Option<ConnId>,
    ) -> RoomResult<()> {
        let guard = self.lock_active(code, principal).await?;
        guard
            .broadcast(
                RoomEvent::Typing {
                    user_id: principal.user_id,
                    typing,
                },
                origin,
            )
            .await;
        Ok(())
    }

    pub async fn stats(&self, code: RoomCode, principal: &Principal) -> RoomResult<RoomStats> {
        let guard = self.lock(code, principal).await?;
        let room = guard.room();
        let mut online: Vec<UserId> = self
            .hub
            .subscribers(code)
            .await
            .into_iter()
            .map(|s| s.user_id)
            .collect();
        online.sort();
        online.dedup();

        Ok(RoomStats {
            code,
            status: room.status,
            actual_start: room.actual_start,
            actual_end: room.actual_end,
            tutor_joined_at: room.tutor_joined_at,
            student_joined_at: room.student_joined_at,
            tutor_left_at: room.tutor_left_at,
            student_left_at: room.student_left_at,
            duration_minutes: room.duration_minutes,
            online,
            visible_strokes: guard.board().visible_count(),
            tombstones: guard.board().tombstone_count(),
        })
    }

    /// Retire cached rooms nobody is subscribed to. Busy rooms are skipped.
    ///
    /// Candidates are collected first; the map lock is never held while a
    /// room or the hub is consulted.
    pub async fn evict_idle(&self) -> usize {
        let candidates: Vec<(RoomCode, Slot)> = self
            .live
            .read()
            .await
            .iter()
            .map(|(code, slot)| (*code, Arc::clone(slot)))
            .collect();

        let mut evicted = 0;
        for (code, slot) in candidates {
            let Some(shared) = slot.get() else {
                self.drop_abandoned(code, &slot).await;
                continue;
            };
            let Ok(mut state) = Arc::clone(shared).try_lock_owned() else {
                continue;
            };
            if state.retired || self.hub.subscriber_count(code).await > 0 {
                continue;
            }
            state.retired = true;
            self.forget(code, &state).await;
            evicted += 1;
        }
        if evicted > 0 {
            log::debug!("Evicted {evicted} idle room(s)");
        }
        evicted
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn guard(&self, code: RoomCode, state: OwnedMutexGuard<RoomState>) -> RoomGuard {
        RoomGuard {
            code,
            state,
            hub: Arc::clone(&self.hub),
        }
    }

    async fn persist_room(&self, room: &Room) -> RoomResult<()> {
        self.config
            .retry
            .run("save room", || self.store.save_room(room))
            .await?;
        Ok(())
    }

    /// Acquire a room's serialization point within `lock_timeout`.
    ///
    /// The bound covers loading a cold room as well as waiting for the mutex.
    async fn lock_state(&self, code: RoomCode) -> RoomResult<OwnedMutexGuard<RoomState>> {
        match tokio::time::timeout(self.config.lock_timeout, self.acquire(code)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Room {code}: lock not acquired within {:?}", self.config.lock_timeout);
                Err(RoomError::Busy(code))
            }
        }
    }

    async fn acquire(&self, code: RoomCode) -> RoomResult<OwnedMutexGuard<RoomState>> {
        loop {
            let shared = self.live_state(code).await?;
            let state = shared.lock_owned().await;
            if state.retired {
                continue;
            }
            // Ended rooms are handed out uncached
            if state.room.is_ended() {
                self.forget(code, &state).await;
            }
            return Ok(state);
        }
    }

    /// Loaded state of a cached room, without touching the store.
    async fn cached(&self, code: RoomCode) -> Option<SharedState> {
        self.live.read().await.get(&code).and_then(|slot| slot.get().cloned())
    }

    /// The room's slot, inserting an empty one on a miss.
    async fn slot(&self, code: RoomCode) -> Slot {
        if let Some(slot) = self.live.read().await.get(&code) {
            return Arc::clone(slot);
        }
        Arc::clone(self.live.write().await.entry(code).or_default())
    }

    /// Cached state for a room, loading it from the store on a miss.
    ///
    /// Concurrent callers for the same room share one load; other rooms are
    /// never held up by it.
    async fn live_state(&self, code: RoomCode) -> RoomResult<SharedState> {
        loop {
            let slot = self.slot(code).await;
            match slot.get_or_try_init(|| self.load_state(code)).await {
                Ok(state) => {
                    if self.is_current(code, &slot).await {
                        return Ok(Arc::clone(state));
                    }
                }
                Err(e) => {
                    self.drop_unloaded(code, &slot).await;
                    return Err(e);
                }
            }
        }
    }

    async fn load_state(&self, code: RoomCode) -> RoomResult<SharedState> {
        let retry = self.config.retry;
        let room = retry
            .run("load room", || self.store.load_room(code))
            .await?
            .ok_or(RoomError::NotFound(code))?;
        let records = retry.run("load board", || self.store.load_board(code)).await?;
        let last = retry
            .run("load latest stamp", || self.store.latest_stamp(code))
            .await?;
        log::debug!("Room {code} loaded ({} board record(s))", records.len());

        Ok(Arc::new(Mutex::new(RoomState {
            room,
            clock: StampClock::starting_after(last),
            board: Board::from_records(&records),
            retired: false,
        })))
    }

    async fn is_current(&self, code: RoomCode, slot: &Slot) -> bool {
        self.live
            .read()
            .await
            .get(&code)
            .is_some_and(|s| Arc::ptr_eq(s, slot))
    }

    /// Remove a slot whose load failed, unless someone filled it meanwhile.
    async fn drop_unloaded(&self, code: RoomCode, slot: &Slot) {
        let mut live = self.live.write().await;
        if live
            .get(&code)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && !s.initialized())
        {
            live.remove(&code);
        }
    }

    /// Remove an empty slot that no caller is loading any more.
    async fn drop_abandoned(&self, code: RoomCode, slot: &Slot) {
        let mut live = self.live.write().await;
        // One reference in the map, one held by the caller
        if Arc::strong_count(slot) == 2
            && !slot.initialized()
            && live.get(&code).is_some_and(|s| Arc::ptr_eq(s, slot))
        {
            live.remove(&code);
        }
    }

    /// Drop the map entry holding this exact state.
    async fn forget(&self, code: RoomCode, state: &OwnedMutexGuard<RoomState>) {
        let mut live = self.live.write().await;
        let ours = live
            .get(&code)
            .and_then(|slot| slot.get())
            .is_some_and(|s| Arc::ptr_eq(s, OwnedMutexGuard::mutex(state)));
        if ours {
            live.remove(&code);
        }
    }

    /// Remove a room's state from the cache while still holding it.
    async fn retire(&self, mut guard: RoomGuard) {
        guard.state.retired = true;
        self.forget(guard.code, &guard.state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreError};
    use uuid::Uuid;

    struct Fixture {
        registry: Arc<RoomRegistry>,
        store: Arc<MemoryStore>,
        tutor: Principal,
        student: Principal,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(64));
        let registry = Arc::new(RoomRegistry::new(store.clone(), hub, RegistryConfig::default()));
        Fixture {
            registry,
            store,
            tutor: Principal::new(Uuid::new_v4(), "Tutor"),
            student: Principal::new(Uuid::new_v4(), "Student"),
        }
    }

    async fn scheduled(f: &Fixture) -> Room {
        f.registry
            .create_room(f.tutor.user_id, f.student.user_id, 1_000, 2_000)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_inverted_schedule_without_side_effects() {
        let f = fixture();
        let err = f
            .registry
            .create_room(f.tutor.user_id, f.student.user_id, 2_000, 2_000)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Validation(_)));
        assert!(f.store.list_rooms().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_persists_scheduled_room() {
        let f = fixture();
        let room = scheduled(&f).await;
        assert_eq!(room.status, RoomStatus::Scheduled);
        assert_eq!(f.store.load_room(room.code).unwrap(), Some(room.clone()));
        assert_eq!(f.registry.resolve_by_code(room.code).await.unwrap(), room);
    }

    #[tokio::test]
    async fn test_resolve_unknown_code() {
        let f = fixture();
        let err = f.registry.resolve_by_code(RoomCode::generate()).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stranger_cannot_join() {
        let f = fixture();
        let room = scheduled(&f).await;
        let stranger = Principal::new(Uuid::new_v4(), "Mallory");
        let err = f.registry.join(room.code, &stranger).await.unwrap_err();
        assert!(matches!(err, RoomError::AccessDenied(_)));
        assert_eq!(f.registry.resolve_by_code(room.code).await.unwrap().status, RoomStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_first_join_activates_once() {
        let f = fixture();
        let room = scheduled(&f).await;

        let first = f.registry.join(room.code, &f.student).await.unwrap();
        assert_eq!(first.status, RoomStatus::Active);
        let started = first.actual_start;
        assert!(started.is_some());
        assert!(first.student_joined_at.is_some());

        let second = f.registry.join(room.code, &f.tutor).await.unwrap();
        assert_eq!(second.actual_start, started);
        assert!(second.tutor_joined_at.is_some());
        assert_eq!(f.store.load_room(room.code).unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_blocks_join() {
        let f = fixture();
        let room = scheduled(&f).await;
        f.registry.join(room.code, &f.tutor).await.unwrap();

        let ended = f.registry.end(room.code, &f.tutor).await.unwrap();
        assert_eq!(ended.status, RoomStatus::Ended);
        let again = f.registry.end(room.code, &f.student).await.unwrap();
        assert_eq!(again.actual_end, ended.actual_end);

        let err = f.registry.join(room.code, &f.student).await.unwrap_err();
        assert!(matches!(err, RoomError::AlreadyEnded(_)));
        assert_eq!(f.registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_stranger_cannot_end() {
        let f = fixture();
        let room = scheduled(&f).await;
        let stranger = Principal::new(Uuid::new_v4(), "Mallory");
        assert!(matches!(
            f.registry.end(room.code, &stranger).await,
            Err(RoomError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_first_joins_stamp_one_start() {
        let f = fixture();
        let room = scheduled(&f).await;
        let (a, b) = tokio::join!(
            f.registry.join(room.code, &f.tutor),
            f.registry.join(room.code, &f.student)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let stored = f.store.load_room(room.code).unwrap().unwrap();
        assert_eq!(stored.actual_start, a.actual_start.min(b.actual_start));
        assert_eq!(a.actual_start, b.actual_start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_yields_busy() {
        let f = fixture();
        let room = scheduled(&f).await;
        let held = f.registry.lock(room.code, &f.tutor).await.unwrap();

        let err = f.registry.join(room.code, &f.student).await.unwrap_err();
        assert!(matches!(err, RoomError::Busy(_)));
        drop(held);
        assert!(f.registry.join(room.code, &f.student).await.is_ok());
    }

    #[tokio::test]
    async fn test_writes_require_active() {
        let f = fixture();
        let room = scheduled(&f).await;
        assert!(matches!(
            f.registry.lock_active(room.code, &f.tutor).await,
            Err(RoomError::NotActive(_))
        ));
        f.registry.join(room.code, &f.tutor).await.unwrap();
        assert!(f.registry.lock_active(room.code, &f.tutor).await.is_ok());
    }

    #[tokio::test]
    async fn test_stamps_resume_after_eviction() {
        let f = fixture();
        let room = scheduled(&f).await;
        f.registry.join(room.code, &f.tutor).await.unwrap();
        let first = {
            let mut guard = f.registry.lock(room.code, &f.tutor).await.unwrap();
            guard.next_stamp()
        };
        // Record something so the store knows the newest stamp
        f.store
            .append_chat(&crate::chat::ChatMessage {
                room: room.code,
                sender_id: f.tutor.user_id,
                sender_name: "Tutor".into(),
                body: "hi".into(),
                stamp: first,
            })
            .unwrap();

        assert_eq!(f.registry.evict_idle().await, 1);
        let mut guard = f.registry.lock(room.code, &f.tutor).await.unwrap();
        assert!(guard.next_stamp() > first);
    }

    #[tokio::test]
    async fn test_end_notifies_both_participants() {
        let f = fixture();
        let room = scheduled(&f).await;
        f.registry.join(room.code, &f.tutor).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        f.registry
            .hub()
            .register(f.student.user_id, Uuid::new_v4(), tx, Arc::new(tokio::sync::Notify::new()))
            .await;
        f.registry.end(room.code, &f.tutor).await.unwrap();

        let frame = ServerFrame::decode(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(frame, ServerFrame::Notice(Notice::RoomEnded { room: r, .. }) if r == room.code));
    }

    #[tokio::test]
    async fn test_stats_reports_online_users() {
        let f = fixture();
        let room = scheduled(&f).await;
        {
            let mut guard = f.registry.lock(room.code, &f.student).await.unwrap();
            f.registry.join_locked(&mut guard, &f.student).await.unwrap();
            let _rx = guard
                .subscribe(Subscriber {
                    conn_id: Uuid::new_v4(),
                    user_id: f.student.user_id,
                    display_name: "Student".into(),
                })
                .await;
        }
        let stats = f.registry.stats(room.code, &f.tutor).await.unwrap();
        assert_eq!(stats.status, RoomStatus::Active);
        assert_eq!(stats.online, vec![f.student.user_id]);
    }

    #[tokio::test]
    async fn test_last_connection_leaving_records_leave_time() {
        let f = fixture();
        let room = scheduled(&f).await;
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        {
            let mut guard = f.registry.lock(room.code, &f.student).await.unwrap();
            f.registry.join_locked(&mut guard, &f.student).await.unwrap();
            for conn_id in [first, second] {
                let _rx = guard
                    .subscribe(Subscriber {
                        conn_id,
                        user_id: f.student.user_id,
                        display_name: "Student".into(),
                    })
                    .await;
            }
        }

        assert!(f.registry.leave(room.code, first).await);
        let still_present = f.registry.resolve_by_code(room.code).await.unwrap();
        assert_eq!(still_present.student_left_at, None);

        assert!(f.registry.leave(room.code, second).await);
        let stored = f.store.load_room(room.code).unwrap().unwrap();
        assert!(stored.student_left_at.is_some());

        let rejoined = f.registry.join(room.code, &f.student).await.unwrap();
        assert_eq!(rejoined.student_left_at, None);
    }

    /// Store that cannot currently load one particular room.
    struct FlakyLoadStore {
        inner: MemoryStore,
        flaky: RoomCode,
    }

    impl RoomStore for FlakyLoadStore {
        fn save_room(&self, room: &Room) -> Result<(), StoreError> {
            self.inner.save_room(room)
        }
        fn load_room(&self, code: RoomCode) -> Result<Option<Room>, StoreError> {
            if code == self.flaky {
                return Err(StoreError::Unavailable("replica catching up".into()));
            }
            self.inner.load_room(code)
        }
        fn list_rooms(&self) -> Result<Vec<RoomCode>, StoreError> {
            self.inner.list_rooms()
        }
        fn append_chat(&self, m: &crate::chat::ChatMessage) -> Result<(), StoreError> {
            self.inner.append_chat(m)
        }
        fn chat_before(
            &self,
            code: RoomCode,
            before: Stamp,
            limit: usize,
        ) -> Result<Vec<crate::chat::ChatMessage>, StoreError> {
            self.inner.chat_before(code, before, limit)
        }
        fn append_board(&self, code: RoomCode, r: &crate::whiteboard::BoardRecord) -> Result<(), StoreError> {
            self.inner.append_board(code, r)
        }
        fn load_board(&self, code: RoomCode) -> Result<Vec<crate::whiteboard::BoardRecord>, StoreError> {
            self.inner.load_board(code)
        }
        fn latest_stamp(&self, code: RoomCode) -> Result<Stamp, StoreError> {
            self.inner.latest_stamp(code)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_room_load_does_not_block_other_rooms() {
        let tutor = Principal::new(Uuid::new_v4(), "Tutor");
        let student = Principal::new(Uuid::new_v4(), "Student");
        let warm = Room::scheduled(RoomCode::generate(), tutor.user_id, student.user_id, 1, 2);
        let cold = Room::scheduled(RoomCode::generate(), tutor.user_id, student.user_id, 1, 2);
        let inner = MemoryStore::new();
        inner.save_room(&warm).unwrap();
        inner.save_room(&cold).unwrap();

        let lock_timeout = Duration::from_millis(100);
        let registry = Arc::new(RoomRegistry::new(
            Arc::new(FlakyLoadStore { inner, flaky: cold.code }),
            Arc::new(Hub::new(8)),
            RegistryConfig {
                lock_timeout,
                retry: RetryPolicy {
                    attempts: 3,
                    backoff: Duration::from_secs(1),
                },
            },
        ));
        registry.join(warm.code, &tutor).await.unwrap();

        let loading = tokio::spawn({
            let registry = Arc::clone(&registry);
            let student = student.clone();
            async move { registry.join(cold.code, &student).await }
        });
        // Let the cold load start and park in its retry backoff
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        registry.join(warm.code, &student).await.unwrap();
        assert!(started.elapsed() < lock_timeout);

        // The cold room gives up after lock_timeout, not after every retry
        let started = tokio::time::Instant::now();
        assert!(matches!(loading.await.unwrap(), Err(RoomError::Busy(_))));
        assert!(started.elapsed() <= lock_timeout);

        // The abandoned load leaves nothing behind
        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.live.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_rooms_lock_independently() {
        let f = fixture();
        let a = scheduled(&f).await;
        let b = scheduled(&f).await;
        let _held = f.registry.lock(a.code, &f.tutor).await.unwrap();
        let joined = f.registry.join(b.code, &f.student).await.unwrap();
        assert_eq!(joined.status, RoomStatus::Active);
    }

    /// Store whose writes always fail permanently.
    struct BrokenStore(MemoryStore);

    impl RoomStore for BrokenStore {
        fn save_room(&self, _: &Room) -> Result<(), StoreError> {
            Err(StoreError::SerializationError("refused".into()))
        }
        fn load_room(&self, code: RoomCode) -> Result<Option<Room>, StoreError> {
            self.0.load_room(code)
        }
        fn list_rooms(&self) -> Result<Vec<RoomCode>, StoreError> {
            self.0.list_rooms()
        }
        fn append_chat(&self, m: &crate::chat::ChatMessage) -> Result<(), StoreError> {
            self.0.append_chat(m)
        }
        fn chat_before(
            &self,
            code: RoomCode,
            before: Stamp,
            limit: usize,
        ) -> Result<Vec<crate::chat::ChatMessage>, StoreError> {
            self.0.chat_before(code, before, limit)
        }
        fn append_board(&self, code: RoomCode, r: &crate::whiteboard::BoardRecord) -> Result<(), StoreError> {
            self.0.append_board(code, r)
        }
        fn load_board(&self, code: RoomCode) -> Result<Vec<crate::whiteboard::BoardRecord>, StoreError> {
            self.0.load_board(code)
        }
        fn latest_stamp(&self, code: RoomCode) -> Result<Stamp, StoreError> {
            self.0.latest_stamp(code)
        }
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_room_unchanged() {
        let inner = MemoryStore::new();
        let tutor = Principal::new(Uuid::new_v4(), "Tutor");
        let room = Room::scheduled(RoomCode::generate(), tutor.user_id, Uuid::new_v4(), 1, 2);
        inner.save_room(&room).unwrap();

        let registry = RoomRegistry::new(
            Arc::new(BrokenStore(inner)),
            Arc::new(Hub::new(8)),
            RegistryConfig::default(),
        );
        assert!(matches!(registry.join(room.code, &tutor).await, Err(RoomError::Storage(_))));
        assert_eq!(registry.resolve_by_code(room.code).await.unwrap().status, RoomStatus::Scheduled);
    }
}
