//! Shared whiteboard: an append log of strokes plus tombstones.
//!
//! ```text
//!   Add(stroke@s)          visible(stroke) ⇔ no DeleteStroke(id)@t  with t > s
//!   DeleteStroke(id)@t                     ∧ no ClearUser(owner)@t with t > s
//!   ClearUser(user)@t
//! ```
//!
//! [`Board`] only keeps the latest tombstone stamp per id and per user, so
//! records can be applied in any order and every replica converges on the
//! same visible set. Tombstones are never compacted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{RoomError, RoomResult};
use crate::protocol::RoomEvent;
use crate::registry::RoomRegistry;
use crate::room::{ConnId, Principal, RoomCode, Stamp, UserId};

/// One whiteboard stroke. The payload is opaque to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stroke {
    pub room: RoomCode,
    /// Client-generated, unique per room
    pub stroke_id: Uuid,
    pub owner: UserId,
    pub payload: Vec<u8>,
    pub stamp: Stamp,
}

/// An entry of a room's whiteboard log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardRecord {
    Add(Stroke),
    DeleteStroke {
        stroke_id: Uuid,
        by: UserId,
        stamp: Stamp,
    },
    ClearUser {
        user_id: UserId,
        by: UserId,
        stamp: Stamp,
    },
}

impl BoardRecord {
    pub fn stamp(&self) -> Stamp {
        match self {
            BoardRecord::Add(stroke) => stroke.stamp,
            BoardRecord::DeleteStroke { stamp, .. } | BoardRecord::ClearUser { stamp, .. } => *stamp,
        }
    }
}

/// Reconciled whiteboard state.
#[derive(Debug, Clone, Default)]
pub struct Board {
    strokes: HashMap<Uuid, Stroke>,
    /// Latest by-id tombstone
    deleted: HashMap<Uuid, Stamp>,
    /// Latest by-owner tombstone
    cleared: HashMap<UserId, Stamp>,
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: &[BoardRecord]) -> Self {
        let mut board = Self::new();
        for record in records {
            board.apply(record);
        }
        board
    }

    /// Merge one record. Returns false when it was already known.
    ///
    /// Two adds with the same id keep the earlier stamp, so the outcome does
    /// not depend on arrival order.
    pub fn apply(&mut self, record: &BoardRecord) -> bool {
        match record {
            BoardRecord::Add(stroke) => match self.strokes.get(&stroke.stroke_id) {
                Some(existing) if existing.stamp <= stroke.stamp => false,
                _ => {
                    self.strokes.insert(stroke.stroke_id, stroke.clone());
                    true
                }
            },
            BoardRecord::DeleteStroke { stroke_id, stamp, .. } => {
                Self::raise(self.deleted.entry(*stroke_id).or_insert(Stamp::ZERO), *stamp)
            }
            BoardRecord::ClearUser { user_id, stamp, .. } => {
                Self::raise(self.cleared.entry(*user_id).or_insert(Stamp::ZERO), *stamp)
            }
        }
    }

    fn raise(slot: &mut Stamp, stamp: Stamp) -> bool {
        if stamp > *slot {
            *slot = stamp;
            true
        } else {
            false
        }
    }

    pub fn get(&self, stroke_id: &Uuid) -> Option<&Stroke> {
        self.strokes.get(stroke_id)
    }

    pub fn is_visible(&self, stroke: &Stroke) -> bool {
        let deleted = self
            .deleted
            .get(&stroke.stroke_id)
            .is_some_and(|t| *t > stroke.stamp);
        let cleared = self.cleared.get(&stroke.owner).is_some_and(|t| *t > stroke.stamp);
        !(deleted || cleared)
    }

    /// Visible strokes in stamp order.
    pub fn visible(&self) -> Vec<Stroke> {
        let mut strokes: Vec<Stroke> = self
            .strokes
            .values()
            .filter(|s| self.is_visible(s))
            .cloned()
            .collect();
        strokes.sort_by_key(|s| s.stamp);
        strokes
    }

    pub fn visible_count(&self) -> usize {
        self.strokes.values().filter(|s| self.is_visible(s)).count()
    }

    pub fn has_visible_from(&self, owner: UserId) -> bool {
        self.strokes
            .values()
            .any(|s| s.owner == owner && self.is_visible(s))
    }

    pub fn tombstone_count(&self) -> usize {
        self.deleted.len() + self.cleared.len()
    }
}

/// Outcome of a whiteboard mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrokeAck {
    pub stroke_id: Uuid,
    /// False when the request changed nothing and was not broadcast
    pub applied: bool,
    pub stamp: Stamp,
}

/// Room-scoped whiteboard operations.
pub struct WhiteboardSync {
    registry: Arc<RoomRegistry>,
    max_payload: usize,
}

impl WhiteboardSync {
    pub fn new(registry: Arc<RoomRegistry>, max_payload: usize) -> Self {
        Self {
            registry,
            max_payload,
        }
    }

    /// Record a stroke. A duplicate id is acknowledged with its first stamp.
    pub async fn add_stroke(
        &self,
        code: RoomCode,
        principal: &Principal,
        stroke_id: Uuid,
        payload: Vec<u8>,
        origin: Option<ConnId>,
    ) -> RoomResult<StrokeAck> {
        let mut guard = self.registry.lock_active(code, principal).await?;
        self.check_payload(&payload)?;
        if let Some(existing) = guard.board().get(&stroke_id) {
            log::debug!("Room {code}: duplicate stroke {stroke_id} ignored");
            return Ok(StrokeAck {
                stroke_id,
                applied: false,
                stamp: existing.stamp,
            });
        }

        let stroke = Stroke {
            room: code,
            stroke_id,
            owner: principal.user_id,
            payload,
            stamp: guard.next_stamp(),
        };
        let record = BoardRecord::Add(stroke.clone());
        self.persist(code, &record).await?;
        guard.board_mut().apply(&record);

        let stamp = stroke.stamp;
        guard.broadcast(RoomEvent::StrokeAdded(stroke), origin).await;
        Ok(StrokeAck {
            stroke_id,
            applied: true,
            stamp,
        })
    }

    /// Tombstone a stroke by id. Deleting a hidden stroke is a no-op.
    pub async fn delete_stroke(
        &self,
        code: RoomCode,
        principal: &Principal,
        stroke_id: Uuid,
        origin: Option<ConnId>,
    ) -> RoomResult<StrokeAck> {
        let mut guard = self.registry.lock_active(code, principal).await?;
        if let Some(existing) = guard.board().get(&stroke_id) {
            if !guard.board().is_visible(existing) {
                return Ok(StrokeAck {
                    stroke_id,
                    applied: false,
                    stamp: existing.stamp,
                });
            }
        }

        let stamp = guard.next_stamp();
        let record = BoardRecord::DeleteStroke {
            stroke_id,
            by: principal.user_id,
            stamp,
        };
        self.persist(code, &record).await?;
        guard.board_mut().apply(&record);

        guard
            .broadcast(
                RoomEvent::StrokeDeleted {
                    stroke_id,
                    by: principal.user_id,
                    stamp,
                },
                origin,
            )
            .await;
        Ok(StrokeAck {
            stroke_id,
            applied: true,
            stamp,
        })
    }

    /// Hide every stroke of `target` drawn so far. Only self-clear is allowed.
    pub async fn clear_user(
        &self,
        code: RoomCode,
        principal: &Principal,
        target: UserId,
        origin: Option<ConnId>,
    ) -> RoomResult<Option<Stamp>> {
        let mut guard = self.registry.lock_active(code, principal).await?;
        if target != principal.user_id {
            return Err(RoomError::AccessDenied(code));
        }
        if !guard.board().has_visible_from(target) {
            return Ok(None);
        }

        let stamp = guard.next_stamp();
        let record = BoardRecord::ClearUser {
            user_id: target,
            by: principal.user_id,
            stamp,
        };
        self.persist(code, &record).await?;
        guard.board_mut().apply(&record);

        guard
            .broadcast(RoomEvent::UserCleared { user_id: target, stamp }, origin)
            .await;
        log::debug!("Room {code}: strokes of {target} cleared");
        Ok(Some(stamp))
    }

    /// Relay an in-progress drawing batch to the other subscribers.
    ///
    /// Nothing is stamped or stored; the finished stroke arrives later
    /// through [`add_stroke`](Self::add_stroke).
    pub async fn stream_delta(
        &self,
        code: RoomCode,
        principal: &Principal,
        stroke_id: Uuid,
        points: Vec<u8>,
        origin: Option<ConnId>,
    ) -> RoomResult<()> {
        let guard = self.registry.lock_active(code, principal).await?;
        self.check_payload(&points)?;
        guard
            .broadcast(
                RoomEvent::StrokeDelta {
                    user_id: principal.user_id,
                    stroke_id,
                    points,
                },
                origin,
            )
            .await;
        Ok(())
    }

    /// Visible strokes in stamp order.
    pub async fn snapshot(&self, code: RoomCode, principal: &Principal) -> RoomResult<Vec<Stroke>> {
        let guard = self.registry.lock(code, principal).await?;
        Ok(guard.board().visible())
    }

    fn check_payload(&self, payload: &[u8]) -> RoomResult<()> {
        if payload.len() > self.max_payload {
            return Err(RoomError::Validation(format!(
                "stroke payload exceeds {} bytes",
                self.max_payload
            )));
        }
        Ok(())
    }

    async fn persist(&self, code: RoomCode, record: &BoardRecord) -> RoomResult<()> {
        let store = self.registry.store();
        self.registry
            .retry()
            .run("append board record", || store.append_board(code, record))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{Hub, Subscriber};
    use crate::protocol::ServerFrame;
    use crate::registry::RegistryConfig;
    use crate::storage::{MemoryStore, RoomStore};

    fn stroke(owner: UserId, millis: u64, seq: u64) -> Stroke {
        Stroke {
            room: RoomCode::from_uuid(Uuid::nil()),
            stroke_id: Uuid::new_v4(),
            owner,
            payload: vec![1],
            stamp: Stamp::new(millis, seq),
        }
    }

    #[test]
    fn test_delete_hides_earlier_add_only() {
        let owner = Uuid::new_v4();
        let early = stroke(owner, 1, 1);
        let mut board = Board::new();
        board.apply(&BoardRecord::Add(early.clone()));
        board.apply(&BoardRecord::DeleteStroke {
            stroke_id: early.stroke_id,
            by: owner,
            stamp: Stamp::new(2, 2),
        });
        assert!(board.visible().is_empty());

        let mut board = Board::new();
        let late = Stroke {
            stamp: Stamp::new(3, 3),
            ..early.clone()
        };
        board.apply(&BoardRecord::DeleteStroke {
            stroke_id: early.stroke_id,
            by: owner,
            stamp: Stamp::new(2, 2),
        });
        board.apply(&BoardRecord::Add(late.clone()));
        assert_eq!(board.visible(), vec![late]);
    }

    #[test]
    fn test_clear_user_scoped_to_owner_and_time() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let a1 = stroke(alice, 1, 1);
        let b1 = stroke(bob, 1, 2);
        let a2 = stroke(alice, 5, 4);

        let board = Board::from_records(&[
            BoardRecord::Add(a1),
            BoardRecord::Add(b1.clone()),
            BoardRecord::ClearUser {
                user_id: alice,
                by: alice,
                stamp: Stamp::new(2, 3),
            },
            BoardRecord::Add(a2.clone()),
        ]);
        assert_eq!(board.visible(), vec![b1, a2]);
        assert_eq!(board.tombstone_count(), 1);
    }

    #[test]
    fn test_replicas_converge_in_any_order() {
        let alice = Uuid::new_v4();
        let s1 = stroke(alice, 1, 1);
        let s2 = stroke(alice, 1, 2);
        let s3 = stroke(Uuid::new_v4(), 1, 3);
        let records = vec![
            BoardRecord::Add(s1.clone()),
            BoardRecord::Add(s2.clone()),
            BoardRecord::DeleteStroke {
                stroke_id: s1.stroke_id,
                by: alice,
                stamp: Stamp::new(1, 4),
            },
            BoardRecord::Add(s3.clone()),
            BoardRecord::ClearUser {
                user_id: alice,
                by: alice,
                stamp: Stamp::new(1, 5),
            },
            BoardRecord::Add(s2.clone()),
        ];
        let forward = Board::from_records(&records);
        let mut reversed_records = records.clone();
        reversed_records.reverse();
        let reversed = Board::from_records(&reversed_records);
        let mut rotated_records = records.clone();
        rotated_records.rotate_left(3);
        let rotated = Board::from_records(&rotated_records);

        assert_eq!(forward.visible(), vec![s3]);
        assert_eq!(forward.visible(), reversed.visible());
        assert_eq!(forward.visible(), rotated.visible());
    }

    struct Fixture {
        sync: WhiteboardSync,
        registry: Arc<RoomRegistry>,
        store: Arc<MemoryStore>,
        code: RoomCode,
        tutor: Principal,
        student: Principal,
    }

    async fn active_room() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(RoomRegistry::new(
            store.clone(),
            Arc::new(Hub::new(64)),
            RegistryConfig::default(),
        ));
        let tutor = Principal::new(Uuid::new_v4(), "Tutor");
        let student = Principal::new(Uuid::new_v4(), "Student");
        let room = registry
            .create_room(tutor.user_id, student.user_id, 0, 1)
            .await
            .unwrap();
        registry.join(room.code, &tutor).await.unwrap();
        Fixture {
            sync: WhiteboardSync::new(registry.clone(), 64 * 1024),
            registry,
            store,
            code: room.code,
            tutor,
            student,
        }
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop() {
        let f = active_room().await;
        let id = Uuid::new_v4();
        let first = f.sync.add_stroke(f.code, &f.tutor, id, vec![1], None).await.unwrap();
        let again = f.sync.add_stroke(f.code, &f.tutor, id, vec![2], None).await.unwrap();
        assert!(first.applied);
        assert!(!again.applied);
        assert_eq!(again.stamp, first.stamp);

        let snapshot = f.sync.snapshot(f.code, &f.student).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].payload, vec![1]);
        assert_eq!(f.store.load_board(f.code).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = active_room().await;
        let id = Uuid::new_v4();
        f.sync.add_stroke(f.code, &f.tutor, id, vec![1], None).await.unwrap();

        let first = f.sync.delete_stroke(f.code, &f.student, id, None).await.unwrap();
        let again = f.sync.delete_stroke(f.code, &f.student, id, None).await.unwrap();
        assert!(first.applied);
        assert!(!again.applied);
        assert!(f.sync.snapshot(f.code, &f.tutor).await.unwrap().is_empty());

        // Unknown ids still get a tombstone
        let ghost = f.sync.delete_stroke(f.code, &f.tutor, Uuid::new_v4(), None).await.unwrap();
        assert!(ghost.applied);
    }

    #[tokio::test]
    async fn test_clear_user_is_self_only() {
        let f = active_room().await;
        f.sync.add_stroke(f.code, &f.tutor, Uuid::new_v4(), vec![1], None).await.unwrap();
        f.sync.add_stroke(f.code, &f.student, Uuid::new_v4(), vec![2], None).await.unwrap();

        let err = f
            .sync
            .clear_user(f.code, &f.student, f.tutor.user_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::AccessDenied(_)));

        let stamp = f.sync.clear_user(f.code, &f.tutor, f.tutor.user_id, None).await.unwrap();
        assert!(stamp.is_some());
        let snapshot = f.sync.snapshot(f.code, &f.tutor).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].owner, f.student.user_id);

        assert_eq!(f.sync.clear_user(f.code, &f.tutor, f.tutor.user_id, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stranger_cannot_draw() {
        let f = active_room().await;
        let stranger = Principal::new(Uuid::new_v4(), "Mallory");
        let err = f
            .sync
            .add_stroke(f.code, &stranger, Uuid::new_v4(), vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let f = active_room().await;
        let err = f
            .sync
            .add_stroke(f.code, &f.tutor, Uuid::new_v4(), vec![0; 64 * 1024 + 1], None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Validation(_)));
    }

    #[tokio::test]
    async fn test_mutation_broadcasts_event() {
        let f = active_room().await;
        let guard = f.registry.lock(f.code, &f.student).await.unwrap();
        let mut rx = guard
            .subscribe(Subscriber {
                conn_id: Uuid::new_v4(),
                user_id: f.student.user_id,
                display_name: "Student".into(),
            })
            .await;
        drop(guard);

        let id = Uuid::new_v4();
        f.sync.add_stroke(f.code, &f.tutor, id, vec![9], None).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        match ServerFrame::decode(&envelope.encoded).unwrap() {
            ServerFrame::Event {
                event: RoomEvent::StrokeAdded(stroke),
                ..
            } => assert_eq!(stroke.stroke_id, id),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delta_is_relayed_but_not_stored() {
        let f = active_room().await;
        let guard = f.registry.lock(f.code, &f.student).await.unwrap();
        let mut rx = guard
            .subscribe(Subscriber {
                conn_id: Uuid::new_v4(),
                user_id: f.student.user_id,
                display_name: "Student".into(),
            })
            .await;
        drop(guard);

        let id = Uuid::new_v4();
        f.sync
            .stream_delta(f.code, &f.tutor, id, vec![1, 2, 3], None)
            .await
            .unwrap();
        let envelope = rx.recv().await.unwrap();
        match ServerFrame::decode(&envelope.encoded).unwrap() {
            ServerFrame::Event {
                event: RoomEvent::StrokeDelta { stroke_id, points, .. },
                ..
            } => {
                assert_eq!(stroke_id, id);
                assert_eq!(points, vec![1, 2, 3]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(f.store.load_board(f.code).unwrap().is_empty());
        assert!(f.sync.snapshot(f.code, &f.tutor).await.unwrap().is_empty());

        let stranger = Principal::new(Uuid::new_v4(), "Mallory");
        assert!(matches!(
            f.sync.stream_delta(f.code, &stranger, id, vec![1], None).await,
            Err(RoomError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_board_survives_reload() {
        let f = active_room().await;
        let keep = Uuid::new_v4();
        let drop_id = Uuid::new_v4();
        f.sync.add_stroke(f.code, &f.tutor, keep, vec![1], None).await.unwrap();
        f.sync.add_stroke(f.code, &f.tutor, drop_id, vec![2], None).await.unwrap();
        f.sync.delete_stroke(f.code, &f.tutor, drop_id, None).await.unwrap();

        f.registry.evict_idle().await;
        let snapshot = f.sync.snapshot(f.code, &f.tutor).await.unwrap();
        let ids: Vec<Uuid> = snapshot.iter().map(|s| s.stroke_id).collect();
        assert_eq!(ids, vec![keep]);
    }
}
