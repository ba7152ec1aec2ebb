//! Room records, participants and the per-room ordering stamp.
//!
//! A [`Room`] moves through `Scheduled → Active → Ended` and is never
//! deleted. Every chat message and whiteboard record accepted by a room
//! carries a [`Stamp`], which totally orders them within that room.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

/// Identity of a user as supplied by the identity collaborator.
pub type UserId = Uuid;

/// Identity of a single WebSocket connection.
pub type ConnId = Uuid;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Opaque, unguessable room code (random v4 UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomCode(Uuid);

impl RoomCode {
    /// Generate a fresh random code.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Raw 16-byte form, used as a storage key prefix.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RoomCode {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Room lifecycle status. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Scheduled,
    Active,
    Ended,
}

/// Which seat a participant occupies in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Tutor,
    Student,
}

/// An authenticated user, as resolved from a connection's token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub display_name: String,
}

impl Principal {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// A scheduled one-to-one lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub code: RoomCode,
    pub tutor_id: UserId,
    pub student_id: UserId,
    /// Scheduled start (ms since epoch)
    pub scheduled_start: u64,
    /// Scheduled end (ms since epoch), always after `scheduled_start`
    pub scheduled_end: u64,
    pub status: RoomStatus,
    pub actual_start: Option<u64>,
    pub actual_end: Option<u64>,
    pub tutor_joined_at: Option<u64>,
    pub student_joined_at: Option<u64>,
    /// Set when the participant's last connection leaves, cleared on rejoin
    pub tutor_left_at: Option<u64>,
    pub student_left_at: Option<u64>,
    /// Minutes both participants were present, set when the room ends
    pub duration_minutes: u32,
}

impl Room {
    /// A freshly scheduled room. Callers validate the schedule first.
    pub fn scheduled(
        code: RoomCode,
        tutor_id: UserId,
        student_id: UserId,
        scheduled_start: u64,
        scheduled_end: u64,
    ) -> Self {
        Self {
            code,
            tutor_id,
            student_id,
            scheduled_start,
            scheduled_end,
            status: RoomStatus::Scheduled,
            actual_start: None,
            actual_end: None,
            tutor_joined_at: None,
            student_joined_at: None,
            tutor_left_at: None,
            student_left_at: None,
            duration_minutes: 0,
        }
    }

    pub fn role_of(&self, user_id: UserId) -> Option<Role> {
        if user_id == self.tutor_id {
            Some(Role::Tutor)
        } else if user_id == self.student_id {
            Some(Role::Student)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.role_of(user_id).is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.status == RoomStatus::Ended
    }

    /// `Scheduled → Active`. Returns false if the room was not scheduled.
    pub fn activate(&mut self, now: u64) -> bool {
        if self.status != RoomStatus::Scheduled {
            return false;
        }
        self.status = RoomStatus::Active;
        self.actual_start = Some(now);
        true
    }

    /// Join and leave stamps of one participant.
    fn presence_mut(&mut self, user_id: UserId) -> Option<(&mut Option<u64>, &mut Option<u64>)> {
        match self.role_of(user_id)? {
            Role::Tutor => Some((&mut self.tutor_joined_at, &mut self.tutor_left_at)),
            Role::Student => Some((&mut self.student_joined_at, &mut self.student_left_at)),
        }
    }

    /// Record a join: stamps the first join and clears an earlier leave.
    /// Returns true if the record changed.
    pub fn record_join(&mut self, user_id: UserId, now: u64) -> bool {
        let Some((joined, left)) = self.presence_mut(user_id) else {
            return false;
        };
        let mut changed = left.take().is_some();
        if joined.is_none() {
            *joined = Some(now);
            changed = true;
        }
        changed
    }

    /// Record that a participant is no longer present. Returns true if the
    /// record changed; ended rooms and absent participants are left alone.
    pub fn record_leave(&mut self, user_id: UserId, now: u64) -> bool {
        if self.is_ended() {
            return false;
        }
        let Some((joined, left)) = self.presence_mut(user_id) else {
            return false;
        };
        if joined.is_none() || left.is_some() {
            return false;
        }
        *left = Some(now);
        true
    }

    /// Move to `Ended`, stamping the end and the shared-presence duration.
    /// Returns false (and changes nothing) if already ended.
    ///
    /// Participants still present leave at `now`. The duration runs from
    /// the later first join to the earlier leave.
    pub fn finish(&mut self, now: u64) -> bool {
        if self.is_ended() {
            return false;
        }
        self.status = RoomStatus::Ended;
        self.actual_end = Some(now);
        if self.tutor_joined_at.is_some() {
            self.tutor_left_at.get_or_insert(now);
        }
        if self.student_joined_at.is_some() {
            self.student_left_at.get_or_insert(now);
        }
        self.duration_minutes = match (
            self.tutor_joined_at,
            self.student_joined_at,
            self.tutor_left_at,
            self.student_left_at,
        ) {
            (Some(tj), Some(sj), Some(tl), Some(sl)) => {
                (tl.min(sl).saturating_sub(tj.max(sj)) / 60_000) as u32
            }
            _ => 0,
        };
        true
    }
}

/// Server-assigned ordering key: wall-clock millis plus a per-room sequence.
///
/// Derived `Ord` compares `millis` first, then `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Stamp {
    pub millis: u64,
    pub seq: u64,
}

impl Stamp {
    pub const ZERO: Stamp = Stamp { millis: 0, seq: 0 };
    pub const MAX: Stamp = Stamp {
        millis: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Big-endian encoding; byte order matches `Ord`.
    pub fn to_be_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.millis.to_be_bytes());
        out[8..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let mut millis = [0u8; 8];
        let mut seq = [0u8; 8];
        millis.copy_from_slice(&bytes[..8]);
        seq.copy_from_slice(&bytes[8..]);
        Some(Self {
            millis: u64::from_be_bytes(millis),
            seq: u64::from_be_bytes(seq),
        })
    }
}

/// Issues strictly increasing stamps for one room.
///
/// Wall-clock regressions are clamped so `millis` never goes backwards.
#[derive(Debug, Clone, Default)]
pub struct StampClock {
    last: Stamp,
}

impl StampClock {
    /// Resume after the newest stamp already recorded for the room.
    pub fn starting_after(last: Stamp) -> Self {
        Self { last }
    }

    pub fn next(&mut self, now_millis: u64) -> Stamp {
        let stamp = Stamp {
            millis: now_millis.max(self.last.millis),
            seq: self.last.seq + 1,
        };
        self.last = stamp;
        stamp
    }
}
