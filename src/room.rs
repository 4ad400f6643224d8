//! Room lifecycle.
//!
//! ```text
//! open --(applicant_count >= threshold)--> hot
//! open|hot --(<= closing window remains)-> closing
//! any non-terminal --(now >= end_time)--> closed
//! closed --(explicit admin action)------> archived
//! ```
//!
//! Transitions are forward-only; `next_status` is pure so the sweep and the
//! tests share one source of truth. When the hot threshold and the closing
//! window both apply to an open room, hot wins, so the room keeps its one
//! shot at an extension.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::clock::TimeSource;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::logging::{json_log, obj, v_str, Domain};
use crate::motion::MotionEngine;
use crate::store::{self, Store};
use crate::types::{new_id, MotionEventType, Room, RoomDuration, RoomStatus, RoomType};

/// The single forward step the state machine permits right now, if any.
pub fn next_status(room: &Room, now: DateTime<Utc>, cfg: &Config) -> Option<RoomStatus> {
    if room.status.is_terminal() {
        return None;
    }
    if room.is_expired(now) {
        return Some(RoomStatus::Closed);
    }
    let in_closing_window = now >= room.end_time - Duration::hours(cfg.closing_window_hours);
    match room.status {
        // Hot promotion wins over the closing window: a busy room gets its
        // one chance at an extension before the countdown claims it.
        RoomStatus::Open if room.applicant_count >= cfg.hot_applicant_threshold => {
            Some(RoomStatus::Hot)
        }
        RoomStatus::Open | RoomStatus::Hot if in_closing_window => Some(RoomStatus::Closing),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CreateRoom {
    pub room_type: RoomType,
    pub creator_id: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// None = unlimited.
    pub max_slots: Option<u32>,
    pub min_keys: u64,
    pub duration: RoomDuration,
}

pub struct RoomService {
    store: Arc<Store>,
    clock: Arc<dyn TimeSource>,
    motion: Arc<MotionEngine>,
    cfg: Config,
}

impl RoomService {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn TimeSource>,
        motion: Arc<MotionEngine>,
        cfg: Config,
    ) -> Self {
        Self { store, clock, motion, cfg }
    }

    pub fn create_room(&self, req: CreateRoom) -> CoreResult<Room> {
        let now = self.clock.now();
        let creator_motion = self.motion.current_score(&req.creator_id)?;
        let room = Room {
            id: new_id("rm"),
            room_type: req.room_type,
            creator_id: req.creator_id.clone(),
            creator_motion,
            title: req.title,
            description: req.description,
            tags: req.tags,
            max_slots: req.max_slots,
            min_keys: req.min_keys,
            filled_slots: 0,
            applicant_count: 0,
            accepted_count: 0,
            total_keys_locked: 0,
            motion_score: 0,
            status: RoomStatus::Open,
            start_time: now,
            end_time: now + Duration::hours(req.duration.hours()),
            extended: false,
            created_at: now,
        };
        self.store.with_tx(|tx| store::put_room(tx, &room))?;
        // Posting a room is itself a reputation event for the creator. The
        // room is committed, so a logging failure does not fail the create.
        self.motion.record_event_logged(
            MotionEventType::RoomCreated,
            &req.creator_id,
            Some(&room.id),
            None,
            json!({ "room_type": room.room_type.as_str() }),
        );
        json_log(
            Domain::Room,
            "room.created",
            obj(&[
                ("room_id", v_str(&room.id)),
                ("room_type", v_str(room.room_type.as_str())),
                ("creator_id", v_str(&room.creator_id)),
            ]),
        );
        Ok(room)
    }

    /// One-time 24h grace extension, only while the room is hot.
    pub fn extend_room(&self, room_id: &str) -> CoreResult<Room> {
        let room = self.store.with_tx(|tx| {
            let mut room = store::require_room(tx, room_id)?;
            if room.extended {
                return Err(CoreError::AlreadyExtended { id: room_id.to_string() });
            }
            if room.status != RoomStatus::Hot {
                return Err(CoreError::InvalidStateForExtension {
                    id: room_id.to_string(),
                    status: room.status.as_str().to_string(),
                });
            }
            room.end_time += Duration::hours(self.cfg.extension_hours);
            room.extended = true;
            store::put_room(tx, &room)?;
            Ok(room)
        })?;
        json_log(Domain::Room, "room.extended", obj(&[("room_id", v_str(room_id))]));
        Ok(room)
    }

    /// Explicit close. Idempotent: a room already past `closed` is returned
    /// unchanged so sweep retries stay quiet. Settlement is the caller's next
    /// step (see the queue service / orchestrator).
    pub fn close_room(&self, room_id: &str) -> CoreResult<Room> {
        let (room, changed) = self.store.with_tx(|tx| {
            let mut room = store::require_room(tx, room_id)?;
            if room.status.is_terminal() {
                return Ok((room, false));
            }
            room.status = RoomStatus::Closed;
            store::put_room(tx, &room)?;
            Ok((room, true))
        })?;
        if changed {
            json_log(Domain::Room, "room.closed", obj(&[("room_id", v_str(room_id))]));
        }
        Ok(room)
    }

    /// Admin-only archival, the normal end of life after `closed`.
    pub fn archive_room(&self, room_id: &str) -> CoreResult<Room> {
        let room = self.store.with_tx(|tx| {
            let mut room = store::require_room(tx, room_id)?;
            if room.status != RoomStatus::Closed {
                return Err(CoreError::InvalidTransition {
                    id: room_id.to_string(),
                    from: room.status.as_str().to_string(),
                    to: RoomStatus::Archived.as_str().to_string(),
                });
            }
            room.status = RoomStatus::Archived;
            store::put_room(tx, &room)?;
            Ok(room)
        })?;
        json_log(Domain::Room, "room.archived", obj(&[("room_id", v_str(room_id))]));
        Ok(room)
    }

    /// Admin-only physical delete; rooms otherwise live on as archived.
    pub fn delete_room(&self, room_id: &str) -> CoreResult<bool> {
        let deleted = self.store.with_tx(|tx| store::delete_room(tx, room_id))?;
        if deleted {
            json_log(Domain::Room, "room.deleted", obj(&[("room_id", v_str(room_id))]));
        }
        Ok(deleted)
    }

    pub fn get_room(&self, room_id: &str) -> CoreResult<Room> {
        self.store.read(|conn| store::require_room(conn, room_id))
    }

    pub fn list_by_status(&self, statuses: &[RoomStatus]) -> CoreResult<Vec<Room>> {
        self.store.read(|conn| store::list_rooms_by_status(conn, statuses))
    }

    pub fn is_room_full(&self, room_id: &str) -> CoreResult<bool> {
        Ok(self.get_room(room_id)?.is_full())
    }

    pub fn is_room_expired(&self, room_id: &str) -> CoreResult<bool> {
        let now = self.clock.now();
        Ok(self.get_room(room_id)?.is_expired(now))
    }
}
