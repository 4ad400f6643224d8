//! Read-only recommender. Ranks live rooms for a user and pending applicants
//! for a creator with heuristic 0-100+ scores. Every output carries the
//! reason strings behind the number, because the UI surfaces explanations,
//! not ranks. Never mutates state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;

use crate::clock::TimeSource;
use crate::config::Config;
use crate::error::CoreResult;
use crate::store::{self, Store};
use crate::types::{ApplicationStatus, Room, RoomType};

#[derive(Debug, Clone)]
pub struct RoomMatch {
    pub room_id: String,
    pub title: String,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApplicantMatch {
    pub application_id: String,
    pub user_id: String,
    pub score: f64,
    pub reasons: Vec<String>,
}

pub struct MatchEngine {
    store: Arc<Store>,
    clock: Arc<dyn TimeSource>,
    cfg: Config,
}

impl MatchEngine {
    pub fn new(store: Arc<Store>, clock: Arc<dyn TimeSource>, cfg: Config) -> Self {
        Self { store, clock, cfg }
    }

    /// Rank live rooms for a user. `available_keys` is the caller-verified
    /// balance; rooms the user cannot afford still appear, ranked low, with
    /// the reason attached rather than being filtered out.
    pub fn recommend_rooms(
        &self,
        user_id: &str,
        available_keys: u64,
        limit: usize,
    ) -> CoreResult<Vec<RoomMatch>> {
        let now = self.clock.now();
        let (rooms, history, user_score) = self.store.read(|conn| {
            let rooms = store::list_live_rooms(conn)?;
            let history = store::list_applications_by_user(conn, user_id)?;
            let user_score = store::get_score(conn, user_id)?
                .map(|s| s.current_score)
                .unwrap_or(0);
            Ok((rooms, history, user_score))
        })?;

        let mut applied_rooms: HashSet<String> = HashSet::new();
        let mut type_counts: HashMap<RoomType, u32> = HashMap::new();
        for app in &history {
            if app.status != ApplicationStatus::Withdrawn {
                applied_rooms.insert(app.room_id.clone());
            }
            if let Ok(Some(room)) = self.store.read(|conn| store::get_room(conn, &app.room_id)) {
                *type_counts.entry(room.room_type).or_insert(0) += 1;
            }
        }

        let mut matches = Vec::new();
        for room in rooms {
            if room.creator_id == user_id || applied_rooms.contains(&room.id) {
                continue;
            }
            let mut score = 50.0;
            let mut reasons = Vec::new();

            // Room reputation, capped so one hot room cannot dominate.
            let rep = (room.motion_score.min(30)) as f64 * 0.5;
            if rep > 0.0 {
                score += rep;
                reasons.push("active, well-regarded room".to_string());
            }

            let (barrier, barrier_reason) = barrier_alignment(&room, user_score);
            score += barrier;
            if let Some(reason) = barrier_reason {
                reasons.push(reason);
            }

            // Hard penalty, not a hard filter.
            let needed = room.min_keys + self.cfg.entry_deposit;
            if available_keys < needed {
                score -= 40.0;
                reasons.push(format!(
                    "needs {} keys, you have {}",
                    needed, available_keys
                ));
            }

            match type_counts.get(&room.room_type).copied().unwrap_or(0) {
                0 => {
                    score += 5.0;
                    reasons.push(format!("first {} room for you", room.room_type.as_str()));
                }
                n => {
                    let bonus = (n.min(5)) as f64 * 3.0;
                    score += bonus;
                    reasons.push(format!(
                        "you've joined {} {} room(s)",
                        n,
                        room.room_type.as_str()
                    ));
                }
            }

            if let Some(max) = room.max_slots {
                let remaining = max.saturating_sub(room.filled_slots);
                if remaining > 0 && remaining <= 2 {
                    score += 8.0;
                    reasons.push(format!("only {} slot(s) left", remaining));
                }
            }

            if now - room.created_at <= Duration::hours(self.cfg.freshness_window_hours) {
                score += 6.0;
                reasons.push("just posted".to_string());
            }

            matches.push(RoomMatch {
                room_id: room.id.clone(),
                title: room.title.clone(),
                score: score.max(0.0),
                reasons,
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.room_id.cmp(&b.room_id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Rank a room's pending applicants for its creator. Weighted toward
    /// stake ratio and reputation, then queue position and message quality.
    pub fn rank_applicants(&self, room_id: &str) -> CoreResult<Vec<ApplicantMatch>> {
        let now = self.clock.now();
        let (room, apps) = self.store.read(|conn| {
            let room = store::require_room(conn, room_id)?;
            let apps = store::list_pending_for_room(conn, room_id)?;
            Ok((room, apps))
        })?;

        let mut matches = Vec::new();
        for app in &apps {
            let mut score = 0.0;
            let mut reasons = Vec::new();

            let floor = room.min_keys.max(1) as f64;
            let ratio = (app.keys_staked as f64 / floor).min(3.0);
            score += ratio * 10.0;
            if ratio >= 2.0 {
                reasons.push(format!("staked {}x the entry bar", ratio as u32));
            } else {
                reasons.push(format!("{} keys staked", app.keys_staked));
            }

            let rep = app.motion_at_apply as f64 * 0.3;
            score += rep;
            if app.motion_at_apply >= 50 {
                reasons.push("high motion score".to_string());
            }

            score += app.priority_score * 0.1;

            score += message_quality(&app.message, &mut reasons);

            if let Some(last) = app.last_active_at {
                if now - last <= Duration::hours(24) {
                    score += 5.0;
                    reasons.push("active in the last 24h".to_string());
                }
            }

            matches.push(ApplicantMatch {
                application_id: app.id.clone(),
                user_id: app.user_id.clone(),
                score,
                reasons,
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.application_id.cmp(&b.application_id))
        });
        Ok(matches)
    }
}

/// Three-tier alignment between a user's reputation and the room's key
/// barrier: open rooms slightly favor newer users, high-barrier rooms favor
/// proven ones, medium rooms favor a middle band.
fn barrier_alignment(room: &Room, user_score: u32) -> (f64, Option<String>) {
    if room.min_keys == 0 {
        if user_score < 20 {
            (10.0, Some("open room, good for getting started".to_string()))
        } else {
            (3.0, None)
        }
    } else if room.min_keys >= 50 {
        if user_score >= 60 {
            (15.0, Some("high-stakes room matches your track record".to_string()))
        } else {
            (0.0, None)
        }
    } else if (20..=60).contains(&user_score) {
        (12.0, Some("barrier fits your reputation band".to_string()))
    } else {
        (4.0, None)
    }
}

fn message_quality(message: &str, reasons: &mut Vec<String>) -> f64 {
    let trimmed = message.trim();
    if trimmed.len() >= 100 {
        reasons.push("detailed pitch".to_string());
        8.0
    } else if trimmed.len() >= 20 {
        5.0
    } else {
        0.0
    }
}
