//! Application queue: staked bids for a room's slots, ordered by priority,
//! adjudicated by the creator and settled when the room closes.
//!
//! Settlement idempotence is keyed on the KeyLock's status, never on the
//! application's boolean flags; the flags are set to match whatever was done
//! to the lock and are healed if a partial failure left them behind.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::clock::TimeSource;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::logging::{json_log, obj, v_int, v_str, Domain};
use crate::motion::MotionEngine;
use crate::notify::{Notifier, NotifyEvent};
use crate::store::{self, Store};
use crate::types::{
    new_id, Activity, Application, ApplicationStatus, LockStatus, MotionEventType,
};
use crate::vault::unlock_in_tx;

// Room-level buzz increments, surfaced by the recommender. Bumped as the
// queue moves, capped at the same ceiling as user scores.
const ROOM_BUZZ_APPLY: u32 = 3;
const ROOM_BUZZ_ACTIVITY: u32 = 1;
const ROOM_BUZZ_ACCEPT: u32 = 5;
const ROOM_BUZZ_CEILING: u32 = 100;

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub room_id: String,
    pub user_id: String,
    pub message: String,
    pub keys_staked: u64,
    pub referral_bonus: u32,
    /// Vault lock covering entry deposit + stake, created before applying.
    pub lock_id: String,
}

/// Outcome counts for one settlement pass over a closed room.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SettlementReport {
    pub refunded: u32,
    pub forfeited: u32,
    /// Applications whose lock had already left `locked`; nothing to do.
    pub already_settled: u32,
}

impl SettlementReport {
    pub fn changed(&self) -> u32 {
        self.refunded + self.forfeited
    }
}

pub struct ApplicationService {
    store: Arc<Store>,
    clock: Arc<dyn TimeSource>,
    motion: Arc<MotionEngine>,
    notifier: Arc<dyn Notifier>,
    cfg: Config,
}

impl ApplicationService {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn TimeSource>,
        motion: Arc<MotionEngine>,
        notifier: Arc<dyn Notifier>,
        cfg: Config,
    ) -> Self {
        Self { store, clock, motion, notifier, cfg }
    }

    fn priority_score(&self, keys_staked: u64, motion: u32, activity_count: u32, referral: u32) -> f64 {
        let w = &self.cfg.priority;
        let activity = activity_count.min(w.activity_cap);
        keys_staked as f64 * w.keys
            + motion as f64 * w.motion
            + activity as f64 * w.activity
            + referral as f64 * w.referral
    }

    /// Submit a bid. The caller must already hold a vault lock for
    /// `entry_deposit + keys_staked`; this service never talks to the balance
    /// oracle itself.
    pub fn apply(&self, req: ApplyRequest) -> CoreResult<Application> {
        let now = self.clock.now();
        let motion_at_apply = self.motion.current_score(&req.user_id)?;
        let required = self.cfg.entry_deposit + req.keys_staked;
        let priority = self.priority_score(req.keys_staked, motion_at_apply, 0, req.referral_bonus);

        let app = self.store.with_tx(|tx| {
            let mut room = store::require_room(tx, &req.room_id)?;
            if room.status.is_terminal() || room.is_expired(now) {
                return Err(CoreError::RoomClosed { id: req.room_id.clone() });
            }
            if req.keys_staked < room.min_keys {
                return Err(CoreError::BelowMinimumStake {
                    staked: req.keys_staked,
                    min_keys: room.min_keys,
                });
            }
            if store::find_active_application(tx, &req.room_id, &req.user_id)?.is_some() {
                return Err(CoreError::AlreadyApplied {
                    user_id: req.user_id.clone(),
                    room_id: req.room_id.clone(),
                });
            }
            let lock = store::require_lock(tx, &req.lock_id)?;
            if lock.user_id != req.user_id
                || lock.room_id != req.room_id
                || lock.status != LockStatus::Locked
            {
                return Err(CoreError::NotLocked { lock_id: req.lock_id.clone() });
            }
            if lock.amount < required {
                return Err(CoreError::InsufficientBalance {
                    have: lock.amount,
                    need: required,
                });
            }

            let app = Application {
                id: new_id("ap"),
                room_id: req.room_id.clone(),
                user_id: req.user_id.clone(),
                motion_at_apply,
                status: ApplicationStatus::Pending,
                message: req.message.clone(),
                keys_staked: req.keys_staked,
                priority_score: priority,
                deposit_amount: self.cfg.entry_deposit,
                deposit_refunded: false,
                deposit_forfeit: false,
                lock_id: req.lock_id.clone(),
                referral_bonus: req.referral_bonus,
                activity_count: 0,
                activities: Vec::new(),
                applied_at: now,
                responded_at: None,
                last_active_at: None,
            };
            store::put_application(tx, &app)?;
            room.applicant_count += 1;
            room.motion_score = (room.motion_score + ROOM_BUZZ_APPLY).min(ROOM_BUZZ_CEILING);
            store::put_room(tx, &room)?;
            Ok(app)
        })?;

        // The application is committed; a failure in the reputation log must
        // not be reported as a failed apply.
        self.motion.record_event_logged(
            MotionEventType::ApplicationSubmitted,
            &req.user_id,
            Some(&req.room_id),
            None,
            json!({}),
        );
        self.motion.record_event_logged(
            MotionEventType::KeysStaked,
            &req.user_id,
            Some(&req.room_id),
            None,
            json!({ "amount": req.keys_staked }),
        );
        self.notifier.notify(NotifyEvent::NewApplicant {
            room_id: req.room_id.clone(),
            user_id: req.user_id.clone(),
        });
        json_log(
            Domain::Queue,
            "application.submitted",
            obj(&[
                ("application_id", v_str(&app.id)),
                ("room_id", v_str(&req.room_id)),
                ("user_id", v_str(&req.user_id)),
                ("priority", v_int(app.priority_score as i64)),
            ]),
        );
        Ok(app)
    }

    /// Accept a pending application. Capacity is a hard error; the filled and
    /// accepted counters move in the same transaction as the status flip, so
    /// concurrent accepts cannot overshoot `max_slots`. The stake is released
    /// at accept time only for applicants who actually engaged; ghosts wait
    /// for settlement.
    pub fn accept_application(&self, application_id: &str) -> CoreResult<Application> {
        let now = self.clock.now();
        let min_activity = self.cfg.min_activity_for_refund;
        let app = self.store.with_tx(|tx| {
            let mut app = store::require_application(tx, application_id)?;
            if app.status != ApplicationStatus::Pending {
                return Err(CoreError::NotPending { id: application_id.to_string() });
            }
            let mut room = store::require_room(tx, &app.room_id)?;
            if let Some(max) = room.max_slots {
                if room.filled_slots >= max {
                    return Err(CoreError::CapacityExceeded {
                        id: room.id.clone(),
                        max_slots: max,
                    });
                }
            }
            app.status = ApplicationStatus::Accepted;
            app.responded_at = Some(now);
            room.accepted_count += 1;
            room.filled_slots += 1;
            room.motion_score = (room.motion_score + ROOM_BUZZ_ACCEPT).min(ROOM_BUZZ_CEILING);
            store::put_room(tx, &room)?;

            if app.activity_count >= min_activity {
                let lock = unlock_in_tx(tx, &app.lock_id, LockStatus::Released, now)?;
                app.deposit_refunded = true;
                debug_assert_eq!(lock.status, LockStatus::Released);
            }
            store::put_application(tx, &app)?;
            Ok(app)
        })?;

        self.motion.record_event_logged(
            MotionEventType::ApplicationAccepted,
            &app.user_id,
            Some(&app.room_id),
            None,
            json!({}),
        );
        self.notifier.notify(NotifyEvent::ApplicationAccepted {
            application_id: app.id.clone(),
            room_id: app.room_id.clone(),
            user_id: app.user_id.clone(),
        });
        json_log(
            Domain::Queue,
            "application.accepted",
            obj(&[("application_id", v_str(&app.id)), ("room_id", v_str(&app.room_id))]),
        );
        Ok(app)
    }

    /// Reject a pending application. Rejection is never penalized: the lock
    /// is released unconditionally.
    pub fn reject_application(&self, application_id: &str) -> CoreResult<Application> {
        let now = self.clock.now();
        let app = self.store.with_tx(|tx| {
            let mut app = store::require_application(tx, application_id)?;
            if app.status != ApplicationStatus::Pending {
                return Err(CoreError::NotPending { id: application_id.to_string() });
            }
            app.status = ApplicationStatus::Rejected;
            app.responded_at = Some(now);
            unlock_in_tx(tx, &app.lock_id, LockStatus::Released, now)?;
            app.deposit_refunded = true;
            store::put_application(tx, &app)?;
            Ok(app)
        })?;
        self.notifier.notify(NotifyEvent::ApplicationRejected {
            application_id: app.id.clone(),
            room_id: app.room_id.clone(),
            user_id: app.user_id.clone(),
        });
        json_log(
            Domain::Queue,
            "application.rejected",
            obj(&[("application_id", v_str(&app.id)), ("room_id", v_str(&app.room_id))]),
        );
        Ok(app)
    }

    /// Withdraw a pending application; the lock is released unconditionally.
    pub fn withdraw_application(&self, application_id: &str) -> CoreResult<Application> {
        let now = self.clock.now();
        let app = self.store.with_tx(|tx| {
            let mut app = store::require_application(tx, application_id)?;
            if app.status != ApplicationStatus::Pending {
                return Err(CoreError::NotPending { id: application_id.to_string() });
            }
            app.status = ApplicationStatus::Withdrawn;
            app.responded_at = Some(now);
            unlock_in_tx(tx, &app.lock_id, LockStatus::Released, now)?;
            app.deposit_refunded = true;
            store::put_application(tx, &app)?;
            Ok(app)
        })?;
        json_log(
            Domain::Queue,
            "application.withdrawn",
            obj(&[("application_id", v_str(&app.id))]),
        );
        Ok(app)
    }

    /// Append an engagement event and recompute the priority score so the
    /// queue position reflects it on the very next read.
    pub fn add_activity(
        &self,
        application_id: &str,
        activity_type: &str,
        metadata: Value,
    ) -> CoreResult<Application> {
        let now = self.clock.now();
        let app = self.store.with_tx(|tx| {
            let mut app = store::require_application(tx, application_id)?;
            if !matches!(app.status, ApplicationStatus::Pending | ApplicationStatus::Accepted) {
                return Err(CoreError::NotPending { id: application_id.to_string() });
            }
            app.activities.push(Activity {
                activity_type: activity_type.to_string(),
                metadata: metadata.clone(),
                at: now,
            });
            app.activity_count += 1;
            app.last_active_at = Some(now);
            app.priority_score = self.priority_score(
                app.keys_staked,
                app.motion_at_apply,
                app.activity_count,
                app.referral_bonus,
            );
            store::put_application(tx, &app)?;
            let mut room = store::require_room(tx, &app.room_id)?;
            room.motion_score = (room.motion_score + ROOM_BUZZ_ACTIVITY).min(ROOM_BUZZ_CEILING);
            store::put_room(tx, &room)?;
            Ok(app)
        })?;
        self.motion.record_event_logged(
            MotionEventType::ActivityLogged,
            &app.user_id,
            Some(&app.room_id),
            None,
            json!({ "activity_type": activity_type }),
        );
        json_log(
            Domain::Queue,
            "activity.added",
            obj(&[
                ("application_id", v_str(application_id)),
                ("activity_count", v_int(app.activity_count as i64)),
            ]),
        );
        Ok(app)
    }

    /// The priority queue read: score descending, insertion order on ties.
    pub fn list_applications(&self, room_id: &str) -> CoreResult<Vec<Application>> {
        self.store.read(|conn| store::list_applications_for_room(conn, room_id))
    }

    pub fn list_by_user(&self, user_id: &str) -> CoreResult<Vec<Application>> {
        self.store.read(|conn| store::list_applications_by_user(conn, user_id))
    }

    pub fn get_application(&self, application_id: &str) -> CoreResult<Application> {
        self.store.read(|conn| store::require_application(conn, application_id))
    }

    /// Settlement for a closed room: refund engaged applicants, forfeit
    /// no-shows. Covers pending applications and accepted ones whose lock
    /// was withheld at accept time. Safe to run any number of times; a lock
    /// that already left `locked` contributes `already_settled` and its
    /// application flags are healed to match the lock.
    pub fn process_room_refunds(&self, room_id: &str) -> CoreResult<SettlementReport> {
        let now = self.clock.now();
        let min_activity = self.cfg.min_activity_for_refund;
        let (report, notices) = self.store.with_tx(|tx| {
            let room = store::require_room(tx, room_id)?;
            if !room.status.is_terminal() {
                return Err(CoreError::InvalidTransition {
                    id: room_id.to_string(),
                    from: room.status.as_str().to_string(),
                    to: "settled".to_string(),
                });
            }
            let mut report = SettlementReport::default();
            let mut notices = Vec::new();
            for mut app in store::list_settleable_for_room(tx, room_id)? {
                let lock = store::require_lock(tx, &app.lock_id)?;
                match lock.status {
                    LockStatus::Locked => {
                        if app.activity_count >= min_activity {
                            unlock_in_tx(tx, &app.lock_id, LockStatus::Released, now)?;
                            app.deposit_refunded = true;
                            report.refunded += 1;
                            notices.push(NotifyEvent::DepositRefunded {
                                room_id: room_id.to_string(),
                                user_id: app.user_id.clone(),
                                amount: lock.amount,
                            });
                        } else {
                            unlock_in_tx(tx, &app.lock_id, LockStatus::Forfeited, now)?;
                            app.deposit_forfeit = true;
                            report.forfeited += 1;
                            notices.push(NotifyEvent::DepositForfeited {
                                room_id: room_id.to_string(),
                                user_id: app.user_id.clone(),
                                amount: lock.amount,
                            });
                        }
                        store::put_application(tx, &app)?;
                    }
                    LockStatus::Released => {
                        report.already_settled += 1;
                        if !app.deposit_refunded {
                            app.deposit_refunded = true;
                            store::put_application(tx, &app)?;
                        }
                    }
                    LockStatus::Forfeited => {
                        report.already_settled += 1;
                        if !app.deposit_forfeit {
                            app.deposit_forfeit = true;
                            store::put_application(tx, &app)?;
                        }
                    }
                }
            }
            Ok((report, notices))
        })?;
        for notice in notices {
            self.notifier.notify(notice);
        }
        json_log(
            Domain::Queue,
            "room.settled",
            obj(&[
                ("room_id", v_str(room_id)),
                ("refunded", v_int(report.refunded as i64)),
                ("forfeited", v_int(report.forfeited as i64)),
                ("already_settled", v_int(report.already_settled as i64)),
            ]),
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::clock::ManualTimeSource;
    use crate::config::MotionWeightTable;
    use crate::notify::RecordingNotifier;
    use crate::oracle::StaticBalanceOracle;
    use crate::room::{CreateRoom, RoomService};
    use crate::types::{RoomDuration, RoomType};
    use crate::vault::VaultService;

    struct Fixture {
        rooms: RoomService,
        queue: ApplicationService,
        vault: VaultService,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualTimeSource>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(ManualTimeSource::new(Utc::now()));
        let cfg = Config::default();
        let motion = Arc::new(MotionEngine::new(
            store.clone(),
            clock.clone(),
            MotionWeightTable::default(),
            cfg.score_history_cap,
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let rooms = RoomService::new(store.clone(), clock.clone(), motion.clone(), cfg.clone());
        let vault = VaultService::new(
            store.clone(),
            clock.clone(),
            Arc::new(StaticBalanceOracle::new()),
        );
        let queue = ApplicationService::new(
            store,
            clock.clone(),
            motion,
            notifier.clone(),
            cfg,
        );
        Fixture { rooms, queue, vault, notifier, clock }
    }

    fn make_room(f: &Fixture, max_slots: Option<u32>, min_keys: u64) -> String {
        f.rooms
            .create_room(CreateRoom {
                room_type: RoomType::Deal,
                creator_id: "u-creator".into(),
                title: "deal room".into(),
                description: String::new(),
                tags: vec![],
                max_slots,
                min_keys,
                duration: RoomDuration::H72,
            })
            .unwrap()
            .id
    }

    fn stake_and_apply(f: &Fixture, room_id: &str, user: &str, keys: u64) -> Application {
        let lock = f.vault.lock_keys_verified(user, room_id, keys + 1, 1_000).unwrap();
        f.queue
            .apply(ApplyRequest {
                room_id: room_id.to_string(),
                user_id: user.to_string(),
                message: "gm".into(),
                keys_staked: keys,
                referral_bonus: 0,
                lock_id: lock.id,
            })
            .unwrap()
    }

    #[test]
    fn test_apply_sets_priority_and_counts() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 5);
        let app = stake_and_apply(&f, &room_id, "u-1", 5);
        // Fresh user: priority = keys * w_keys only.
        assert_eq!(app.priority_score, 5.0 * Config::default().priority.keys);
        assert_eq!(f.rooms.get_room(&room_id).unwrap().applicant_count, 1);
        // Staking moved the user's motion score afterwards.
        assert!(f.queue.motion.current_score("u-1").unwrap() > 0);
    }

    #[test]
    fn test_second_apply_rejected() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        stake_and_apply(&f, &room_id, "u-1", 5);
        // A fresh lock for the retry is irrelevant; the pair guard fires.
        let lock = f.vault.lock_keys_verified("u-1", "other", 6, 1_000).unwrap();
        let err = f
            .queue
            .apply(ApplyRequest {
                room_id: room_id.clone(),
                user_id: "u-1".into(),
                message: String::new(),
                keys_staked: 5,
                referral_bonus: 0,
                lock_id: lock.id,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyApplied { .. }));
    }

    #[test]
    fn test_apply_requires_covering_lock() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        // Lock covers only 3 keys but the request stakes 5 (+1 deposit).
        let lock = f.vault.lock_keys_verified("u-1", &room_id, 3, 1_000).unwrap();
        let err = f
            .queue
            .apply(ApplyRequest {
                room_id: room_id.clone(),
                user_id: "u-1".into(),
                message: String::new(),
                keys_staked: 5,
                referral_bonus: 0,
                lock_id: lock.id,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientBalance { have: 3, need: 6 }));
    }

    #[test]
    fn test_withdraw_then_reapply_allowed() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 5);
        f.queue.withdraw_application(&app.id).unwrap();
        assert_eq!(f.vault.get_vault("u-1").unwrap().total_keys_locked, 0);
        // Withdrawn applications do not block a new one.
        let again = stake_and_apply(&f, &room_id, "u-1", 2);
        assert_eq!(again.status, ApplicationStatus::Pending);
    }

    #[test]
    fn test_accept_without_engagement_keeps_lock() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 5);
        let accepted = f.queue.accept_application(&app.id).unwrap();
        assert_eq!(accepted.status, ApplicationStatus::Accepted);
        assert!(!accepted.deposit_refunded);
        // Anti-ghosting: stake stays locked until settlement.
        assert_eq!(f.vault.get_vault("u-1").unwrap().total_keys_locked, 6);
        let room = f.rooms.get_room(&room_id).unwrap();
        assert_eq!(room.accepted_count, 1);
        assert_eq!(room.filled_slots, 1);
    }

    #[test]
    fn test_accept_with_engagement_releases_lock() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 5);
        f.queue.add_activity(&app.id, "comment", json!({})).unwrap();
        f.queue.add_activity(&app.id, "comment", json!({})).unwrap();
        let accepted = f.queue.accept_application(&app.id).unwrap();
        assert!(accepted.deposit_refunded);
        assert_eq!(f.vault.get_vault("u-1").unwrap().total_keys_locked, 0);
    }

    #[test]
    fn test_accept_twice_is_not_pending() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 1);
        f.queue.accept_application(&app.id).unwrap();
        let err = f.queue.accept_application(&app.id).unwrap_err();
        assert!(matches!(err, CoreError::NotPending { .. }));
    }

    #[test]
    fn test_capacity_is_a_hard_error() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 0);
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(stake_and_apply(&f, &room_id, &format!("u-{}", i), 1).id);
        }
        for id in &ids[..3] {
            f.queue.accept_application(id).unwrap();
        }
        let err = f.queue.accept_application(&ids[3]).unwrap_err();
        assert!(matches!(err, CoreError::CapacityExceeded { max_slots: 3, .. }));
        let room = f.rooms.get_room(&room_id).unwrap();
        assert_eq!(room.filled_slots, 3);
        assert_eq!(room.accepted_count, 3);
    }

    #[test]
    fn test_reject_releases_unconditionally() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 5);
        let rejected = f.queue.reject_application(&app.id).unwrap();
        assert_eq!(rejected.status, ApplicationStatus::Rejected);
        assert!(rejected.deposit_refunded);
        assert!(rejected.responded_at.is_some());
        assert_eq!(f.vault.get_vault("u-1").unwrap().total_keys_locked, 0);
    }

    #[test]
    fn test_activity_bonus_caps_and_reorders_queue() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        let a = stake_and_apply(&f, &room_id, "u-a", 2);
        let b = stake_and_apply(&f, &room_id, "u-b", 2);
        // u-b grinds far past the cap.
        for _ in 0..15 {
            f.queue.add_activity(&b.id, "ping", json!({})).unwrap();
        }
        let updated = f.queue.get_application(&b.id).unwrap();
        let w = Config::default().priority;
        let expected = 2.0 * w.keys + 10.0 * w.activity;
        assert_eq!(updated.priority_score, expected);
        assert_eq!(updated.activity_count, 15);

        let queue = f.queue.list_applications(&room_id).unwrap();
        assert_eq!(queue[0].id, b.id);
        assert_eq!(queue[1].id, a.id);
    }

    #[test]
    fn test_settlement_refunds_engaged_forfeits_ghosts() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        let ghost = stake_and_apply(&f, &room_id, "u-ghost", 5);
        let active = stake_and_apply(&f, &room_id, "u-active", 5);
        f.queue.add_activity(&ghost.id, "view", json!({})).unwrap();
        f.queue.add_activity(&active.id, "comment", json!({})).unwrap();
        f.queue.add_activity(&active.id, "comment", json!({})).unwrap();

        f.rooms.close_room(&room_id).unwrap();
        let report = f.queue.process_room_refunds(&room_id).unwrap();
        assert_eq!(report.refunded, 1);
        assert_eq!(report.forfeited, 1);

        assert_eq!(f.vault.get_vault("u-ghost").unwrap().total_keys_locked, 0);
        assert_eq!(f.vault.get_vault("u-active").unwrap().total_keys_locked, 0);
        let ghost_lock = f.vault.get_lock(&ghost.lock_id).unwrap();
        assert_eq!(ghost_lock.status, LockStatus::Forfeited);
        let active_lock = f.vault.get_lock(&active.lock_id).unwrap();
        assert_eq!(active_lock.status, LockStatus::Released);

        let events = f.notifier.drain();
        assert!(events.iter().any(|e| matches!(e, NotifyEvent::DepositForfeited { .. })));
        assert!(events.iter().any(|e| matches!(e, NotifyEvent::DepositRefunded { .. })));
    }

    #[test]
    fn test_settlement_covers_accepted_ghosts() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 5);
        // Accepted with zero engagement: the lock is withheld at accept.
        f.queue.accept_application(&app.id).unwrap();
        assert_eq!(f.vault.get_vault("u-1").unwrap().total_keys_locked, 6);

        f.rooms.close_room(&room_id).unwrap();
        let report = f.queue.process_room_refunds(&room_id).unwrap();
        assert_eq!(report.forfeited, 1);
        assert_eq!(report.refunded, 0);
        assert_eq!(f.vault.get_lock(&app.lock_id).unwrap().status, LockStatus::Forfeited);
        assert_eq!(f.vault.get_vault("u-1").unwrap().total_keys_locked, 0);
        assert!(f.queue.get_application(&app.id).unwrap().deposit_forfeit);

        // Second pass sees the settled lock and does nothing.
        let again = f.queue.process_room_refunds(&room_id).unwrap();
        assert_eq!(again.changed(), 0);
        assert_eq!(again.already_settled, 1);
    }

    #[test]
    fn test_settlement_refunds_accepted_late_engager() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 5);
        f.queue.add_activity(&app.id, "comment", json!({})).unwrap();
        // One activity at accept time: below the bar, lock stays.
        let accepted = f.queue.accept_application(&app.id).unwrap();
        assert!(!accepted.deposit_refunded);
        // Engagement after acceptance still counts at settlement.
        f.queue.add_activity(&app.id, "comment", json!({})).unwrap();

        f.rooms.close_room(&room_id).unwrap();
        let report = f.queue.process_room_refunds(&room_id).unwrap();
        assert_eq!(report.refunded, 1);
        assert_eq!(report.forfeited, 0);
        assert_eq!(f.vault.get_lock(&app.lock_id).unwrap().status, LockStatus::Released);
        assert_eq!(f.vault.get_vault("u-1").unwrap().total_keys_locked, 0);
    }

    #[test]
    fn test_apply_below_entry_bar_rejected() {
        let f = fixture();
        let room_id = make_room(&f, None, 5);
        let lock = f.vault.lock_keys_verified("u-1", &room_id, 10, 1_000).unwrap();
        let err = f
            .queue
            .apply(ApplyRequest {
                room_id,
                user_id: "u-1".into(),
                message: String::new(),
                keys_staked: 3,
                referral_bonus: 0,
                lock_id: lock.id,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::BelowMinimumStake { staked: 3, min_keys: 5 }));
    }

    #[test]
    fn test_queue_movement_raises_room_buzz() {
        let f = fixture();
        let room_id = make_room(&f, Some(3), 0);
        let app = stake_and_apply(&f, &room_id, "u-1", 2);
        assert_eq!(f.rooms.get_room(&room_id).unwrap().motion_score, 3);
        f.queue.add_activity(&app.id, "comment", json!({})).unwrap();
        f.queue.add_activity(&app.id, "comment", json!({})).unwrap();
        f.queue.accept_application(&app.id).unwrap();
        assert_eq!(f.rooms.get_room(&room_id).unwrap().motion_score, 3 + 2 + 5);
    }

    #[test]
    fn test_apply_survives_event_log_failure() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        let lock = f.vault.lock_keys_verified("u-1", &room_id, 6, 1_000).unwrap();
        // Break the event log out from under the post-commit recording.
        f.queue
            .store
            .read(|conn| {
                conn.execute("DROP TABLE motion_events", [])?;
                Ok(())
            })
            .unwrap();
        let app = f
            .queue
            .apply(ApplyRequest {
                room_id: room_id.clone(),
                user_id: "u-1".into(),
                message: String::new(),
                keys_staked: 5,
                referral_bonus: 0,
                lock_id: lock.id,
            })
            .unwrap();
        // The committed application is returned despite the log failure.
        assert_eq!(app.status, ApplicationStatus::Pending);
        assert_eq!(f.rooms.get_room(&room_id).unwrap().applicant_count, 1);
    }

    #[test]
    fn test_settlement_idempotent() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        stake_and_apply(&f, &room_id, "u-1", 5);
        f.rooms.close_room(&room_id).unwrap();
        let first = f.queue.process_room_refunds(&room_id).unwrap();
        assert_eq!(first.changed(), 1);
        let second = f.queue.process_room_refunds(&room_id).unwrap();
        assert_eq!(second.changed(), 0);
        assert_eq!(second.already_settled, 1);
    }

    #[test]
    fn test_settlement_requires_closed_room() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        let err = f.queue.process_room_refunds(&room_id).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_apply_to_closed_room_rejected() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        f.rooms.close_room(&room_id).unwrap();
        let lock = f.vault.lock_keys_verified("u-1", &room_id, 6, 1_000).unwrap();
        let err = f
            .queue
            .apply(ApplyRequest {
                room_id: room_id.clone(),
                user_id: "u-1".into(),
                message: String::new(),
                keys_staked: 5,
                referral_bonus: 0,
                lock_id: lock.id,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::RoomClosed { .. }));
    }

    #[test]
    fn test_expired_room_rejects_applications() {
        let f = fixture();
        let room_id = make_room(&f, None, 0);
        f.clock.advance(chrono::Duration::hours(73));
        let lock = f.vault.lock_keys_verified("u-1", &room_id, 6, 1_000).unwrap();
        let err = f
            .queue
            .apply(ApplyRequest {
                room_id,
                user_id: "u-1".into(),
                message: String::new(),
                keys_staked: 5,
                referral_bonus: 0,
                lock_id: lock.id,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::RoomClosed { .. }));
    }
}
