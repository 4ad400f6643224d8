//! Time-driven behavior under the orchestrator: the room lifecycle advanced
//! by sweeps, the extension window, and motion decay over multi-day spans.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use blastcore::clock::ManualTimeSource;
use blastcore::config::{Config, MotionWeightTable};
use blastcore::motion::MotionEngine;
use blastcore::notify::{NotifyEvent, RecordingNotifier};
use blastcore::oracle::StaticBalanceOracle;
use blastcore::queue::{ApplicationService, ApplyRequest};
use blastcore::room::{CreateRoom, RoomService};
use blastcore::store::Store;
use blastcore::sweeper::Orchestrator;
use blastcore::types::{LockStatus, MotionEventType, RoomDuration, RoomStatus, RoomType};
use blastcore::vault::VaultService;

struct World {
    orchestrator: Arc<Orchestrator>,
    rooms: RoomService,
    queue: Arc<ApplicationService>,
    vault: VaultService,
    motion: Arc<MotionEngine>,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<ManualTimeSource>,
}

fn world() -> World {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let clock = Arc::new(ManualTimeSource::new(Utc::now()));
    let cfg = Config::default();
    let motion = Arc::new(MotionEngine::new(
        store.clone(),
        clock.clone(),
        cfg.motion_weights.clone(),
        cfg.score_history_cap,
    ));
    let notifier = Arc::new(RecordingNotifier::new());
    let queue = Arc::new(ApplicationService::new(
        store.clone(),
        clock.clone(),
        motion.clone(),
        notifier.clone(),
        cfg.clone(),
    ));
    let rooms = RoomService::new(store.clone(), clock.clone(), motion.clone(), cfg.clone());
    let vault = VaultService::new(
        store.clone(),
        clock.clone(),
        Arc::new(StaticBalanceOracle::new()),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        clock.clone(),
        queue.clone(),
        motion.clone(),
        notifier.clone(),
        cfg,
    ));
    World { orchestrator, rooms, queue, vault, motion, notifier, clock }
}

fn open_room(w: &World, duration: RoomDuration) -> String {
    w.rooms
        .create_room(CreateRoom {
            room_type: RoomType::Collab,
            creator_id: "u-creator".into(),
            title: "launch".into(),
            description: String::new(),
            tags: vec![],
            max_slots: None,
            min_keys: 0,
            duration,
        })
        .unwrap()
        .id
}

fn apply_user(w: &World, room_id: &str, user: &str) -> String {
    let lock = w.vault.lock_keys_verified(user, room_id, 3, 100).unwrap();
    w.queue
        .apply(ApplyRequest {
            room_id: room_id.to_string(),
            user_id: user.to_string(),
            message: String::new(),
            keys_staked: 2,
            referral_bonus: 0,
            lock_id: lock.id,
        })
        .unwrap()
        .id
}

// ---------------------------------------------------------------------------
// open -> closing -> closed, driven entirely by the sweep
// ---------------------------------------------------------------------------
#[tokio::test]
async fn sweeps_drive_the_lifecycle() {
    let w = world();
    let room_id = open_room(&w, RoomDuration::H72);
    let app_id = apply_user(&w, &room_id, "u-1");

    // Mid-life: nothing to do.
    w.clock.advance(Duration::hours(30));
    let report = w.orchestrator.run_all().await;
    assert!(report.status.transitions.is_empty());
    assert_eq!(w.rooms.get_room(&room_id).unwrap().status, RoomStatus::Open);

    // 69h: inside the 3h closing window.
    w.clock.advance(Duration::hours(39));
    let report = w.orchestrator.run_all().await;
    assert_eq!(report.status.transitions.len(), 1);
    assert_eq!(report.status.transitions[0].to, RoomStatus::Closing);

    // 72h: closed and settled in the same pass.
    w.clock.advance(Duration::hours(3));
    let report = w.orchestrator.run_all().await;
    assert_eq!(report.status.transitions[0].to, RoomStatus::Closed);
    assert_eq!(report.status.settled, 1);

    // Zero activity is below the refund bar: stake forfeited.
    let app = w.queue.get_application(&app_id).unwrap();
    assert!(app.deposit_forfeit);
    assert_eq!(w.vault.get_lock(&app.lock_id).unwrap().status, LockStatus::Forfeited);
    assert_eq!(w.vault.get_vault("u-1").unwrap().total_keys_locked, 0);

    // Steady state: further passes observe, never re-settle.
    let report = w.orchestrator.run_all().await;
    assert!(report.status.transitions.is_empty());
    assert_eq!(report.status.settled, 0);
    assert_eq!(report.refunds.already_settled, 1);
}

#[test]
fn hot_promotion_then_extension_defers_closing() {
    let w = world();
    let room_id = open_room(&w, RoomDuration::H24);
    for user in ["u-1", "u-2", "u-3"] {
        apply_user(&w, &room_id, user);
    }
    let report = w.orchestrator.run_status_sweep();
    assert_eq!(report.transitions[0].to, RoomStatus::Hot);
    assert!(w
        .notifier
        .drain()
        .iter()
        .any(|e| matches!(e, NotifyEvent::RoomHot { .. })));

    // Extend while hot; 22h in would otherwise be the closing window.
    w.rooms.extend_room(&room_id).unwrap();
    w.clock.advance(Duration::hours(22));
    let report = w.orchestrator.run_status_sweep();
    assert!(report.transitions.is_empty());
    assert_eq!(w.rooms.get_room(&room_id).unwrap().status, RoomStatus::Hot);

    // The extension is single-shot, and the extended deadline still lands.
    assert!(w.rooms.extend_room(&room_id).is_err());
    w.clock.advance(Duration::hours(27));
    let report = w.orchestrator.run_status_sweep();
    assert_eq!(report.transitions[0].to, RoomStatus::Closed);
}

// ---------------------------------------------------------------------------
// round(10*e^0 + 20*e^-1) = 17 after 72h on a 72h tau
// ---------------------------------------------------------------------------
#[test]
fn decay_arithmetic_matches_formula() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let clock = Arc::new(ManualTimeSource::new(Utc::now()));
    let mut table = MotionWeightTable::default();
    table.room_created.weight = 20.0;
    table.keys_staked.weight = 10.0;
    let engine = MotionEngine::new(store, clock.clone(), table, 24);

    engine
        .record_event(MotionEventType::RoomCreated, "u-1", None, None, json!({}))
        .unwrap();
    clock.advance(Duration::hours(72));
    let score = engine
        .record_event(MotionEventType::KeysStaked, "u-1", None, None, json!({}))
        .unwrap();
    assert_eq!(score.current_score, 17);
    assert_eq!(score.base_score, 30.0);
}

#[test]
fn decay_sweep_erodes_idle_scores_without_new_events() {
    let w = world();
    let room_id = open_room(&w, RoomDuration::H72);
    apply_user(&w, &room_id, "u-1");
    let fresh = w.motion.current_score("u-1").unwrap();
    assert!(fresh > 0);

    let mut previous = fresh;
    for _ in 0..6 {
        w.clock.advance(Duration::hours(24));
        let report = w.orchestrator.run_decay_sweep();
        assert!(report.errors.is_empty());
        let current = w.motion.current_score("u-1").unwrap();
        assert!(current <= previous);
        previous = current;
    }
    // Six idle days on a 72h tau: effectively gone.
    assert!(previous <= 2);

    // Peak and history survive the erosion.
    let score = w.motion.get_score("u-1").unwrap();
    assert_eq!(score.peak_score, fresh);
    assert!(!score.history.is_empty());
}

#[test]
fn leaderboard_follows_recency() {
    let w = world();
    let old_room = open_room(&w, RoomDuration::H72);
    apply_user(&w, &old_room, "u-old");
    w.clock.advance(Duration::hours(100));
    let new_room = open_room(&w, RoomDuration::H72);
    apply_user(&w, &new_room, "u-new");
    w.orchestrator.run_decay_sweep();

    let board = w.motion.leaderboard(10).unwrap();
    let old_pos = board.iter().position(|s| s.user_id == "u-old");
    let new_pos = board.iter().position(|s| s.user_id == "u-new");
    assert!(new_pos < old_pos, "recent activity must outrank stale activity");
    assert_eq!(w.motion.rank("u-new").unwrap(), Some(1));
}
