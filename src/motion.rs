//! Reputation scoring: a bounded, exponentially-decayed sum of weighted
//! events. `score(t) = min(100, round(Σ wᵢ·e^(−Δtᵢ/τᵢ)))` with Δt in hours
//! and per-event-type decay constants from the injectable weight table.
//!
//! The query window is `2·max(τ)` hours: older contributions are numerically
//! negligible, so the cut is a cost bound, not an accuracy bound.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use crate::clock::TimeSource;
use crate::config::MotionWeightTable;
use crate::error::CoreResult;
use crate::logging::{json_log, log, obj, v_int, v_str, Domain, Level};
use crate::store::{self, Store};
use crate::types::{new_id, MotionEvent, MotionEventType, MotionScore, ScoreSnapshot};

pub const SCORE_CEILING: u32 = 100;

pub struct MotionEngine {
    store: Arc<Store>,
    clock: Arc<dyn TimeSource>,
    weights: MotionWeightTable,
    history_cap: usize,
}

#[derive(Debug, Default)]
pub struct BatchScoreReport {
    pub updated: usize,
    /// (user_id, error) pairs; one bad user never aborts the batch.
    pub errors: Vec<(String, String)>,
}

impl MotionEngine {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn TimeSource>,
        weights: MotionWeightTable,
        history_cap: usize,
    ) -> Self {
        Self { store, clock, weights, history_cap }
    }

    /// Append an immutable event and synchronously recompute the actor's
    /// score. Read-after-write: the caller sees the new score immediately.
    pub fn record_event(
        &self,
        event_type: MotionEventType,
        actor_id: &str,
        room_id: Option<&str>,
        target_id: Option<&str>,
        metadata: Value,
    ) -> CoreResult<MotionScore> {
        let entry = self.weights.entry(event_type);
        let event = MotionEvent {
            id: new_id("ev"),
            event_type,
            actor_id: actor_id.to_string(),
            room_id: room_id.map(str::to_string),
            target_id: target_id.map(str::to_string),
            weight: entry.weight,
            tau_hours: entry.tau_hours,
            ts: self.clock.now(),
            metadata,
        };
        self.store.with_tx(|tx| store::insert_event(tx, &event))?;
        json_log(
            Domain::Motion,
            "event.recorded",
            obj(&[
                ("event_type", v_str(event_type.as_str())),
                ("actor_id", v_str(actor_id)),
            ]),
        );
        self.calculate_score(actor_id)
    }

    /// Post-commit variant of `record_event` for callers whose own mutation
    /// has already committed: a failure here is logged and swallowed so the
    /// committed write is not reported back as failed.
    pub fn record_event_logged(
        &self,
        event_type: MotionEventType,
        actor_id: &str,
        room_id: Option<&str>,
        target_id: Option<&str>,
        metadata: Value,
    ) {
        if let Err(err) = self.record_event(event_type, actor_id, room_id, target_id, metadata) {
            log(
                Level::Warn,
                Domain::Motion,
                "event.record_failed",
                obj(&[
                    ("event_type", v_str(event_type.as_str())),
                    ("actor_id", v_str(actor_id)),
                    ("error", v_str(&err.to_string())),
                ]),
            );
        }
    }

    /// Recompute one user's score from the event log and persist it.
    pub fn calculate_score(&self, user_id: &str) -> CoreResult<MotionScore> {
        let now = self.clock.now();
        let window_hours = 2.0 * self.weights.max_tau_hours();
        let since = now - Duration::minutes((window_hours * 60.0) as i64);

        let score = self.store.with_tx(|tx| {
            let events = store::list_events_for_actor_since(tx, user_id, since)?;

            let mut base = 0.0_f64;
            let mut decayed = 0.0_f64;
            let mut breakdown: HashMap<MotionEventType, f64> = HashMap::new();
            for event in &events {
                let age_hours = (now - event.ts).num_seconds() as f64 / 3600.0;
                let tau = if event.tau_hours > 0.0 { event.tau_hours } else { 1.0 };
                let contribution = event.weight * (-age_hours.max(0.0) / tau).exp();
                base += event.weight;
                decayed += contribution;
                *breakdown.entry(event.event_type).or_insert(0.0) += contribution;
            }
            let current = (decayed.round() as i64).clamp(0, SCORE_CEILING as i64) as u32;

            let mut score = store::get_score(tx, user_id)?
                .unwrap_or_else(|| MotionScore::new(user_id, now));
            score.current_score = current;
            score.base_score = base;
            score.decay_amount = base - decayed;
            score.breakdown = breakdown;
            score.peak_score = score.peak_score.max(current);
            score.history.push(ScoreSnapshot { score: current, at: now });
            if score.history.len() > self.history_cap {
                let overflow = score.history.len() - self.history_cap;
                score.history.drain(..overflow);
            }
            score.updated_at = now;
            store::put_score(tx, &score)?;
            Ok(score)
        })?;
        json_log(
            Domain::Motion,
            "score.recomputed",
            obj(&[
                ("user_id", v_str(user_id)),
                ("score", v_int(score.current_score as i64)),
            ]),
        );
        Ok(score)
    }

    /// Best-effort sweep recompute; failures are collected per user.
    pub fn batch_calculate_scores(&self, user_ids: &[String]) -> BatchScoreReport {
        let mut report = BatchScoreReport::default();
        for user_id in user_ids {
            match self.calculate_score(user_id) {
                Ok(_) => report.updated += 1,
                Err(err) => report.errors.push((user_id.clone(), err.to_string())),
            }
        }
        report
    }

    pub fn get_score(&self, user_id: &str) -> CoreResult<MotionScore> {
        let now = self.clock.now();
        self.store.read(|conn| {
            Ok(store::get_score(conn, user_id)?.unwrap_or_else(|| MotionScore::new(user_id, now)))
        })
    }

    /// Current score without forcing a recompute; 0 for unknown users.
    pub fn current_score(&self, user_id: &str) -> CoreResult<u32> {
        Ok(self.get_score(user_id)?.current_score)
    }

    pub fn leaderboard(&self, limit: u32) -> CoreResult<Vec<MotionScore>> {
        self.store.read(|conn| store::leaderboard(conn, limit))
    }

    pub fn rank(&self, user_id: &str) -> CoreResult<Option<u64>> {
        self.store.read(|conn| store::score_rank(conn, user_id))
    }

    pub fn known_user_ids(&self) -> CoreResult<Vec<String>> {
        self.store.read(|conn| store::list_score_user_ids(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use chrono::Utc;
    use serde_json::json;

    fn engine_with_clock() -> (MotionEngine, Arc<ManualTimeSource>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = Arc::new(ManualTimeSource::new(Utc::now()));
        let engine = MotionEngine::new(store, clock.clone(), MotionWeightTable::default(), 24);
        (engine, clock)
    }

    #[test]
    fn test_decayed_sum_matches_formula() {
        // Two events at weights 10 and 20, ages 0h and tau hours, tau = 72:
        // round(10 + 20/e) = round(17.36) = 17.
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
        assert!(score.decay_amount > 12.0 && score.decay_amount < 13.0);
    }

    #[test]
    fn test_score_clamped_to_ceiling() {
        let (engine, _clock) = engine_with_clock();
        for _ in 0..20 {
            // room_filled carries the heaviest default weight (20).
            engine
                .record_event(MotionEventType::RoomFilled, "u-1", Some("r-1"), None, json!({}))
                .unwrap();
        }
        let score = engine.get_score("u-1").unwrap();
        assert_eq!(score.current_score, SCORE_CEILING);
        assert!(score.base_score > 100.0);
    }

    #[test]
    fn test_pure_decay_never_increases() {
        let (engine, clock) = engine_with_clock();
        engine
            .record_event(MotionEventType::IntroMade, "u-1", None, None, json!({}))
            .unwrap();
        let mut previous = engine.get_score("u-1").unwrap().current_score;
        for _ in 0..8 {
            clock.advance(Duration::hours(24));
            let next = engine.calculate_score("u-1").unwrap().current_score;
            assert!(next <= previous, "decay increased score: {} -> {}", previous, next);
            previous = next;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_peak_survives_decay_and_history_is_bounded() {
        let (engine, clock) = engine_with_clock();
        engine
            .record_event(MotionEventType::RoomFilled, "u-1", None, None, json!({}))
            .unwrap();
        let peak = engine.get_score("u-1").unwrap().current_score;
        for _ in 0..30 {
            clock.advance(Duration::hours(12));
            engine.calculate_score("u-1").unwrap();
        }
        let score = engine.get_score("u-1").unwrap();
        assert_eq!(score.peak_score, peak);
        assert_eq!(score.history.len(), 24);
        assert!(score.current_score < peak);
    }

    #[test]
    fn test_batch_continues_past_failures() {
        let (engine, _clock) = engine_with_clock();
        engine
            .record_event(MotionEventType::IntroMade, "u-1", None, None, json!({}))
            .unwrap();
        let ids = vec!["u-1".to_string(), "u-2".to_string()];
        let report = engine.batch_calculate_scores(&ids);
        // Unknown users compute cleanly to zero; nothing aborts.
        assert_eq!(report.updated, 2);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_leaderboard_orders_descending() {
        let (engine, _clock) = engine_with_clock();
        engine
            .record_event(MotionEventType::ActivityLogged, "u-low", None, None, json!({}))
            .unwrap();
        engine
            .record_event(MotionEventType::RoomFilled, "u-high", None, None, json!({}))
            .unwrap();
        let board = engine.leaderboard(10).unwrap();
        assert_eq!(board[0].user_id, "u-high");
        assert_eq!(engine.rank("u-high").unwrap(), Some(1));
        assert_eq!(engine.rank("u-low").unwrap(), Some(2));
        assert_eq!(engine.rank("u-none").unwrap(), None);
    }
}
