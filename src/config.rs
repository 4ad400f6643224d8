use serde::{Deserialize, Serialize};

use crate::types::MotionEventType;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Fixed weights for the application priority formula:
/// keys*w_keys + motion*w_motion + min(activity, cap)*w_activity + referral*w_referral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub keys: f64,
    pub motion: f64,
    pub activity: f64,
    pub referral: f64,
    /// Activity bonus saturates here so grinding cannot outrank stake.
    pub activity_cap: u32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self { keys: 10.0, motion: 1.0, activity: 5.0, referral: 20.0, activity_cap: 10 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MotionWeight {
    pub weight: f64,
    /// Decay constant in hours for this event type.
    pub tau_hours: f64,
}

/// Injectable type -> (weight, tau) table for motion events. The enum is
/// closed, so every event type must have a row; an unknown type is a compile
/// error, never a silent zero-weight entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionWeightTable {
    pub room_created: MotionWeight,
    pub application_submitted: MotionWeight,
    pub application_accepted: MotionWeight,
    pub keys_staked: MotionWeight,
    pub activity_logged: MotionWeight,
    pub intro_made: MotionWeight,
    pub referral_landed: MotionWeight,
    pub room_filled: MotionWeight,
}

impl MotionWeightTable {
    pub fn entry(&self, event_type: MotionEventType) -> MotionWeight {
        match event_type {
            MotionEventType::RoomCreated => self.room_created,
            MotionEventType::ApplicationSubmitted => self.application_submitted,
            MotionEventType::ApplicationAccepted => self.application_accepted,
            MotionEventType::KeysStaked => self.keys_staked,
            MotionEventType::ActivityLogged => self.activity_logged,
            MotionEventType::IntroMade => self.intro_made,
            MotionEventType::ReferralLanded => self.referral_landed,
            MotionEventType::RoomFilled => self.room_filled,
        }
    }

    /// Widest decay constant in the table; bounds the score query window.
    pub fn max_tau_hours(&self) -> f64 {
        MotionEventType::ALL
            .iter()
            .map(|t| self.entry(*t).tau_hours)
            .fold(0.0_f64, f64::max)
    }
}

impl Default for MotionWeightTable {
    fn default() -> Self {
        let tau = 72.0;
        Self {
            room_created: MotionWeight { weight: 10.0, tau_hours: tau },
            application_submitted: MotionWeight { weight: 5.0, tau_hours: tau },
            application_accepted: MotionWeight { weight: 15.0, tau_hours: tau },
            keys_staked: MotionWeight { weight: 8.0, tau_hours: tau },
            activity_logged: MotionWeight { weight: 2.0, tau_hours: tau },
            intro_made: MotionWeight { weight: 12.0, tau_hours: tau },
            referral_landed: MotionWeight { weight: 10.0, tau_hours: tau },
            room_filled: MotionWeight { weight: 20.0, tau_hours: tau },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sqlite_path: String,
    /// Flat entry fee in keys, locked alongside the stake.
    pub entry_deposit: u64,
    /// open -> hot once applicant_count reaches this.
    pub hot_applicant_threshold: u32,
    /// hot -> closing inside this many hours before end_time.
    pub closing_window_hours: i64,
    /// One-time grace extension length.
    pub extension_hours: i64,
    /// Minimum engagement for a refund at accept time and at settlement.
    pub min_activity_for_refund: u32,
    /// Bounded lookback for the defensive refund re-sweep.
    pub refund_lookback_hours: i64,
    /// Snapshot ring length on MotionScore.
    pub score_history_cap: usize,
    /// Rooms younger than this get a freshness bonus in matching.
    pub freshness_window_hours: i64,
    pub sweep_secs: u64,
    pub priority: PriorityWeights,
    pub motion_weights: MotionWeightTable,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./blast.sqlite".to_string()),
            entry_deposit: env_parse("ENTRY_DEPOSIT", 1),
            hot_applicant_threshold: env_parse("HOT_APPLICANTS", 3),
            closing_window_hours: env_parse("CLOSING_WINDOW_H", 3),
            extension_hours: env_parse("EXTENSION_H", 24),
            min_activity_for_refund: env_parse("MIN_ACTIVITY_REFUND", 2),
            refund_lookback_hours: env_parse("REFUND_LOOKBACK_H", 48),
            score_history_cap: env_parse("SCORE_HISTORY_CAP", 24),
            freshness_window_hours: env_parse("FRESHNESS_WINDOW_H", 6),
            sweep_secs: env_parse("SWEEP_SECS", 300),
            priority: PriorityWeights {
                keys: env_parse("W_KEYS", 10.0),
                motion: env_parse("W_MOTION", 1.0),
                activity: env_parse("W_ACTIVITY", 5.0),
                referral: env_parse("W_REFERRAL", 20.0),
                activity_cap: env_parse("ACTIVITY_CAP", 10),
            },
            motion_weights: MotionWeightTable::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sqlite_path: "./blast.sqlite".to_string(),
            entry_deposit: 1,
            hot_applicant_threshold: 3,
            closing_window_hours: 3,
            extension_hours: 24,
            min_activity_for_refund: 2,
            refund_lookback_hours: 48,
            score_history_cap: 24,
            freshness_window_hours: 6,
            sweep_secs: 300,
            priority: PriorityWeights::default(),
            motion_weights: MotionWeightTable::default(),
        }
    }
}
