use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Deal,
    Airdrop,
    Job,
    Collab,
    Funding,
}

impl RoomType {
    pub const ALL: [RoomType; 5] = [
        RoomType::Deal,
        RoomType::Airdrop,
        RoomType::Job,
        RoomType::Collab,
        RoomType::Funding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::Deal => "deal",
            RoomType::Airdrop => "airdrop",
            RoomType::Job => "job",
            RoomType::Collab => "collab",
            RoomType::Funding => "funding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Open,
    Hot,
    Closing,
    Closed,
    Archived,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Open => "open",
            RoomStatus::Hot => "hot",
            RoomStatus::Closing => "closing",
            RoomStatus::Closed => "closed",
            RoomStatus::Archived => "archived",
        }
    }

    /// Closed and archived rooms no longer accept transitions from the sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoomStatus::Closed | RoomStatus::Archived)
    }
}

/// Enumerated posting durations. Free-form durations are not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomDuration {
    #[serde(rename = "24h")]
    H24,
    #[serde(rename = "48h")]
    H48,
    #[serde(rename = "72h")]
    H72,
}

impl RoomDuration {
    pub fn hours(&self) -> i64 {
        match self {
            RoomDuration::H24 => 24,
            RoomDuration::H48 => 48,
            RoomDuration::H72 => 72,
        }
    }
}

/// A time-boxed posting that accepts staked applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub room_type: RoomType,
    pub creator_id: String,
    /// Creator's motion score at creation time, frozen for display.
    pub creator_motion: u32,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// None = unlimited capacity.
    pub max_slots: Option<u32>,
    pub min_keys: u64,
    pub filled_slots: u32,
    pub applicant_count: u32,
    pub accepted_count: u32,
    pub total_keys_locked: u64,
    /// Room-level buzz, distinct from any user's score: bumped as the queue
    /// moves (applies, activity, accepts), capped at 100.
    pub motion_score: u32,
    pub status: RoomStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub extended: bool,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_full(&self) -> bool {
        match self.max_slots {
            Some(max) => self.filled_slots >= max,
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Withdrawn => "withdrawn",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub activity_type: String,
    pub metadata: Value,
    pub at: DateTime<Utc>,
}

/// One user's bid for one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    /// Applicant's motion score at apply time.
    pub motion_at_apply: u32,
    pub status: ApplicationStatus,
    pub message: String,
    pub keys_staked: u64,
    pub priority_score: f64,
    pub deposit_amount: u64,
    pub deposit_refunded: bool,
    pub deposit_forfeit: bool,
    /// Custody reference for deposit + stake.
    pub lock_id: String,
    pub referral_bonus: u32,
    pub activity_count: u32,
    pub activities: Vec<Activity>,
    pub applied_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Locked,
    Released,
    Forfeited,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Locked => "locked",
            LockStatus::Released => "released",
            LockStatus::Forfeited => "forfeited",
        }
    }
}

/// Custody record. The one source of truth for settlement idempotence:
/// status moves locked -> released or locked -> forfeited, exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyLock {
    pub id: String,
    pub user_id: String,
    pub room_id: String,
    pub amount: u64,
    pub status: LockStatus,
    pub locked_at: DateTime<Utc>,
    pub unlocked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarningsSource {
    Rooms,
    Intros,
    Referrals,
    Curating,
}

impl EarningsSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningsSource::Rooms => "rooms",
            EarningsSource::Intros => "intros",
            EarningsSource::Referrals => "referrals",
            EarningsSource::Curating => "curating",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundEntry {
    pub room_id: String,
    pub lock_id: String,
    pub amount: u64,
    pub at: DateTime<Utc>,
}

/// Per-user custody aggregate. `total_keys_locked` always equals the sum of
/// this user's locked-status KeyLocks; both mutate in the same transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub user_id: String,
    pub total_keys_locked: u64,
    /// Reward balances per currency symbol.
    pub balances: HashMap<String, f64>,
    pub earnings_by_source: HashMap<EarningsSource, f64>,
    pub refund_history: Vec<RefundEntry>,
    pub updated_at: DateTime<Utc>,
}

impl Vault {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_keys_locked: 0,
            balances: HashMap::new(),
            earnings_by_source: HashMap::new(),
            refund_history: Vec::new(),
            updated_at: now,
        }
    }
}

/// Closed set of reputation-bearing actions. Weights and decay constants come
/// from the injectable MotionWeightTable, never from constants here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionEventType {
    RoomCreated,
    ApplicationSubmitted,
    ApplicationAccepted,
    KeysStaked,
    ActivityLogged,
    IntroMade,
    ReferralLanded,
    RoomFilled,
}

impl MotionEventType {
    pub const ALL: [MotionEventType; 8] = [
        MotionEventType::RoomCreated,
        MotionEventType::ApplicationSubmitted,
        MotionEventType::ApplicationAccepted,
        MotionEventType::KeysStaked,
        MotionEventType::ActivityLogged,
        MotionEventType::IntroMade,
        MotionEventType::ReferralLanded,
        MotionEventType::RoomFilled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MotionEventType::RoomCreated => "room_created",
            MotionEventType::ApplicationSubmitted => "application_submitted",
            MotionEventType::ApplicationAccepted => "application_accepted",
            MotionEventType::KeysStaked => "keys_staked",
            MotionEventType::ActivityLogged => "activity_logged",
            MotionEventType::IntroMade => "intro_made",
            MotionEventType::ReferralLanded => "referral_landed",
            MotionEventType::RoomFilled => "room_filled",
        }
    }
}

/// Append-only reputation log entry. Never mutated, never deleted; old events
/// simply fall out of the score window once decay makes them negligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionEvent {
    pub id: String,
    pub event_type: MotionEventType,
    pub actor_id: String,
    pub room_id: Option<String>,
    pub target_id: Option<String>,
    pub weight: f64,
    /// Decay constant (hours) this event was recorded under.
    pub tau_hours: f64,
    pub ts: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub score: u32,
    pub at: DateTime<Utc>,
}

/// Per-user reputation aggregate, recomputed from the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionScore {
    pub user_id: String,
    /// Bounded 0..=100.
    pub current_score: u32,
    /// Sum of undecayed weights in the window.
    pub base_score: f64,
    pub decay_amount: f64,
    /// Most recent snapshots, newest last, bounded ring.
    pub history: Vec<ScoreSnapshot>,
    pub peak_score: u32,
    pub breakdown: HashMap<MotionEventType, f64>,
    pub updated_at: DateTime<Utc>,
}

impl MotionScore {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            current_score: 0,
            base_score: 0.0,
            decay_amount: 0.0,
            history: Vec::new(),
            peak_score: 0,
            breakdown: HashMap::new(),
            updated_at: now,
        }
    }
}

/// Random, collision-resistant document id with a collection prefix.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{:016x}", prefix, rand::random::<u64>())
}
