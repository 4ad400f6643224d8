use thiserror::Error;

/// Typed, recoverable outcomes of guard checks plus pass-through I/O failures.
/// Guard variants are normal control flow for callers (a duplicate application
/// is an expected outcome, not a crash); storage and oracle failures propagate
/// unchanged for the caller to surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },

    #[error("keys already locked for user {user_id} in room {room_id}")]
    AlreadyLocked { user_id: String, room_id: String },

    #[error("lock {lock_id} is not in locked status")]
    NotLocked { lock_id: String },

    #[error("user {user_id} already applied to room {room_id}")]
    AlreadyApplied { user_id: String, room_id: String },

    #[error("stake of {staked} is below the room minimum of {min_keys} keys")]
    BelowMinimumStake { staked: u64, min_keys: u64 },

    #[error("room {id} is closed to applications")]
    RoomClosed { id: String },

    #[error("application {id} is not pending")]
    NotPending { id: String },

    #[error("room {id} was already extended once")]
    AlreadyExtended { id: String },

    #[error("room {id} cannot be extended from status {status}")]
    InvalidStateForExtension { id: String, status: String },

    #[error("room {id} is at capacity ({max_slots} slots)")]
    CapacityExceeded { id: String, max_slots: u32 },

    #[error("room {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("balance oracle failure: {0}")]
    Oracle(String),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("document decode failure: {0}")]
    Decode(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        CoreError::NotFound { kind, id: id.to_string() }
    }

    /// Guard violations are safe to report back to the end user verbatim;
    /// everything else is an internal fault.
    pub fn is_guard(&self) -> bool {
        !matches!(
            self,
            CoreError::Oracle(_) | CoreError::Storage(_) | CoreError::Decode(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
