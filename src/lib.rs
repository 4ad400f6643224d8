//! blastcore: coordination engine for the BLAST marketplace.
//!
//! Rooms are time-boxed postings; applicants compete for slots by staking
//! keys and by reputation. This crate owns the parts with real invariants:
//! key custody (never double-counted, never lost, never released twice), the
//! priority-ordered application queue, decaying motion scores, the room state
//! machine, and the periodic sweeps that drive transitions and settlement.
//! The web UI, generic content CRUD, and notification formatting live
//! elsewhere and talk to this crate as a library.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod matching;
pub mod motion;
pub mod notify;
pub mod oracle;
pub mod queue;
pub mod room;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod vault;

pub use clock::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use config::{Config, MotionWeightTable, PriorityWeights};
pub use error::{CoreError, CoreResult};
pub use matching::MatchEngine;
pub use motion::MotionEngine;
pub use notify::{Notifier, NotifyEvent, NullNotifier, RecordingNotifier, WebhookNotifier};
pub use oracle::{BalanceOracle, HttpBalanceOracle, StaticBalanceOracle};
pub use queue::{ApplicationService, ApplyRequest, SettlementReport};
pub use room::{CreateRoom, RoomService};
pub use store::Store;
pub use sweeper::{JobStats, Orchestrator, OrchestratorReport};
pub use vault::VaultService;
