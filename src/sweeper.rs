//! Background orchestrator: three independent, idempotent sweeps.
//!
//! 1. Status transitions over live rooms, with settlement on close.
//! 2. Motion decay recomputation for every known score.
//! 3. Defensive refund re-sweep over recently closed rooms.
//!
//! Each sweep is safe to run on any interval and to overlap with itself:
//! transitions are forward-only, settlement is keyed on lock status, and the
//! decay recompute is a pure function of the event log. Per-item failures are
//! collected into the report, never fatal to the batch.

use std::sync::Arc;

use chrono::Duration;

use crate::clock::TimeSource;
use crate::config::Config;
use crate::error::CoreResult;
use crate::logging::{json_log, obj, v_int, v_str, Domain};
use crate::motion::MotionEngine;
use crate::notify::{Notifier, NotifyEvent};
use crate::queue::ApplicationService;
use crate::room::next_status;
use crate::store::{self, Store};
use crate::types::RoomStatus;

#[derive(Debug, Clone)]
pub struct SweepError {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub room_id: String,
    pub from: RoomStatus,
    pub to: RoomStatus,
}

#[derive(Debug, Default, Clone)]
pub struct StatusSweepReport {
    pub scanned: usize,
    pub transitions: Vec<Transition>,
    /// Rooms settled after transitioning into closed this pass.
    pub settled: usize,
    pub errors: Vec<SweepError>,
}

#[derive(Debug, Default, Clone)]
pub struct DecaySweepReport {
    pub updated: usize,
    pub errors: Vec<SweepError>,
}

#[derive(Debug, Default, Clone)]
pub struct RefundSweepReport {
    pub rooms_checked: usize,
    pub refunded: u32,
    pub forfeited: u32,
    pub already_settled: u32,
    pub errors: Vec<SweepError>,
}

#[derive(Debug, Default, Clone)]
pub struct OrchestratorReport {
    pub status: StatusSweepReport,
    pub decay: DecaySweepReport,
    pub refunds: RefundSweepReport,
}

/// Operational probe for dashboards and alerts.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct JobStats {
    pub active_rooms: u64,
    /// Live rooms inside the closing window.
    pub nearing_expiry: u64,
    /// Live rooms already past end_time, waiting on the next sweep.
    pub overdue: u64,
    pub closed_rooms: u64,
}

pub struct Orchestrator {
    store: Arc<Store>,
    clock: Arc<dyn TimeSource>,
    queue: Arc<ApplicationService>,
    motion: Arc<MotionEngine>,
    notifier: Arc<dyn Notifier>,
    cfg: Config,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn TimeSource>,
        queue: Arc<ApplicationService>,
        motion: Arc<MotionEngine>,
        notifier: Arc<dyn Notifier>,
        cfg: Config,
    ) -> Self {
        Self { store, clock, queue, motion, notifier, cfg }
    }

    /// Apply the state machine to every live room; settle rooms that close.
    pub fn run_status_sweep(&self) -> StatusSweepReport {
        let mut report = StatusSweepReport::default();
        let rooms = match self.store.read(|conn| store::list_live_rooms(conn)) {
            Ok(rooms) => rooms,
            Err(err) => {
                report.errors.push(SweepError { id: "scan".into(), error: err.to_string() });
                return report;
            }
        };
        report.scanned = rooms.len();

        for room in rooms {
            match self.tick_room(&room.id) {
                Ok(Some(transition)) => {
                    let closed = transition.to == RoomStatus::Closed;
                    if transition.to == RoomStatus::Hot {
                        self.notifier.notify(NotifyEvent::RoomHot {
                            room_id: transition.room_id.clone(),
                        });
                    }
                    report.transitions.push(transition);
                    if closed {
                        match self.queue.process_room_refunds(&room.id) {
                            Ok(_) => report.settled += 1,
                            Err(err) => report.errors.push(SweepError {
                                id: room.id.clone(),
                                error: err.to_string(),
                            }),
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    report.errors.push(SweepError { id: room.id.clone(), error: err.to_string() })
                }
            }
        }
        json_log(
            Domain::Sweep,
            "status_sweep.done",
            obj(&[
                ("scanned", v_int(report.scanned as i64)),
                ("transitions", v_int(report.transitions.len() as i64)),
                ("settled", v_int(report.settled as i64)),
                ("errors", v_int(report.errors.len() as i64)),
            ]),
        );
        report
    }

    /// One forward step for one room, re-read under the transaction so an
    /// overlapping sweep cannot double-apply a transition.
    fn tick_room(&self, room_id: &str) -> CoreResult<Option<Transition>> {
        let now = self.clock.now();
        let cfg = &self.cfg;
        self.store.with_tx(|tx| {
            let mut room = store::require_room(tx, room_id)?;
            let Some(to) = next_status(&room, now, cfg) else {
                return Ok(None);
            };
            let from = room.status;
            room.status = to;
            store::put_room(tx, &room)?;
            json_log(
                Domain::Room,
                "room.transitioned",
                obj(&[
                    ("room_id", v_str(room_id)),
                    ("from", v_str(from.as_str())),
                    ("to", v_str(to.as_str())),
                ]),
            );
            Ok(Some(Transition { room_id: room_id.to_string(), from, to }))
        })
    }

    /// Recompute every known score so decay applies even without new events.
    pub fn run_decay_sweep(&self) -> DecaySweepReport {
        let mut report = DecaySweepReport::default();
        let user_ids = match self.motion.known_user_ids() {
            Ok(ids) => ids,
            Err(err) => {
                report.errors.push(SweepError { id: "scan".into(), error: err.to_string() });
                return report;
            }
        };
        let batch = self.motion.batch_calculate_scores(&user_ids);
        report.updated = batch.updated;
        report.errors.extend(
            batch.errors.into_iter().map(|(id, error)| SweepError { id, error }),
        );
        json_log(
            Domain::Sweep,
            "decay_sweep.done",
            obj(&[
                ("updated", v_int(report.updated as i64)),
                ("errors", v_int(report.errors.len() as i64)),
            ]),
        );
        report
    }

    /// Re-settle recently closed rooms in case a close-time settlement was
    /// interrupted. "Already processed" shows up as `already_settled`, which
    /// is the expected steady state, not an error.
    pub fn run_refund_sweep(&self) -> RefundSweepReport {
        let mut report = RefundSweepReport::default();
        let since = self.clock.now() - Duration::hours(self.cfg.refund_lookback_hours);
        let rooms = match self.store.read(|conn| store::list_closed_since(conn, since)) {
            Ok(rooms) => rooms,
            Err(err) => {
                report.errors.push(SweepError { id: "scan".into(), error: err.to_string() });
                return report;
            }
        };
        report.rooms_checked = rooms.len();
        for room in rooms {
            match self.queue.process_room_refunds(&room.id) {
                Ok(settlement) => {
                    report.refunded += settlement.refunded;
                    report.forfeited += settlement.forfeited;
                    report.already_settled += settlement.already_settled;
                }
                Err(err) => {
                    report.errors.push(SweepError { id: room.id.clone(), error: err.to_string() })
                }
            }
        }
        json_log(
            Domain::Sweep,
            "refund_sweep.done",
            obj(&[
                ("rooms_checked", v_int(report.rooms_checked as i64)),
                ("refunded", v_int(report.refunded as i64)),
                ("forfeited", v_int(report.forfeited as i64)),
                ("errors", v_int(report.errors.len() as i64)),
            ]),
        );
        report
    }

    /// Run the three sweeps concurrently and return the combined report.
    pub async fn run_all(self: &Arc<Self>) -> OrchestratorReport {
        let status_task = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.run_status_sweep())
        };
        let decay_task = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.run_decay_sweep())
        };
        let refund_task = {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.run_refund_sweep())
        };
        let (status, decay, refunds) = tokio::join!(status_task, decay_task, refund_task);
        OrchestratorReport {
            status: status.unwrap_or_else(|err| StatusSweepReport {
                errors: vec![SweepError { id: "join".into(), error: err.to_string() }],
                ..Default::default()
            }),
            decay: decay.unwrap_or_else(|err| DecaySweepReport {
                errors: vec![SweepError { id: "join".into(), error: err.to_string() }],
                ..Default::default()
            }),
            refunds: refunds.unwrap_or_else(|err| RefundSweepReport {
                errors: vec![SweepError { id: "join".into(), error: err.to_string() }],
                ..Default::default()
            }),
        }
    }

    /// Read-only counts for operational visibility.
    pub fn job_stats(&self) -> CoreResult<JobStats> {
        let now = self.clock.now();
        let window = Duration::hours(self.cfg.closing_window_hours);
        self.store.read(|conn| {
            let active = store::count_rooms_by_status(conn, RoomStatus::Open)?
                + store::count_rooms_by_status(conn, RoomStatus::Hot)?
                + store::count_rooms_by_status(conn, RoomStatus::Closing)?;
            Ok(JobStats {
                active_rooms: active,
                nearing_expiry: store::count_rooms_expiring_within(conn, now, window)?,
                overdue: store::count_rooms_overdue(conn, now)?,
                closed_rooms: store::count_rooms_by_status(conn, RoomStatus::Closed)?,
            })
        })
    }
}
