//! Recurring orchestrator daemon: runs the three background sweeps on an
//! interval and logs the combined report each tick.

use std::sync::Arc;

use anyhow::Result;
use tokio::time::{interval, Duration};

use blastcore::clock::SystemTimeSource;
use blastcore::config::Config;
use blastcore::logging::{json_log, obj, v_int, v_str, Domain};
use blastcore::motion::MotionEngine;
use blastcore::notify::{Notifier, NullNotifier, WebhookNotifier};
use blastcore::queue::ApplicationService;
use blastcore::store::Store;
use blastcore::sweeper::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store = Arc::new(Store::open(&cfg.sqlite_path)?);
    let clock = Arc::new(SystemTimeSource);
    let notifier: Arc<dyn Notifier> = match std::env::var("WEBHOOK_URL") {
        Ok(url) => Arc::new(WebhookNotifier::new(&url)),
        Err(_) => Arc::new(NullNotifier),
    };
    let motion = Arc::new(MotionEngine::new(
        store.clone(),
        clock.clone(),
        cfg.motion_weights.clone(),
        cfg.score_history_cap,
    ));
    let queue = Arc::new(ApplicationService::new(
        store.clone(),
        clock.clone(),
        motion.clone(),
        notifier.clone(),
        cfg.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        clock,
        queue,
        motion,
        notifier,
        cfg.clone(),
    ));

    json_log(
        Domain::System,
        "sweep_loop.started",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("sweep_secs", v_int(cfg.sweep_secs as i64)),
        ]),
    );

    let mut ticker = interval(Duration::from_secs(cfg.sweep_secs));
    loop {
        ticker.tick().await;
        let report = orchestrator.run_all().await;
        json_log(
            Domain::Sweep,
            "tick.report",
            obj(&[
                ("rooms_scanned", v_int(report.status.scanned as i64)),
                ("transitions", v_int(report.status.transitions.len() as i64)),
                ("settled", v_int(report.status.settled as i64)),
                ("scores_updated", v_int(report.decay.updated as i64)),
                ("refund_rooms", v_int(report.refunds.rooms_checked as i64)),
                (
                    "errors",
                    v_int(
                        (report.status.errors.len()
                            + report.decay.errors.len()
                            + report.refunds.errors.len()) as i64,
                    ),
                ),
            ]),
        );
    }
}
