//! One-shot operational probe: print room counts nearing expiry, overdue,
//! and active as JSON, then exit.

use std::sync::Arc;

use anyhow::Result;

use blastcore::clock::SystemTimeSource;
use blastcore::config::Config;
use blastcore::motion::MotionEngine;
use blastcore::notify::NullNotifier;
use blastcore::queue::ApplicationService;
use blastcore::store::Store;
use blastcore::sweeper::Orchestrator;

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store = Arc::new(Store::open(&cfg.sqlite_path)?);
    let clock = Arc::new(SystemTimeSource);
    let notifier = Arc::new(NullNotifier);
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
    let orchestrator = Orchestrator::new(store, clock, queue, motion, notifier, cfg);
    let stats = orchestrator.job_stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
