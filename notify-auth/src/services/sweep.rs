use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::session::SessionManager;

const FIRST_RUN_DELAY: Duration = Duration::from_secs(60 * 60);
const MAX_JITTER_SECONDS: u64 = 30 * 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Daily purge of idle sessions. The first run is pushed past start-up and
/// jittered so replicas and other scheduled jobs do not fire together.
pub fn spawn_session_sweep(sessions: Arc<SessionManager>) -> JoinHandle<()> {
    let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..=MAX_JITTER_SECONDS));
    let first_run = FIRST_RUN_DELAY + jitter;
    tracing::info!(
        first_run_in_seconds = first_run.as_secs(),
        "Session sweep scheduled"
    );

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + first_run, SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = sessions.sweep_inactive().await {
                tracing::error!(error = %e, "Session sweep failed");
            }
        }
    })
}
