use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fire `tick` on every occurrence of `schedule` until `shutdown` flips to `true`.
///
/// Ticks never overlap: the next fire time is computed only after the previous
/// tick returned, so occurrences missed while a tick was running are skipped.
/// A tick in progress is awaited, not cancelled, when shutdown arrives.
pub async fn run<F, Fut>(schedule: cron::Schedule, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(%schedule, "scheduler started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(%schedule, "schedule has no upcoming occurrence; scheduler exiting");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(next = %next, "waiting for next tick");

        tokio::select! {
            _ = tokio::time::sleep(wait) => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!("scheduler stopped");
}
