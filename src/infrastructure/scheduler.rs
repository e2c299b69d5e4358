//! Periodic Task Runner
//!
//! Runs a job on a fixed cadence until shutdown. Each run executes in its
//! own task so a panic is contained to that run and the loop keeps going.

use crate::infrastructure::shutdown::ShutdownController;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Spawn `job` every `period` until `shutdown` fires.
///
/// The first run happens one period after spawning. Runs never overlap:
/// the next tick waits for the current run to finish.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: ShutdownController,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately on the first tick
        ticker.tick().await;

        tracing::debug!("{} task started (every {:?})", name, period);

        loop {
            if shutdown.is_shutdown() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = rx.recv() => break,
            }

            let _guard = shutdown.task_guard();
            match tokio::spawn(job()).await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    tracing::error!("{} run panicked, continuing", name);
                }
                Err(e) => {
                    tracing::warn!("{} run did not complete: {}", name, e);
                }
            }
        }

        tracing::debug!("{} task stopped", name);
    })
}
