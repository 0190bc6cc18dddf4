use std::sync::Arc;
use std::time::Duration;
use telemon_storage::Storage;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Writes a snapshot every `every` until `token` is cancelled. The first
/// snapshot is taken one interval after start.
pub fn spawn_persist_loop(
    storage: Arc<dyn Storage>,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval_at(Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    match storage.persist().await {
                        Ok(()) => tracing::debug!(backend = storage.backend(), "Snapshot written"),
                        Err(e) => tracing::error!(error = %e, "Periodic snapshot failed"),
                    }
                }
            }
        }
    })
}
