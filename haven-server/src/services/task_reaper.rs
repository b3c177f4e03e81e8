use crate::models::task;
use crate::state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Periodically hands stuck RUNNING tasks back to the queue.
///
/// A crashed agent never reports completion, so its claimed task would stay
/// RUNNING forever; once the claim lease lapses the sweep resets it to
/// PENDING and the next poll picks it up again.
pub fn start_task_reaper(state: Arc<AppState>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(state.config.reaper_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let db = state.db.clone();
                    match tokio::task::spawn_blocking(move || {
                        let conn = db.get()?;
                        task::release_expired(&conn)
                    })
                    .await
                    {
                        Ok(Ok(0)) => {}
                        Ok(Ok(n)) => tracing::warn!("Reclaimed {} expired task lease(s)", n),
                        Ok(Err(e)) => tracing::error!("Lease sweep failed: {:#}", e),
                        Err(e) => tracing::error!("Lease sweep join error: {}", e),
                    }
                }
            }
        }
        tracing::info!("Task reaper stopped");
    });
}
