//! Background maintenance: lease reaper and done-job purge.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::kernel::ServerKernel;

/// Sweeps expired leases on an interval and re-evaluates any execution the
/// sweep touched. Purges long-done jobs once a minute's worth of ticks.
pub async fn run_reaper(kernel: Arc<ServerKernel>, broker: Arc<Broker>, shutdown: CancellationToken) {
    let interval = Duration::from_millis(kernel.config.reaper_interval_ms.max(100));
    let purge_every = (60_000 / kernel.config.reaper_interval_ms.max(100)).max(1);
    let mut ticker = tokio::time::interval(interval);
    let mut tick: u64 = 0;

    tracing::info!(interval_ms = interval.as_millis() as u64, "reaper started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tick += 1;

        match kernel.queue.reap_expired().await {
            Ok(report) => {
                for execution_id in report.execution_ids() {
                    broker.trigger(execution_id);
                }
            }
            Err(error) => {
                tracing::warn!(%error, "reaper sweep failed");
            }
        }

        if tick % purge_every == 0 {
            match kernel.queue.purge_done(kernel.config.purge_grace_secs).await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "done jobs purged"),
                Err(error) => tracing::warn!(%error, "purge failed"),
            }
        }
    }
    tracing::info!("reaper stopped");
}
