use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that periodically cancels holds whose TTL has lapsed.
pub async fn run_reaper(engine: Arc<Engine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        for id in engine.collect_expired_holds(now) {
            // Re-checked under the write lock; the guest may have paid or
            // released between the sweep and here.
            match engine.reap_expired_hold(id, now).await {
                Ok(true) => {
                    info!("reaped expired hold {id}");
                    metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
                }
                Ok(false) => debug!("reaper skip {id}: no longer an expired hold"),
                Err(e) => debug!("reaper skip {id}: {e}"),
            }
        }
    }
}

/// Background task that folds the WAL into a snapshot once enough events
/// have accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        let pending = engine.wal_appends_since_compact().await;
        if pending < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL ({pending} events folded)"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
