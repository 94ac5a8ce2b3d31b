use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};

/// Background task that closes out bookings whose interval has elapsed.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let swept = engine.expire_elapsed(now_ms()).await;
        if !swept.is_empty() {
            info!("sweep closed {} elapsed bookings", swept.len());
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
