use crate::cache::SharedPriceCache;
use crate::store::PriceHistoryStore;
use crate::types::PriceHistoryRecord;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Periodically persist the whole price cache as one history batch
///
/// A failed batch is dropped and rebuilt from the live cache on the next
/// cycle; the feed and the alert engine never notice.
pub async fn run_snapshotter(
    cache: SharedPriceCache,
    store: Arc<dyn PriceHistoryStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; persistence starts one interval in
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            _ = ticker.tick() => {
                let snapshot = cache.snapshot().await;
                if snapshot.is_empty() {
                    tracing::debug!("price cache empty, nothing to persist");
                    continue;
                }

                let now = Utc::now();
                let records: Vec<PriceHistoryRecord> = snapshot
                    .values()
                    .map(|tick| PriceHistoryRecord::from_tick(tick, now))
                    .collect();
                let rows = records.len();

                match store.append_batch(records).await {
                    Ok(()) => tracing::debug!(rows, "price history batch written"),
                    Err(e) => {
                        tracing::warn!(error = %e, "price history batch failed, retrying next cycle");
                    }
                }
            }
        }
    }
    tracing::info!("snapshotter stopped");
}
