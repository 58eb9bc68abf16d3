use crate::bus::{SubscriberId, TickBus};
use crate::cache::SharedPriceCache;
use crate::notify::NotificationJob;
use crate::store::AlertStore;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Evaluates active alerts against incoming prices
///
/// Fed by two paths: per-tick via the fan-out bus, and a periodic sweep as a
/// backstop for missed events. Both end up in `evaluate`; the store's atomic
/// claim decides the single winner when they race on the same alert.
pub struct AlertEngine {
    store: Arc<dyn AlertStore>,
    jobs: mpsc::UnboundedSender<NotificationJob>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn AlertStore>, jobs: mpsc::UnboundedSender<NotificationJob>) -> Self {
        Self { store, jobs }
    }

    /// Evaluate every eligible alert for `symbol` at `price`; returns how
    /// many triggers this call won
    pub async fn evaluate(&self, symbol: &str, price: Decimal) -> usize {
        let alerts = match self.store.list_active(symbol).await {
            Ok(alerts) => alerts,
            Err(e) => {
                tracing::warn!(symbol, error = %e, "could not list active alerts");
                return 0;
            }
        };

        let mut won = 0;
        for alert in alerts {
            if !alert.condition_met(price) {
                continue;
            }

            let now = Utc::now();
            match self.store.claim_trigger(alert.id, price, now).await {
                Ok(true) => {
                    tracing::info!(
                        alert = alert.id,
                        symbol,
                        target = %alert.target_price,
                        price = %price,
                        "alert triggered"
                    );
                    let job = NotificationJob {
                        alert,
                        triggered_price: price,
                        triggered_at: now,
                    };
                    if self.jobs.send(job).is_err() {
                        tracing::error!("notification dispatcher gone, dropping job");
                    }
                    won += 1;
                }
                // Lost the claim: the other path already handled this alert
                Ok(false) => {
                    tracing::debug!(alert = alert.id, "trigger already claimed");
                }
                Err(e) => {
                    tracing::warn!(alert = alert.id, error = %e, "trigger claim failed");
                }
            }
        }
        won
    }

    /// Register the event-driven path on the fan-out bus
    pub async fn attach(self: &Arc<Self>, bus: &TickBus) -> SubscriberId {
        let engine = self.clone();
        bus.subscribe("alert-engine", move |tick| {
            let engine = engine.clone();
            Box::pin(async move {
                engine.evaluate(&tick.symbol, tick.price).await;
                Ok(())
            })
        })
        .await
    }
}

/// Periodic re-evaluation of every cached symbol
pub async fn run_sweep(
    engine: Arc<AlertEngine>,
    cache: SharedPriceCache,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the sweep starts one interval in
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            _ = ticker.tick() => {
                let snapshot = cache.snapshot().await;
                let mut won = 0;
                for (symbol, tick) in &snapshot {
                    won += engine.evaluate(symbol, tick.price).await;
                }
                if won > 0 {
                    tracing::info!(triggered = won, "sweep triggered alerts missed by the event path");
                } else {
                    tracing::debug!(symbols = snapshot.len(), "sweep pass complete");
                }
            }
        }
    }
    tracing::info!("alert sweep stopped");
}
