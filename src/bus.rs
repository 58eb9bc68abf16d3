use crate::types::Tick;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type SubscriberResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type TickHandler = Arc<dyn Fn(Tick) -> BoxFuture<'static, SubscriberResult> + Send + Sync>;

/// Handle returned by `subscribe`, used to remove the subscriber later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

#[derive(Clone)]
struct Subscriber {
    id: u64,
    name: Arc<str>,
    handler: TickHandler,
}

/// Fan-out bus delivering each tick to every registered subscriber
///
/// Delivery is in registration order, exactly once per subscriber per tick.
/// A failing subscriber is logged and skipped; its failure never reaches the
/// publisher or the remaining subscribers.
#[derive(Default)]
pub struct TickBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl TickBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; `name` is only used for log attribution
    pub async fn subscribe<F>(&self, name: &str, handler: F) -> SubscriberId
    where
        F: Fn(Tick) -> BoxFuture<'static, SubscriberResult> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.push(Subscriber {
            id,
            name: Arc::from(name),
            handler: Arc::new(handler),
        });
        tracing::debug!(subscriber = name, "tick subscriber registered");
        SubscriberId(id)
    }

    /// Remove a subscriber; returns false if it was already gone
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != id.0);
        before != subs.len()
    }

    /// Deliver a tick to all current subscribers, isolating failures
    ///
    /// A subscriber panic is a bug, but it must not unwind into the feed
    /// task and kill ingestion; it is caught and logged like an `Err`.
    pub async fn publish(&self, tick: &Tick) {
        // Snapshot the list so add/remove during delivery cannot affect
        // subscribers already in flight.
        let subs: Vec<Subscriber> = self.subscribers.read().await.clone();
        for sub in subs {
            let event = tick.clone();
            let handler = sub.handler.clone();
            let delivery = AssertUnwindSafe(async move { handler(event).await }).catch_unwind();
            match delivery.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        subscriber = %sub.name,
                        symbol = %tick.symbol,
                        error = %e,
                        "tick subscriber failed, continuing fan-out"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        subscriber = %sub.name,
                        symbol = %tick.symbol,
                        "tick subscriber panicked, continuing fan-out"
                    );
                }
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

/// Shared bus handed to the feed connector and all consumers
pub type SharedTickBus = Arc<TickBus>;

pub fn create_shared_tick_bus() -> SharedTickBus {
    Arc::new(TickBus::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    fn tick(symbol: &str) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price: dec!(1),
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            change_24h_percent: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delivery_in_registration_order() {
        let bus = TickBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(label, move |_t| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.lock().await.push(label);
                    Ok(())
                })
            })
            .await;
        }

        bus.publish(&tick("BTCUSDT")).await;
        assert_eq!(*seen.lock().await, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let bus = TickBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let seen = seen.clone();
            bus.subscribe("ok-before", move |_t| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.lock().await.push("before");
                    Ok(())
                })
            })
            .await;
        }
        bus.subscribe("broken", |_t| {
            Box::pin(async { Err("subscriber exploded".into()) })
        })
        .await;
        {
            let seen = seen.clone();
            bus.subscribe("ok-after", move |_t| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.lock().await.push("after");
                    Ok(())
                })
            })
            .await;
        }

        bus.publish(&tick("BTCUSDT")).await;
        bus.publish(&tick("BTCUSDT")).await;

        // Both ticks reached both healthy subscribers despite the failure
        assert_eq!(*seen.lock().await, vec!["before", "after", "before", "after"]);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let bus = TickBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("buggy", |_t| Box::pin(async { panic!("subscriber bug") }))
            .await;
        {
            let seen = seen.clone();
            bus.subscribe("healthy", move |_t| {
                let seen = seen.clone();
                Box::pin(async move {
                    seen.lock().await.push("delivered");
                    Ok(())
                })
            })
            .await;
        }

        bus.publish(&tick("BTCUSDT")).await;
        bus.publish(&tick("BTCUSDT")).await;

        // The panic never reached the publisher; fan-out kept going
        assert_eq!(*seen.lock().await, vec!["delivered", "delivered"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = TickBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let id = {
            let count = count.clone();
            bus.subscribe("counter", move |_t| {
                let count = count.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            })
            .await
        };

        bus.publish(&tick("BTCUSDT")).await;
        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        bus.publish(&tick("BTCUSDT")).await;

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
