//! Real-time crypto price streaming and alert backend

use cryptoflyt_backend::alerts::{run_sweep, AlertEngine};
use cryptoflyt_backend::bus::create_shared_tick_bus;
use cryptoflyt_backend::cache::create_shared_price_cache;
use cryptoflyt_backend::config::Settings;
use cryptoflyt_backend::feed::{BybitFeed, FeedConnector};
use cryptoflyt_backend::notify::{
    EmailChannel, NotificationChannel, NotificationDispatcher, TelegramChannel,
};
use cryptoflyt_backend::server::{self, BroadcastManager};
use cryptoflyt_backend::snapshot::run_snapshotter;
use cryptoflyt_backend::store::{MemoryAlertStore, MemoryPriceHistoryStore, MemoryUserDirectory};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    tracing::info!("Starting CryptoFlyt Backend");
    tracing::info!(
        "Tracking {} trading pairs: {:?}",
        settings.symbols.len(),
        settings.symbols
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cache = create_shared_price_cache();
    let bus = create_shared_tick_bus();

    // Collaborator stores; database-backed implementations slot in behind
    // the same traits
    let alert_store = Arc::new(MemoryAlertStore::new());
    let directory = Arc::new(MemoryUserDirectory::new());
    let history_store = Arc::new(MemoryPriceHistoryStore::new());

    // Notification pipeline
    let telegram: Option<Arc<dyn NotificationChannel>> = settings
        .telegram_bot_token
        .as_deref()
        .map(|token| Arc::new(TelegramChannel::new(token)) as Arc<dyn NotificationChannel>);
    if telegram.is_none() {
        tracing::warn!("TELEGRAM_BOT_TOKEN not set, telegram notifications disabled");
    }
    let (job_tx, job_rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(NotificationDispatcher::new(
        alert_store.clone(),
        directory.clone(),
        telegram,
        Some(Arc::new(EmailChannel)),
        settings.channel_timeout,
    ));
    tokio::spawn(dispatcher.run(job_rx));

    // Alert engine: event path via the bus, plus the periodic sweep
    let engine = Arc::new(AlertEngine::new(alert_store.clone(), job_tx));
    engine.attach(&bus).await;
    tokio::spawn(run_sweep(
        engine.clone(),
        cache.clone(),
        settings.sweep_interval,
        shutdown_rx.clone(),
    ));

    // Viewer fan-out subscribes to the same bus
    let manager = BroadcastManager::new(cache.clone(), settings.keepalive_interval);
    {
        let manager = manager.clone();
        bus.subscribe("broadcast-manager", move |tick| {
            let manager = manager.clone();
            Box::pin(async move {
                manager.push_update(&tick);
                Ok(())
            })
        })
        .await;
    }

    // Periodic price history persistence
    tokio::spawn(run_snapshotter(
        cache.clone(),
        history_store.clone(),
        settings.snapshot_interval,
        shutdown_rx.clone(),
    ));

    // Upstream feed task, the sole writer of the price cache
    let feed = BybitFeed::new(settings.feed_url.clone(), settings.symbols.clone());
    let connector = FeedConnector::new(
        feed,
        cache.clone(),
        bus.clone(),
        settings.reconnect_delay,
        shutdown_rx.clone(),
    );
    let feed_task = tokio::spawn(connector.run());

    // Ctrl-C flips the shutdown flag watched by every task
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!("Starting viewer WebSocket server on {}", settings.bind_addr);
    server::start_server(&settings.bind_addr, manager, shutdown_rx.clone()).await?;

    // The feed loop closes its transport and exits without further retries
    let _ = feed_task.await;
    tracing::info!("CryptoFlyt Backend stopped");
    Ok(())
}
