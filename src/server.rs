use crate::cache::SharedPriceCache;
use crate::types::{Tick, ViewerMessage};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

/// Queued updates per session; a session that falls this far behind is
/// treated as dead
const SESSION_QUEUE_CAPACITY: usize = 256;

/// Registry of live downstream viewer sessions
///
/// Each session gets a bounded queue. Pushes use `try_send`, so one slow or
/// unresponsive session can never delay the tick that is being fanned out,
/// nor any other session; a failed push evicts the session instead.
pub struct BroadcastManager {
    sessions: DashMap<u64, mpsc::Sender<ViewerMessage>>,
    next_id: AtomicU64,
    cache: SharedPriceCache,
    keepalive_interval: Duration,
}

pub type SharedBroadcastManager = Arc<BroadcastManager>;

impl BroadcastManager {
    pub fn new(cache: SharedPriceCache, keepalive_interval: Duration) -> SharedBroadcastManager {
        Arc::new(Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            cache,
            keepalive_interval,
        })
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Register a new session and hand back its update queue
    pub fn register(&self) -> (u64, mpsc::Receiver<ViewerMessage>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(id, tx);
        tracing::info!(session = id, total = self.sessions.len(), "viewer connected");
        (id, rx)
    }

    /// Remove a session; safe to call more than once
    pub fn evict(&self, session: u64) {
        if self.sessions.remove(&session).is_some() {
            tracing::info!(session, total = self.sessions.len(), "viewer removed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Fan one tick out to every live session without blocking on any
    pub fn push_update(&self, tick: &Tick) {
        let msg = ViewerMessage::Update {
            data: tick.clone(),
            timestamp: Utc::now(),
        };

        let mut dead = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().try_send(msg.clone()).is_err() {
                // Queue full or receiver gone: the session is not keeping up
                dead.push(*entry.key());
            }
        }
        for session in dead {
            tracing::warn!(session, "viewer not keeping up, evicting");
            self.evict(session);
        }
    }

    /// Full-state message covering every symbol currently cached
    pub async fn snapshot_message(&self) -> ViewerMessage {
        ViewerMessage::Snapshot {
            data: self.cache.snapshot().await,
            timestamp: Utc::now(),
        }
    }
}

/// Bind and serve viewer WebSocket connections until shutdown
pub async fn start_server(
    addr: &str,
    manager: SharedBroadcastManager,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("viewer WebSocket server listening on {}", addr);
    run_acceptor(listener, manager, shutdown).await;
    Ok(())
}

/// Accept loop, split from `start_server` so tests can bind an ephemeral port
pub async fn run_acceptor(
    listener: TcpListener,
    manager: SharedBroadcastManager,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            } => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let manager = manager.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_session(stream, addr, manager, shutdown).await {
                                tracing::debug!("viewer {} error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "viewer accept failed"),
                }
            }
        }
    }
    tracing::info!("viewer server stopped");
}

type WsError = tokio_tungstenite::tungstenite::Error;

/// Send with an upper bound on how long the peer may stall the write
///
/// A viewer that holds the connection open but stops reading eventually
/// fills the kernel send buffer; without a bound this task would pend in
/// the write forever and its keepalive deadline could never fire.
async fn bounded_send<S>(write: &mut S, msg: Message, window: Duration) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match tokio::time::timeout(window, write.send(msg)).await {
        Ok(sent) => sent,
        Err(_) => Err(WsError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "peer did not accept the frame in time",
        ))),
    }
}

async fn handle_session(
    stream: TcpStream,
    addr: SocketAddr,
    manager: SharedBroadcastManager,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let keepalive = manager.keepalive_interval();

    // Register before taking the snapshot: anything the cache sees after
    // this instant lands in our queue and is replayed after the snapshot,
    // so a late joiner never misses state.
    let (session, mut queue) = manager.register();

    let snapshot = manager.snapshot_message().await;
    let json = serde_json::to_string(&snapshot)?;
    if let Err(e) = bounded_send(&mut write, Message::Text(json.into()), keepalive).await {
        manager.evict(session);
        return Err(e.into());
    }

    let mut last_inbound = Instant::now();
    let mut awaiting_reply = false;

    loop {
        // Probe after one quiet interval, terminate after a second one
        let deadline = if awaiting_reply {
            last_inbound + keepalive * 2
        } else {
            last_inbound + keepalive
        };

        tokio::select! {
            queued = queue.recv() => {
                match queued {
                    Some(msg) => {
                        let json = serde_json::to_string(&msg)?;
                        if let Err(e) =
                            bounded_send(&mut write, Message::Text(json.into()), keepalive).await
                        {
                            tracing::debug!("viewer {} send failed: {}", addr, e);
                            break;
                        }
                    }
                    // Evicted by the manager on a push failure
                    None => break,
                }
            }

            inbound = read.next() => {
                last_inbound = Instant::now();
                awaiting_reply = false;
                match inbound {
                    Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                        if bounded_send(&mut write, Message::Text("pong".into()), keepalive)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = bounded_send(&mut write, Message::Pong(data), keepalive).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("viewer {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!("viewer {} error: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                if awaiting_reply {
                    tracing::info!("viewer {} unresponsive, terminating", addr);
                    break;
                }
                if bounded_send(&mut write, Message::Text("ping".into()), keepalive)
                    .await
                    .is_err()
                {
                    break;
                }
                awaiting_reply = true;
            }

            _ = async {
                let _ = shutdown.wait_for(|stop| *stop).await;
            } => break,
        }
    }

    manager.evict(session);
    let _ = bounded_send(&mut write, Message::Close(None), keepalive).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::create_shared_price_cache;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, price: rust_decimal::Decimal) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            change_24h_percent: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_push() {
        let cache = create_shared_price_cache();
        let manager = BroadcastManager::new(cache, Duration::from_secs(30));

        let (_first, mut rx1) = manager.register();
        let (_second, mut rx2) = manager.register();
        assert_eq!(manager.session_count(), 2);

        manager.push_update(&tick("BTCUSDT", dec!(50000)));

        for rx in [&mut rx1, &mut rx2] {
            let ViewerMessage::Update { data, .. } = rx.recv().await.unwrap() else {
                panic!("expected an update");
            };
            assert_eq!(data.symbol, "BTCUSDT");
        }
    }

    #[tokio::test]
    async fn test_eviction_is_idempotent() {
        let cache = create_shared_price_cache();
        let manager = BroadcastManager::new(cache, Duration::from_secs(30));

        let (session, _rx) = manager.register();
        manager.evict(session);
        manager.evict(session);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stuck_session_is_evicted_without_blocking() {
        let cache = create_shared_price_cache();
        let manager = BroadcastManager::new(cache, Duration::from_secs(30));

        // This session never drains its queue
        let (_stuck, rx_stuck) = manager.register();
        let (_live, mut rx_live) = manager.register();

        for i in 0..(SESSION_QUEUE_CAPACITY as i64 + 1) {
            manager.push_update(&tick("BTCUSDT", rust_decimal::Decimal::from(i)));
            // Keep the healthy session drained
            while rx_live.try_recv().is_ok() {}
        }

        // The overflowing session is gone, the healthy one remains
        assert_eq!(manager.session_count(), 1);
        drop(rx_stuck);

        manager.push_update(&tick("BTCUSDT", dec!(1)));
        assert!(rx_live.recv().await.is_some());
    }

    /// Never becomes ready to accept a frame, like a peer that stopped
    /// reading with a full kernel send buffer
    struct StuckSink;

    impl Sink<Message> for StuckSink {
        type Error = WsError;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _msg: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_unreadable_peer_is_bounded() {
        let mut sink = StuckSink;
        let sent = bounded_send(&mut sink, Message::Text("ping".into()), Duration::from_secs(30));
        // Resolves with an error instead of pending past the window
        assert!(sent.await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_covers_cached_symbols() {
        let cache = create_shared_price_cache();
        cache.update(tick("BTCUSDT", dec!(50000))).await;
        cache.update(tick("ETHUSDT", dec!(3000))).await;
        let manager = BroadcastManager::new(cache, Duration::from_secs(30));

        let ViewerMessage::Snapshot { data, .. } = manager.snapshot_message().await else {
            panic!("expected a snapshot");
        };
        assert_eq!(data.len(), 2);
        assert_eq!(data["ETHUSDT"].price, dec!(3000));
    }
}
