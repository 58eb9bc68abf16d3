//! Owns the upstream WebSocket connection, with auto-reconnect

use super::bybit::{BybitFeed, FeedMessage};
use crate::bus::SharedTickBus;
use crate::cache::SharedPriceCache;
use crate::error::FeedError;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// Connection lifecycle, observable for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Stopped,
}

/// Long-lived feed task: decodes ticks, updates the cache, publishes on the
/// bus. The sole writer of the price cache.
pub struct FeedConnector {
    feed: BybitFeed,
    cache: SharedPriceCache,
    bus: SharedTickBus,
    reconnect_delay: Duration,
    shutdown: watch::Receiver<bool>,
    state_tx: watch::Sender<FeedState>,
    state_rx: watch::Receiver<FeedState>,
}

impl FeedConnector {
    pub fn new(
        feed: BybitFeed,
        cache: SharedPriceCache,
        bus: SharedTickBus,
        reconnect_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        Self {
            feed,
            cache,
            bus,
            reconnect_delay,
            shutdown,
            state_tx,
            state_rx,
        }
    }

    /// Watch the connection state; handy for health reporting and tests
    pub fn state(&self) -> watch::Receiver<FeedState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: FeedState) {
        tracing::debug!(?state, "feed state changed");
        let _ = self.state_tx.send(state);
    }

    /// Run until shutdown, reconnecting with a fixed delay after any
    /// transport failure or unexpected close
    pub async fn run(self) {
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(FeedState::Connecting);
            match self.connect_and_stream().await {
                Ok(()) => {
                    tracing::info!("feed connection closed on shutdown");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        delay_secs = self.reconnect_delay.as_secs(),
                        "feed connection lost, reconnecting after delay"
                    );
                }
            }
            self.set_state(FeedState::Disconnected);

            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => {}
            }
        }

        self.set_state(FeedState::Stopped);
        tracing::info!("feed connector stopped");
    }

    /// One connection attempt: connect, subscribe, stream until failure or
    /// shutdown. `Ok` means an explicit stop; every other exit is an error
    /// the outer loop retries.
    async fn connect_and_stream(&self) -> Result<(), FeedError> {
        let mut shutdown = self.shutdown.clone();

        tracing::info!(url = self.feed.url(), "connecting to feed");
        let (ws_stream, _) = connect_async(self.feed.url()).await?;
        let (mut write, mut read) = ws_stream.split();

        // Subscribe for all symbols at once; the acknowledgment is logged
        // when it arrives, not awaited before streaming begins.
        write
            .send(WsMessage::Text(self.feed.subscription_message().into()))
            .await?;
        self.set_state(FeedState::Subscribed);
        tracing::info!(symbols = ?self.feed.symbols(), "subscription request sent");
        self.set_state(FeedState::Streaming);

        loop {
            tokio::select! {
                _ = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => {
                    // Best-effort close; never let a stalled peer delay shutdown
                    let _ = tokio::time::timeout(
                        self.reconnect_delay,
                        write.send(WsMessage::Close(None)),
                    )
                    .await;
                    return Ok(());
                }
                inbound = read.next() => {
                    match inbound {
                        None => return Err(FeedError::Closed),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(WsMessage::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(WsMessage::Close(_))) => {
                            tracing::info!("feed closed by server");
                            return Err(FeedError::Closed);
                        }
                        // Heartbeats are answered by the transport layer
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Decode one text frame and apply it; malformed frames are dropped
    async fn handle_frame(&self, raw: &str) {
        match self.feed.parse_frame(raw) {
            Ok(Some(FeedMessage::Tick(tick))) => {
                self.cache.update(tick.clone()).await;
                self.bus.publish(&tick).await;
            }
            Ok(Some(FeedMessage::SubscriptionAck { success, ret_msg })) => {
                if success {
                    tracing::info!("feed subscription confirmed");
                } else {
                    tracing::warn!(reason = ?ret_msg, "feed subscription rejected");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed feed frame");
            }
        }
    }
}
