//! Bybit public spot WebSocket protocol

use crate::error::FeedError;
use crate::types::{BybitFrame, BybitTicker, Tick};
use chrono::Utc;
use rust_decimal_macros::dec;

/// Decoded inbound frames the connector acts on
#[derive(Debug)]
pub enum FeedMessage {
    Tick(Tick),
    SubscriptionAck {
        success: bool,
        ret_msg: Option<String>,
    },
}

#[derive(Clone)]
pub struct BybitFeed {
    url: String,
    symbols: Vec<String>,
}

impl BybitFeed {
    pub fn new(url: String, symbols: Vec<String>) -> Self {
        Self { url, symbols }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// One subscription request enumerating all configured symbols
    pub fn subscription_message(&self) -> String {
        let args: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("tickers.{}", s))
            .collect();

        serde_json::json!({
            "op": "subscribe",
            "args": args
        })
        .to_string()
    }

    /// Decode one inbound frame
    ///
    /// `Ok(None)` means the frame is valid but irrelevant (heartbeats, ticker
    /// deltas without a price). `Err` means the frame is malformed; the
    /// caller drops it and keeps streaming.
    pub fn parse_frame(&self, raw: &str) -> Result<Option<FeedMessage>, FeedError> {
        let frame: BybitFrame = serde_json::from_str(raw)?;

        if let Some(topic) = &frame.topic {
            if topic.starts_with("tickers.") {
                let ticker: BybitTicker =
                    serde_json::from_value(frame.data.unwrap_or(serde_json::Value::Null))?;

                // Delta frames may omit lastPrice; without it there is no tick
                let Some(price) = ticker.last_price else {
                    return Ok(None);
                };

                return Ok(Some(FeedMessage::Tick(Tick {
                    symbol: ticker.symbol,
                    price,
                    high_24h: ticker.high_price_24h,
                    low_24h: ticker.low_price_24h,
                    volume_24h: ticker.volume_24h,
                    // price24hPcnt is a fraction, displayed as a percentage
                    change_24h_percent: ticker.price_24h_pcnt.map(|p| p * dec!(100)),
                    timestamp: Utc::now(),
                })));
            }
            return Ok(None);
        }

        if frame.op.as_deref() == Some("subscribe") {
            return Ok(Some(FeedMessage::SubscriptionAck {
                success: frame.success.unwrap_or(false),
                ret_msg: frame.ret_msg,
            }));
        }

        Ok(None)
    }
}
