use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One timestamped price observation for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_24h_percent: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Alert trigger condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    Above,
    Below,
}

impl AlertCondition {
    /// Boundary is inclusive in both directions
    pub fn is_met(&self, price: Decimal, target: Decimal) -> bool {
        match self {
            AlertCondition::Above => price >= target,
            AlertCondition::Below => price <= target,
        }
    }

    pub fn direction_word(&self) -> &'static str {
        match self {
            AlertCondition::Above => "above",
            AlertCondition::Below => "below",
        }
    }
}

/// A user-defined price alert
///
/// Created externally with `active=true, triggered=false`. The evaluation
/// engine only ever moves it through the trigger transition; reactivation
/// is the owning store's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub owner: u64,
    pub symbol: String,
    pub target_price: Decimal,
    pub condition: AlertCondition,
    pub active: bool,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_price: Option<Decimal>,
    pub notify_telegram: bool,
    pub notify_email: bool,
    pub note: Option<String>,
}

impl Alert {
    pub fn condition_met(&self, price: Decimal) -> bool {
        self.condition.is_met(price, self.target_price)
    }
}

/// Immutable snapshot appended once per successful trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerHistoryRecord {
    pub alert_id: u64,
    pub owner: u64,
    pub symbol: String,
    pub target_price: Decimal,
    pub triggered_price: Decimal,
    pub condition: AlertCondition,
    pub telegram_sent: bool,
    pub email_sent: bool,
    pub triggered_at: DateTime<Utc>,
}

/// Notification preferences held by the user directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPrefs {
    pub telegram_chat_id: Option<String>,
    pub telegram_enabled: bool,
    pub email: Option<String>,
    pub email_enabled: bool,
}

/// One persisted price observation, written in batches by the snapshotter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistoryRecord {
    pub symbol: String,
    pub price: Decimal,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl PriceHistoryRecord {
    pub fn from_tick(tick: &Tick, at: DateTime<Utc>) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            price: tick.price,
            high_24h: tick.high_24h,
            low_24h: tick.low_24h,
            volume_24h: tick.volume_24h,
            timestamp: at,
        }
    }
}

/// Messages pushed to downstream viewer sessions
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// Full state of the price cache, sent once on connect
    Snapshot {
        data: HashMap<String, Tick>,
        timestamp: DateTime<Utc>,
    },
    /// Single-symbol incremental update
    Update { data: Tick, timestamp: DateTime<Utc> },
}

// ============ Bybit API Types ============

/// Envelope around every inbound Bybit frame
#[derive(Debug, Deserialize)]
pub struct BybitFrame {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Ticker payload under `tickers.<SYMBOL>` topics
///
/// All numeric fields arrive as strings; `price24hPcnt` is a fraction,
/// displayed as a percentage (x 100).
#[derive(Debug, Deserialize)]
pub struct BybitTicker {
    pub symbol: String,
    #[serde(rename = "lastPrice", default)]
    pub last_price: Option<Decimal>,
    #[serde(rename = "highPrice24h", default)]
    pub high_price_24h: Option<Decimal>,
    #[serde(rename = "lowPrice24h", default)]
    pub low_price_24h: Option<Decimal>,
    #[serde(rename = "volume24h", default)]
    pub volume_24h: Option<Decimal>,
    #[serde(rename = "price24hPcnt", default)]
    pub price_24h_pcnt: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_condition_boundaries_inclusive() {
        assert!(AlertCondition::Above.is_met(dec!(100), dec!(100)));
        assert!(AlertCondition::Above.is_met(dec!(101), dec!(100)));
        assert!(!AlertCondition::Above.is_met(dec!(99.99), dec!(100)));

        assert!(AlertCondition::Below.is_met(dec!(100), dec!(100)));
        assert!(AlertCondition::Below.is_met(dec!(99), dec!(100)));
        assert!(!AlertCondition::Below.is_met(dec!(100.01), dec!(100)));
    }

    #[test]
    fn test_viewer_message_wire_shape() {
        let tick = Tick {
            symbol: "BTCUSDT".to_string(),
            price: dec!(50000.5),
            high_24h: None,
            low_24h: None,
            volume_24h: None,
            change_24h_percent: Some(dec!(2.5)),
            timestamp: Utc::now(),
        };
        let msg = ViewerMessage::Update {
            data: tick,
            timestamp: Utc::now(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["data"]["symbol"], "BTCUSDT");
        assert_eq!(json["data"]["price"], "50000.5");
        assert!(json["data"].get("high_24h").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_condition_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&AlertCondition::Above).unwrap(),
            "\"above\""
        );
        let c: AlertCondition = serde_json::from_str("\"below\"").unwrap();
        assert_eq!(c, AlertCondition::Below);
    }
}
