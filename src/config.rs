use std::env;
use std::time::Duration;

const DEFAULT_SYMBOLS: &str = "BTCUSDT,ETHUSDT,SOLUSDT,XRPUSDT,DOGEUSDT";
const DEFAULT_FEED_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Runtime settings, read once from the environment at startup
#[derive(Debug, Clone)]
pub struct Settings {
    /// Trading pairs tracked by the feed connector
    pub symbols: Vec<String>,
    /// Bybit public spot WebSocket endpoint
    pub feed_url: String,
    /// Bind address for the viewer WebSocket server
    pub bind_addr: String,
    /// Delay between reconnect attempts after a feed failure
    pub reconnect_delay: Duration,
    /// Interval of the redundant alert sweep
    pub sweep_interval: Duration,
    /// Interval of the price history snapshotter
    pub snapshot_interval: Duration,
    /// Inbound-silence window before a viewer session is probed
    pub keepalive_interval: Duration,
    /// Per-channel notification send timeout
    pub channel_timeout: Duration,
    /// Telegram Bot API token; notifications are skipped when unset
    pub telegram_bot_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            symbols: env::var("SYMBOLS")
                .unwrap_or_else(|_| DEFAULT_SYMBOLS.to_string())
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
            feed_url: env::var("BYBIT_WS_URL").unwrap_or_else(|_| DEFAULT_FEED_URL.to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            reconnect_delay: duration_var("RECONNECT_DELAY_SECS", 5),
            sweep_interval: duration_var("SWEEP_INTERVAL_SECS", 60),
            snapshot_interval: duration_var("SNAPSHOT_INTERVAL_SECS", 300),
            keepalive_interval: duration_var("KEEPALIVE_INTERVAL_SECS", 30),
            channel_timeout: duration_var("CHANNEL_TIMEOUT_SECS", 10),
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbols: DEFAULT_SYMBOLS.split(',').map(str::to_string).collect(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            reconnect_delay: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(30),
            channel_timeout: Duration::from_secs(10),
            telegram_bot_token: None,
        }
    }
}

fn duration_var(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
