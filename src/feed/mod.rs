//! Upstream market-data feed: Bybit protocol handling and the connection loop

pub mod bybit;
pub mod connector;

pub use bybit::{BybitFeed, FeedMessage};
pub use connector::{FeedConnector, FeedState};
