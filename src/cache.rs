use crate::types::Tick;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Latest-value price store, one entry per symbol
///
/// Single writer (the feed connector task), many readers. An `update`
/// replaces the whole entry for the symbol, so readers never observe a
/// half-written tick.
#[derive(Debug, Default)]
pub struct PriceCache {
    ticks: RwLock<HashMap<String, Tick>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the entry for `tick.symbol` (last write wins)
    pub async fn update(&self, tick: Tick) {
        self.ticks.write().await.insert(tick.symbol.clone(), tick);
    }

    /// Latest tick for a symbol, if one has been received
    pub async fn get(&self, symbol: &str) -> Option<Tick> {
        self.ticks.read().await.get(symbol).cloned()
    }

    /// Defensive copy of the whole cache, taken at a single instant
    ///
    /// Safe to iterate while the writer keeps applying ticks.
    pub async fn snapshot(&self) -> HashMap<String, Tick> {
        self.ticks.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.ticks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ticks.read().await.is_empty()
    }
}

/// Shared price cache wrapped for concurrent access
pub type SharedPriceCache = Arc<PriceCache>;

pub fn create_shared_price_cache() -> SharedPriceCache {
    Arc::new(PriceCache::new())
}
