use crate::error::StoreError;
use crate::types::{Alert, NotificationPrefs, PriceHistoryRecord, TriggerHistoryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

/// Alert storage consumed by the evaluation engine
///
/// `claim_trigger` is the safety-critical operation: it must be a single
/// atomic conditional transition (`triggered = true` iff it was false) so
/// that the event path and the periodic sweep racing on the same alert
/// produce exactly one winner. Implementations backed by a shared database
/// must map it to one conditional update, never a read-then-write pair.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// All alerts for `symbol` with `active=true, triggered=false`
    async fn list_active(&self, symbol: &str) -> Result<Vec<Alert>, StoreError>;

    /// Atomically claim the trigger transition; false means another caller
    /// already won (or the alert is gone), and the caller must take no
    /// further action for this alert.
    async fn claim_trigger(
        &self,
        alert_id: u64,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Append one immutable record for a successful trigger
    async fn append_history(&self, record: TriggerHistoryRecord) -> Result<(), StoreError>;
}

/// User directory consumed by the notification dispatcher
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn notification_prefs(&self, owner: u64) -> Result<NotificationPrefs, StoreError>;
}

/// Price history storage consumed by the snapshotter
#[async_trait]
pub trait PriceHistoryStore: Send + Sync {
    /// Append the whole batch or nothing; a failed batch is retried whole
    /// on the next snapshotter cycle.
    async fn append_batch(&self, records: Vec<PriceHistoryRecord>) -> Result<(), StoreError>;
}

/// In-process alert store
///
/// The claim is atomic because the whole transition happens under one lock.
/// Note this only holds within a single evaluating process. A poisoned lock
/// only means some holder panicked; every transition here is single-step,
/// so the data is still consistent and the store keeps serving.
#[derive(Default)]
pub struct MemoryAlertStore {
    alerts: Mutex<HashMap<u64, Alert>>,
    history: Mutex<Vec<TriggerHistoryRecord>>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, alert: Alert) {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).insert(alert.id, alert);
    }

    pub fn remove(&self, alert_id: u64) {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).remove(&alert_id);
    }

    pub fn alert(&self, alert_id: u64) -> Option<Alert> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).get(&alert_id).cloned()
    }

    pub fn history(&self) -> Vec<TriggerHistoryRecord> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn list_active(&self, symbol: &str) -> Result<Vec<Alert>, StoreError> {
        let alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(alerts
            .values()
            .filter(|a| a.symbol == symbol && a.active && !a.triggered)
            .cloned()
            .collect())
    }

    async fn claim_trigger(
        &self,
        alert_id: u64,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        match alerts.get_mut(&alert_id) {
            // A deleted alert is simply absent: nothing to claim
            None => Ok(false),
            Some(alert) if !alert.active || alert.triggered => Ok(false),
            Some(alert) => {
                alert.triggered = true;
                alert.triggered_at = Some(at);
                alert.triggered_price = Some(price);
                Ok(true)
            }
        }
    }

    async fn append_history(&self, record: TriggerHistoryRecord) -> Result<(), StoreError> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        Ok(())
    }
}

/// In-process user directory
#[derive(Default)]
pub struct MemoryUserDirectory {
    prefs: DashMap<u64, NotificationPrefs>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, owner: u64, prefs: NotificationPrefs) {
        self.prefs.insert(owner, prefs);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn notification_prefs(&self, owner: u64) -> Result<NotificationPrefs, StoreError> {
        self.prefs
            .get(&owner)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::UserNotFound(owner))
    }
}

/// In-process price history store
#[derive(Default)]
pub struct MemoryPriceHistoryStore {
    rows: Mutex<Vec<PriceHistoryRecord>>,
}

impl MemoryPriceHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<PriceHistoryRecord> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PriceHistoryStore for MemoryPriceHistoryStore {
    async fn append_batch(&self, records: Vec<PriceHistoryRecord>) -> Result<(), StoreError> {
        // One lock for the whole batch keeps it all-or-nothing
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).extend(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertCondition;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn alert(id: u64, symbol: &str) -> Alert {
        Alert {
            id,
            owner: 1,
            symbol: symbol.to_string(),
            target_price: dec!(49000),
            condition: AlertCondition::Above,
            active: true,
            triggered: false,
            triggered_at: None,
            triggered_price: None,
            notify_telegram: true,
            notify_email: false,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_list_active_filters() {
        let store = MemoryAlertStore::new();
        store.insert(alert(1, "BTCUSDT"));
        store.insert(alert(2, "ETHUSDT"));
        let mut inactive = alert(3, "BTCUSDT");
        inactive.active = false;
        store.insert(inactive);
        let mut fired = alert(4, "BTCUSDT");
        fired.triggered = true;
        store.insert(fired);

        let active = store.list_active("BTCUSDT").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);
    }

    #[tokio::test]
    async fn test_claim_wins_exactly_once() {
        let store = MemoryAlertStore::new();
        store.insert(alert(1, "BTCUSDT"));

        let now = Utc::now();
        assert!(store.claim_trigger(1, dec!(50000), now).await.unwrap());
        assert!(!store.claim_trigger(1, dec!(51000), now).await.unwrap());

        let stored = store.alert(1).unwrap();
        assert!(stored.triggered);
        assert_eq!(stored.triggered_price, Some(dec!(50000)));
        assert_eq!(stored.triggered_at, Some(now));
    }

    #[tokio::test]
    async fn test_claim_on_missing_or_inactive_alert() {
        let store = MemoryAlertStore::new();
        assert!(!store.claim_trigger(99, dec!(1), Utc::now()).await.unwrap());

        let mut disabled = alert(1, "BTCUSDT");
        disabled.active = false;
        store.insert(disabled);
        assert!(!store.claim_trigger(1, dec!(1), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryAlertStore::new());
        store.insert(alert(1, "BTCUSDT"));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_trigger(1, dec!(50000), Utc::now()).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_store_survives_a_poisoned_lock() {
        let store = Arc::new(MemoryAlertStore::new());
        store.insert(alert(1, "BTCUSDT"));

        // A holder dying mid-guard poisons the mutex
        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.alerts.lock().unwrap();
            panic!("holder died");
        })
        .join();

        assert_eq!(store.list_active("BTCUSDT").await.unwrap().len(), 1);
        assert!(store.claim_trigger(1, dec!(50000), Utc::now()).await.unwrap());
        assert!(store.alert(1).unwrap().triggered);
    }

    #[tokio::test]
    async fn test_history_batch_is_appended_whole() {
        let store = MemoryPriceHistoryStore::new();
        let rows = vec![
            PriceHistoryRecord {
                symbol: "BTCUSDT".to_string(),
                price: dec!(50000),
                high_24h: None,
                low_24h: None,
                volume_24h: None,
                timestamp: Utc::now(),
            },
            PriceHistoryRecord {
                symbol: "ETHUSDT".to_string(),
                price: dec!(3000),
                high_24h: None,
                low_24h: None,
                volume_24h: None,
                timestamp: Utc::now(),
            },
        ];
        store.append_batch(rows).await.unwrap();
        assert_eq!(store.rows().len(), 2);
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let directory = MemoryUserDirectory::new();
        directory.insert(
            7,
            NotificationPrefs {
                telegram_chat_id: Some("12345".to_string()),
                telegram_enabled: true,
                email: None,
                email_enabled: false,
            },
        );

        let prefs = directory.notification_prefs(7).await.unwrap();
        assert!(prefs.telegram_enabled);
        assert!(directory.notification_prefs(8).await.is_err());
    }
}
