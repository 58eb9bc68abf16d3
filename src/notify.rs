use crate::error::NotifyError;
use crate::store::{AlertStore, UserDirectory};
use crate::types::{Alert, NotificationPrefs, TriggerHistoryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Work item handed off by the claim winner
///
/// The dispatcher owns everything downstream of the committed trigger:
/// channel sends and the single history append carrying their outcomes.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub alert: Alert,
    pub triggered_price: Decimal,
    pub triggered_at: DateTime<Utc>,
}

/// One delivery mechanism (Telegram, email, ...)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Best-effort send; `Ok(false)` means the channel rejected the message
    async fn send(&self, recipient: &str, message: &str) -> Result<bool, NotifyError>;
}

/// Telegram Bot API channel
pub struct TelegramChannel {
    client: reqwest::Client,
    api_url: String,
}

impl TelegramChannel {
    pub fn new(bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: format!("https://api.telegram.org/bot{}/sendMessage", bot_token),
        }
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, recipient: &str, message: &str) -> Result<bool, NotifyError> {
        let response = self
            .client
            .post(&self.api_url)
            .json(&serde_json::json!({
                "chat_id": recipient,
                "text": message,
            }))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(true)
        } else {
            tracing::warn!(status = %response.status(), "telegram API rejected message");
            Ok(false)
        }
    }
}

/// Email channel placeholder; logs and reports undelivered
// TODO: wire up an SMTP or SES sender
pub struct EmailChannel;

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, recipient: &str, _message: &str) -> Result<bool, NotifyError> {
        tracing::info!(recipient, "email notifications not implemented, skipping");
        Ok(false)
    }
}

/// Deterministic trigger message: symbol, direction, target and triggered
/// price, optional user note
pub fn format_message(alert: &Alert, triggered_price: Decimal) -> String {
    let mut message = format!(
        "CryptoFlyt alert: {} is now {} your target\nTarget price: {}\nTriggered price: {}",
        alert.symbol,
        alert.condition.direction_word(),
        alert.target_price,
        triggered_price,
    );
    if let Some(note) = &alert.note {
        message.push_str("\nNote: ");
        message.push_str(note);
    }
    message
}

/// Best-effort multi-channel delivery, isolated per channel
pub struct NotificationDispatcher {
    store: Arc<dyn AlertStore>,
    directory: Arc<dyn UserDirectory>,
    telegram: Option<Arc<dyn NotificationChannel>>,
    email: Option<Arc<dyn NotificationChannel>>,
    channel_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn AlertStore>,
        directory: Arc<dyn UserDirectory>,
        telegram: Option<Arc<dyn NotificationChannel>>,
        email: Option<Arc<dyn NotificationChannel>>,
        channel_timeout: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            telegram,
            email,
            channel_timeout,
        }
    }

    /// Drain jobs until every sender is gone
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<NotificationJob>) {
        while let Some(job) = jobs.recv().await {
            self.dispatch(&job).await;
        }
        tracing::info!("notification dispatcher stopped");
    }

    /// Send on every enabled channel, then append the one history record
    /// with the delivery outcomes
    pub async fn dispatch(&self, job: &NotificationJob) {
        let prefs = match self.directory.notification_prefs(job.alert.owner).await {
            Ok(prefs) => prefs,
            Err(e) => {
                tracing::warn!(
                    owner = job.alert.owner,
                    error = %e,
                    "notification preferences unavailable, skipping sends"
                );
                NotificationPrefs::default()
            }
        };

        let message = format_message(&job.alert, job.triggered_price);

        let (telegram_sent, email_sent) = tokio::join!(
            self.send_telegram(&job.alert, &prefs, &message),
            self.send_email(&job.alert, &prefs, &message),
        );

        let record = TriggerHistoryRecord {
            alert_id: job.alert.id,
            owner: job.alert.owner,
            symbol: job.alert.symbol.clone(),
            target_price: job.alert.target_price,
            triggered_price: job.triggered_price,
            condition: job.alert.condition,
            telegram_sent,
            email_sent,
            triggered_at: job.triggered_at,
        };
        if let Err(e) = self.store.append_history(record).await {
            tracing::error!(alert = job.alert.id, error = %e, "history append failed");
        }
    }

    /// Channel is used only when both the alert flag and the owner's
    /// preference enable it
    async fn send_telegram(&self, alert: &Alert, prefs: &NotificationPrefs, message: &str) -> bool {
        if !alert.notify_telegram || !prefs.telegram_enabled {
            return false;
        }
        let Some(chat_id) = prefs.telegram_chat_id.as_deref() else {
            tracing::debug!(owner = alert.owner, "no telegram chat id on file");
            return false;
        };
        let Some(channel) = &self.telegram else {
            tracing::debug!("telegram channel not configured");
            return false;
        };
        self.send_bounded(channel.as_ref(), chat_id, message).await
    }

    async fn send_email(&self, alert: &Alert, prefs: &NotificationPrefs, message: &str) -> bool {
        if !alert.notify_email || !prefs.email_enabled {
            return false;
        }
        let Some(address) = prefs.email.as_deref() else {
            tracing::debug!(owner = alert.owner, "no email address on file");
            return false;
        };
        let Some(channel) = &self.email else {
            return false;
        };
        self.send_bounded(channel.as_ref(), address, message).await
    }

    async fn send_bounded(
        &self,
        channel: &dyn NotificationChannel,
        recipient: &str,
        message: &str,
    ) -> bool {
        match tokio::time::timeout(self.channel_timeout, channel.send(recipient, message)).await {
            Ok(Ok(delivered)) => {
                if delivered {
                    tracing::info!(channel = channel.name(), "notification delivered");
                }
                delivered
            }
            Ok(Err(e)) => {
                tracing::warn!(channel = channel.name(), error = %e, "notification send failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    channel = channel.name(),
                    timeout_secs = self.channel_timeout.as_secs(),
                    "notification send timed out"
                );
                false
            }
        }
    }
}
