use thiserror::Error;

/// Errors surfaced by the upstream feed connection
///
/// Every variant is recoverable: the connector logs it and either drops the
/// offending frame or tears the connection down and reconnects.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("connection closed by server")]
    Closed,
}

/// Errors reported by the external store collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    UserNotFound(u64),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Errors reported by notification channels
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
