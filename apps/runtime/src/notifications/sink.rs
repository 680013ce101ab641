use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::notifications::types::NotificationPayloadV1;

#[derive(Debug, thiserror::Error)]
pub enum NotificationSinkError {
    /// Transport failure or server-side error; worth retrying.
    #[error("notification sink unavailable: {0}")]
    Unavailable(String),
    /// The receiver refused the payload; retrying will not help.
    #[error("notification sink rejected delivery: {0}")]
    Rejected(String),
}

impl NotificationSinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &NotificationPayloadV1)
    -> Result<(), NotificationSinkError>;
}

/// Posts notifications to a webhook owned by the messaging subsystem.
pub struct HttpNotificationSink {
    url: String,
    auth_token: Option<String>,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl HttpNotificationSink {
    pub fn new(
        url: Option<String>,
        auth_token: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self, NotificationSinkError> {
        let url = url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                NotificationSinkError::Unavailable("notification webhook url missing".to_string())
            })?
            .to_string();
        let auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        Ok(Self {
            url,
            auth_token,
            timeout_ms: timeout_ms.clamp(250, 120_000),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn deliver(
        &self,
        notification: &NotificationPayloadV1,
    ) -> Result<(), NotificationSinkError> {
        let mut request = self
            .client
            .post(self.url.as_str())
            .timeout(Duration::from_millis(self.timeout_ms))
            .header("x-request-id", notification.notification_id.as_str())
            .json(notification);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.header("authorization", format!("Bearer {token}"));
        }

        let resp = request.send().await.map_err(|error| {
            NotificationSinkError::Unavailable(format!("notification webhook transport error: {error}"))
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let json = resp.json::<Value>().await.unwrap_or(Value::Null);
        let code = json
            .pointer("/error/code")
            .or_else(|| json.pointer("/error"))
            .and_then(Value::as_str)
            .unwrap_or_else(|| status.as_str())
            .to_string();
        let message = format!("notification webhook returned {status}: {code}");
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(NotificationSinkError::Rejected(message));
        }
        Err(NotificationSinkError::Unavailable(message))
    }
}

/// Used when no webhook is configured. Deliveries only reach the log.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(
        &self,
        notification: &NotificationPayloadV1,
    ) -> Result<(), NotificationSinkError> {
        tracing::info!(
            notification_id = %notification.notification_id,
            user_id = %notification.user_id,
            title = %notification.title,
            "notification delivered to log sink"
        );
        Ok(())
    }
}
