use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatusV1 {
    Pending,
    Delivered,
    Failed,
}

impl NotificationStatusV1 {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

/// Outbox row. Written in the same store operation as the lifecycle
/// transition that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRow {
    pub notification_id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl NotificationRow {
    pub fn pending(user_id: &str, title: &str, description: String, now: DateTime<Utc>) -> Self {
        Self {
            notification_id: format!("ntf_{}", Uuid::now_v7().simple()),
            user_id: user_id.to_string(),
            title: title.to_string(),
            description,
            status: NotificationStatusV1::Pending.as_str().to_string(),
            attempts: 0,
            last_error: None,
            created_at: now,
            next_attempt_at: now,
            delivered_at: None,
        }
    }
}

/// Body posted to the notification webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayloadV1 {
    pub notification_id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
}

impl From<&NotificationRow> for NotificationPayloadV1 {
    fn from(row: &NotificationRow) -> Self {
        Self {
            notification_id: row.notification_id.clone(),
            user_id: row.user_id.clone(),
            title: row.title.clone(),
            description: row.description.clone(),
        }
    }
}
