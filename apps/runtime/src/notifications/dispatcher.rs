use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::contracts::store::{ContractStore, ContractStoreError};
use crate::notifications::sink::NotificationSink;
use crate::notifications::types::NotificationPayloadV1;

const MAX_RETRY_BACKOFF_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct NotificationDispatcherConfig {
    pub interval_seconds: u64,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub retry_backoff_seconds: u64,
}

impl Default for NotificationDispatcherConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            batch_size: 50,
            max_attempts: 8,
            retry_backoff_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub attempted: u64,
    pub delivered: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Drains pending outbox rows into a sink. Delivery is at-least-once; a row
/// is retried with exponential backoff until `max_attempts` is reached.
#[derive(Clone)]
pub struct NotificationDispatcher {
    store: Arc<dyn ContractStore>,
    sink: Arc<dyn NotificationSink>,
    config: NotificationDispatcherConfig,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn ContractStore>,
        sink: Arc<dyn NotificationSink>,
        config: NotificationDispatcherConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    pub async fn dispatch_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, ContractStoreError> {
        let due = self
            .store
            .due_notifications(now, self.config.batch_size.clamp(1, 1_000))
            .await?;

        let mut outcome = DispatchOutcome::default();
        for row in due {
            outcome.attempted = outcome.attempted.saturating_add(1);
            let payload = NotificationPayloadV1::from(&row);
            match self.sink.deliver(&payload).await {
                Ok(()) => {
                    self.store
                        .mark_notification_delivered(row.notification_id.as_str(), now)
                        .await?;
                    outcome.delivered = outcome.delivered.saturating_add(1);
                }
                Err(error) => {
                    let attempts = row.attempts.saturating_add(1);
                    let retry_at = if error.is_retryable() && attempts < self.config.max_attempts {
                        Some(now + self.backoff(attempts))
                    } else {
                        None
                    };
                    self.store
                        .mark_notification_failed(
                            row.notification_id.as_str(),
                            error.to_string().as_str(),
                            retry_at,
                        )
                        .await?;
                    if retry_at.is_some() {
                        outcome.retried = outcome.retried.saturating_add(1);
                        tracing::warn!(
                            notification_id = %row.notification_id,
                            user_id = %row.user_id,
                            attempts,
                            reason = %error,
                            "notification delivery failed, will retry"
                        );
                    } else {
                        outcome.failed = outcome.failed.saturating_add(1);
                        tracing::error!(
                            notification_id = %row.notification_id,
                            user_id = %row.user_id,
                            attempts,
                            reason = %error,
                            "notification delivery abandoned"
                        );
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Runs `dispatch_due` on a fixed interval until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(StdDuration::from_secs(self.config.interval_seconds.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.dispatch_due(Utc::now()).await {
                    Ok(outcome) if outcome.attempted > 0 => {
                        tracing::debug!(
                            attempted = outcome.attempted,
                            delivered = outcome.delivered,
                            retried = outcome.retried,
                            failed = outcome.failed,
                            "notification dispatch pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(reason = %error, "notification dispatch pass failed");
                    }
                }
            }
        })
    }

    fn backoff(&self, attempts: i32) -> Duration {
        let base = i64::try_from(self.config.retry_backoff_seconds.max(1)).unwrap_or(1);
        let exponent = u32::try_from(attempts.saturating_sub(1).clamp(0, 16)).unwrap_or(0);
        let seconds = base
            .saturating_mul(2_i64.saturating_pow(exponent))
            .min(MAX_RETRY_BACKOFF_SECONDS);
        Duration::seconds(seconds)
    }
}
