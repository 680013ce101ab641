use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;

use crate::contracts::types::{
    ContractRow, ContractStatusV1, DuplicateKey, ReviewRow, ReviewSlotV1,
};
use crate::db::EscrowDb;
use crate::notifications::types::{NotificationRow, NotificationStatusV1};

const ACTIVE_OFFER_REF_INDEX: &str = "contracts_active_offer_ref_uniq";
const ACTIVE_LEGACY_KEY_INDEX: &str = "contracts_active_legacy_key_uniq";

#[derive(Debug, thiserror::Error)]
pub enum ContractStoreError {
    #[error("duplicate active contract: {0}")]
    DuplicateActive(String),
    #[error("contract is not active: {0}")]
    NotActive(String),
    #[error("review slot already filled: {0}")]
    ReviewSlotTaken(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Persists a new active contract together with its first notification.
    /// Fails with `DuplicateActive` when another active contract shares its
    /// duplicate key.
    async fn insert_contract(
        &self,
        contract: ContractRow,
        notification: NotificationRow,
    ) -> Result<ContractRow, ContractStoreError>;

    async fn get_contract(
        &self,
        contract_id: &str,
    ) -> Result<Option<ContractRow>, ContractStoreError>;

    async fn find_active_contract(
        &self,
        key: &DuplicateKey,
    ) -> Result<Option<ContractRow>, ContractStoreError>;

    async fn list_contracts_for_party(
        &self,
        account_id: &str,
    ) -> Result<Vec<ContractRow>, ContractStoreError>;

    /// Sets `completed_by_provider`. The bool is false when the flag was
    /// already set, in which case no notification is written.
    async fn mark_delivered(
        &self,
        contract_id: &str,
        now: DateTime<Utc>,
        notification: NotificationRow,
    ) -> Result<(ContractRow, bool), ContractStoreError>;

    /// Compare-and-set `active -> completed`. Exactly one caller succeeds;
    /// every other one gets `NotActive`.
    async fn complete_contract(
        &self,
        contract_id: &str,
        release_posting_id: &str,
        now: DateTime<Utc>,
        notification: NotificationRow,
    ) -> Result<ContractRow, ContractStoreError>;

    async fn insert_review(
        &self,
        review: ReviewRow,
        slot: ReviewSlotV1,
        notification: NotificationRow,
    ) -> Result<(ReviewRow, ContractRow), ContractStoreError>;

    async fn list_reviews(&self, contract_id: &str) -> Result<Vec<ReviewRow>, ContractStoreError>;

    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, ContractStoreError>;

    async fn mark_notification_delivered(
        &self,
        notification_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ContractStoreError>;

    /// Records a failed attempt. `retry_at = None` parks the row as `failed`.
    async fn mark_notification_failed(
        &self,
        notification_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), ContractStoreError>;

    async fn list_notifications_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationRow>, ContractStoreError>;

    async fn list_notifications_by_status(
        &self,
        status: NotificationStatusV1,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, ContractStoreError>;
}

pub fn memory() -> Arc<dyn ContractStore> {
    Arc::new(MemoryContractStore::default())
}

pub fn postgres(db: Arc<EscrowDb>) -> Arc<dyn ContractStore> {
    Arc::new(PostgresContractStore { db })
}

#[derive(Default)]
struct MemoryContractStore {
    inner: Mutex<MemoryContractStoreInner>,
}

#[derive(Default)]
struct MemoryContractStoreInner {
    contracts: HashMap<String, ContractRow>,
    reviews: Vec<ReviewRow>,
    notifications: Vec<NotificationRow>,
}

impl MemoryContractStoreInner {
    fn active_by_key(&self, key: &DuplicateKey) -> Option<&ContractRow> {
        self.contracts
            .values()
            .filter(|contract| contract.is_active())
            .find(|contract| &DuplicateKey::for_contract(contract) == key)
    }

    fn notification_mut(
        &mut self,
        notification_id: &str,
    ) -> Result<&mut NotificationRow, ContractStoreError> {
        self.notifications
            .iter_mut()
            .find(|row| row.notification_id == notification_id)
            .ok_or_else(|| ContractStoreError::NotFound("notification".to_string()))
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn insert_contract(
        &self,
        contract: ContractRow,
        notification: NotificationRow,
    ) -> Result<ContractRow, ContractStoreError> {
        let mut inner = self.inner.lock().await;
        if inner.contracts.contains_key(contract.contract_id.as_str()) {
            return Err(ContractStoreError::Conflict(
                "contract_id already exists".to_string(),
            ));
        }
        if let Some(existing) = inner.active_by_key(&DuplicateKey::for_contract(&contract)) {
            return Err(ContractStoreError::DuplicateActive(
                existing.contract_id.clone(),
            ));
        }
        inner
            .contracts
            .insert(contract.contract_id.clone(), contract.clone());
        inner.notifications.push(notification);
        Ok(contract)
    }

    async fn get_contract(
        &self,
        contract_id: &str,
    ) -> Result<Option<ContractRow>, ContractStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.contracts.get(contract_id).cloned())
    }

    async fn find_active_contract(
        &self,
        key: &DuplicateKey,
    ) -> Result<Option<ContractRow>, ContractStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.active_by_key(key).cloned())
    }

    async fn list_contracts_for_party(
        &self,
        account_id: &str,
    ) -> Result<Vec<ContractRow>, ContractStoreError> {
        let inner = self.inner.lock().await;
        let mut rows = inner
            .contracts
            .values()
            .filter(|contract| contract.is_party(account_id))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.contract_id.cmp(&b.contract_id))
        });
        Ok(rows)
    }

    async fn mark_delivered(
        &self,
        contract_id: &str,
        now: DateTime<Utc>,
        notification: NotificationRow,
    ) -> Result<(ContractRow, bool), ContractStoreError> {
        let mut inner = self.inner.lock().await;
        let contract = inner
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractStoreError::NotFound("contract".to_string()))?;
        if !contract.is_active() {
            return Err(ContractStoreError::NotActive(contract_id.to_string()));
        }
        if contract.completed_by_provider {
            return Ok((contract.clone(), false));
        }
        contract.completed_by_provider = true;
        contract.updated_at = now;
        let out = contract.clone();
        inner.notifications.push(notification);
        Ok((out, true))
    }

    async fn complete_contract(
        &self,
        contract_id: &str,
        release_posting_id: &str,
        now: DateTime<Utc>,
        notification: NotificationRow,
    ) -> Result<ContractRow, ContractStoreError> {
        let mut inner = self.inner.lock().await;
        let contract = inner
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractStoreError::NotFound("contract".to_string()))?;
        if !contract.is_active() {
            return Err(ContractStoreError::NotActive(contract_id.to_string()));
        }
        contract.status = ContractStatusV1::Completed.as_str().to_string();
        contract.completed_by_client = true;
        contract.release_posting_id = Some(release_posting_id.to_string());
        contract.updated_at = now;
        contract.completed_at = Some(now);
        let out = contract.clone();
        inner.notifications.push(notification);
        Ok(out)
    }

    async fn insert_review(
        &self,
        review: ReviewRow,
        slot: ReviewSlotV1,
        notification: NotificationRow,
    ) -> Result<(ReviewRow, ContractRow), ContractStoreError> {
        let mut inner = self.inner.lock().await;
        let contract = inner
            .contracts
            .get_mut(review.contract_id.as_str())
            .ok_or_else(|| ContractStoreError::NotFound("contract".to_string()))?;
        if contract.review_slot(slot).is_some() {
            return Err(ContractStoreError::ReviewSlotTaken(slot.as_str().to_string()));
        }
        match slot {
            ReviewSlotV1::Provider => contract.review_by_provider_id = Some(review.review_id.clone()),
            ReviewSlotV1::Client => contract.review_by_client_id = Some(review.review_id.clone()),
        }
        contract.updated_at = review.created_at;
        let contract = contract.clone();
        inner.reviews.push(review.clone());
        inner.notifications.push(notification);
        Ok((review, contract))
    }

    async fn list_reviews(&self, contract_id: &str) -> Result<Vec<ReviewRow>, ContractStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .reviews
            .iter()
            .filter(|review| review.contract_id == contract_id)
            .cloned()
            .collect())
    }

    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, ContractStoreError> {
        let inner = self.inner.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let mut due = inner
            .notifications
            .iter()
            .filter(|row| {
                row.status == NotificationStatusV1::Pending.as_str() && row.next_attempt_at <= now
            })
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by(|a, b| {
            a.next_attempt_at
                .cmp(&b.next_attempt_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_notification_delivered(
        &self,
        notification_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ContractStoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner.notification_mut(notification_id)?;
        row.status = NotificationStatusV1::Delivered.as_str().to_string();
        row.attempts = row.attempts.saturating_add(1);
        row.delivered_at = Some(now);
        Ok(())
    }

    async fn mark_notification_failed(
        &self,
        notification_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), ContractStoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner.notification_mut(notification_id)?;
        row.attempts = row.attempts.saturating_add(1);
        row.last_error = Some(error.to_string());
        match retry_at {
            Some(at) => row.next_attempt_at = at,
            None => row.status = NotificationStatusV1::Failed.as_str().to_string(),
        }
        Ok(())
    }

    async fn list_notifications_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationRow>, ContractStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .notifications
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_notifications_by_status(
        &self,
        status: NotificationStatusV1,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, ContractStoreError> {
        let inner = self.inner.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(inner
            .notifications
            .iter()
            .filter(|row| row.status == status.as_str())
            .take(limit)
            .cloned()
            .collect())
    }
}

struct PostgresContractStore {
    db: Arc<EscrowDb>,
}

fn map_insert_error(error: tokio_postgres::Error, contract_id: &str) -> ContractStoreError {
    if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let constraint = error
            .as_db_error()
            .and_then(|db_error| db_error.constraint())
            .unwrap_or_default();
        if constraint == ACTIVE_OFFER_REF_INDEX || constraint == ACTIVE_LEGACY_KEY_INDEX {
            return ContractStoreError::DuplicateActive(contract_id.to_string());
        }
        return ContractStoreError::Conflict(format!("unique violation on {constraint}"));
    }
    ContractStoreError::Db(error.to_string())
}

async fn insert_notification(
    tx: &tokio_postgres::Transaction<'_>,
    notification: &NotificationRow,
) -> Result<(), ContractStoreError> {
    tx.execute(
        r#"
        INSERT INTO marketplace.notifications (
            notification_id, user_id, title, description, status, attempts, last_error,
            created_at, next_attempt_at, delivered_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        "#,
        &[
            &notification.notification_id,
            &notification.user_id,
            &notification.title,
            &notification.description,
            &notification.status,
            &notification.attempts,
            &notification.last_error,
            &notification.created_at,
            &notification.next_attempt_at,
            &notification.delivered_at,
        ],
    )
    .await
    .map_err(|error| ContractStoreError::Db(error.to_string()))?;
    Ok(())
}

async fn lock_contract(
    tx: &tokio_postgres::Transaction<'_>,
    contract_id: &str,
) -> Result<ContractRow, ContractStoreError> {
    let row = tx
        .query_opt(
            r#"
            SELECT contract_id, title, description, price, provider_id, client_id, brief_id,
                   offer_ref, status, completed_by_provider, completed_by_client,
                   review_by_provider_id, review_by_client_id, escrow_posting_id,
                   release_posting_id, created_at, updated_at, completed_at
              FROM marketplace.contracts
             WHERE contract_id = $1
             FOR UPDATE
            "#,
            &[&contract_id],
        )
        .await
        .map_err(|error| ContractStoreError::Db(error.to_string()))?
        .ok_or_else(|| ContractStoreError::NotFound("contract".to_string()))?;
    map_contract_row(&row).map_err(ContractStoreError::Db)
}

#[async_trait]
impl ContractStore for PostgresContractStore {
    async fn insert_contract(
        &self,
        contract: ContractRow,
        notification: NotificationRow,
    ) -> Result<ContractRow, ContractStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO marketplace.contracts (
                contract_id, title, description, price, provider_id, client_id, brief_id,
                offer_ref, status, completed_by_provider, completed_by_client,
                review_by_provider_id, review_by_client_id, escrow_posting_id,
                release_posting_id, created_at, updated_at, completed_at
            ) VALUES (
                $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18
            )
            "#,
            &[
                &contract.contract_id,
                &contract.title,
                &contract.description,
                &contract.price,
                &contract.provider_id,
                &contract.client_id,
                &contract.brief_id,
                &contract.offer_ref,
                &contract.status,
                &contract.completed_by_provider,
                &contract.completed_by_client,
                &contract.review_by_provider_id,
                &contract.review_by_client_id,
                &contract.escrow_posting_id,
                &contract.release_posting_id,
                &contract.created_at,
                &contract.updated_at,
                &contract.completed_at,
            ],
        )
        .await
        .map_err(|error| map_insert_error(error, contract.contract_id.as_str()))?;

        insert_notification(&tx, &notification).await?;

        tx.commit()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        Ok(contract)
    }

    async fn get_contract(
        &self,
        contract_id: &str,
    ) -> Result<Option<ContractRow>, ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT contract_id, title, description, price, provider_id, client_id, brief_id,
                       offer_ref, status, completed_by_provider, completed_by_client,
                       review_by_provider_id, review_by_client_id, escrow_posting_id,
                       release_posting_id, created_at, updated_at, completed_at
                  FROM marketplace.contracts
                 WHERE contract_id = $1
                "#,
                &[&contract_id],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_contract_row)
            .transpose()
            .map_err(ContractStoreError::Db)
    }

    async fn find_active_contract(
        &self,
        key: &DuplicateKey,
    ) -> Result<Option<ContractRow>, ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = match key {
            DuplicateKey::OfferRef(offer_ref) => client
                .query_opt(
                    r#"
                    SELECT contract_id, title, description, price, provider_id, client_id, brief_id,
                           offer_ref, status, completed_by_provider, completed_by_client,
                           review_by_provider_id, review_by_client_id, escrow_posting_id,
                           release_posting_id, created_at, updated_at, completed_at
                      FROM marketplace.contracts
                     WHERE offer_ref = $1 AND status = 'active'
                     LIMIT 1
                    "#,
                    &[offer_ref],
                )
                .await,
            DuplicateKey::Legacy {
                title,
                provider_id,
                client_id,
            } => client
                .query_opt(
                    r#"
                    SELECT contract_id, title, description, price, provider_id, client_id, brief_id,
                           offer_ref, status, completed_by_provider, completed_by_client,
                           review_by_provider_id, review_by_client_id, escrow_posting_id,
                           release_posting_id, created_at, updated_at, completed_at
                      FROM marketplace.contracts
                     WHERE title = $1 AND provider_id = $2 AND client_id = $3
                       AND offer_ref IS NULL AND status = 'active'
                     LIMIT 1
                    "#,
                    &[title, provider_id, client_id],
                )
                .await,
        }
        .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_contract_row)
            .transpose()
            .map_err(ContractStoreError::Db)
    }

    async fn list_contracts_for_party(
        &self,
        account_id: &str,
    ) -> Result<Vec<ContractRow>, ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT contract_id, title, description, price, provider_id, client_id, brief_id,
                       offer_ref, status, completed_by_provider, completed_by_client,
                       review_by_provider_id, review_by_client_id, escrow_posting_id,
                       release_posting_id, created_at, updated_at, completed_at
                  FROM marketplace.contracts
                 WHERE provider_id = $1 OR client_id = $1
                 ORDER BY created_at ASC, contract_id ASC
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_contract_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ContractStoreError::Db)
    }

    async fn mark_delivered(
        &self,
        contract_id: &str,
        now: DateTime<Utc>,
        notification: NotificationRow,
    ) -> Result<(ContractRow, bool), ContractStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        let mut contract = lock_contract(&tx, contract_id).await?;
        if !contract.is_active() {
            return Err(ContractStoreError::NotActive(contract_id.to_string()));
        }
        if contract.completed_by_provider {
            tx.commit()
                .await
                .map_err(|error| ContractStoreError::Db(error.to_string()))?;
            return Ok((contract, false));
        }

        tx.execute(
            r#"
            UPDATE marketplace.contracts
               SET completed_by_provider = TRUE, updated_at = $2
             WHERE contract_id = $1
            "#,
            &[&contract_id, &now],
        )
        .await
        .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        insert_notification(&tx, &notification).await?;

        tx.commit()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        contract.completed_by_provider = true;
        contract.updated_at = now;
        Ok((contract, true))
    }

    async fn complete_contract(
        &self,
        contract_id: &str,
        release_posting_id: &str,
        now: DateTime<Utc>,
        notification: NotificationRow,
    ) -> Result<ContractRow, ContractStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        let updated = tx
            .query_opt(
                r#"
                UPDATE marketplace.contracts
                   SET status = 'completed',
                       completed_by_client = TRUE,
                       release_posting_id = $2,
                       updated_at = $3,
                       completed_at = $3
                 WHERE contract_id = $1 AND status = 'active'
                RETURNING contract_id, title, description, price, provider_id, client_id, brief_id,
                          offer_ref, status, completed_by_provider, completed_by_client,
                          review_by_provider_id, review_by_client_id, escrow_posting_id,
                          release_posting_id, created_at, updated_at, completed_at
                "#,
                &[&contract_id, &release_posting_id, &now],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        let Some(row) = updated else {
            let exists = tx
                .query_opt(
                    "SELECT 1 FROM marketplace.contracts WHERE contract_id = $1",
                    &[&contract_id],
                )
                .await
                .map_err(|error| ContractStoreError::Db(error.to_string()))?;
            if exists.is_none() {
                return Err(ContractStoreError::NotFound("contract".to_string()));
            }
            return Err(ContractStoreError::NotActive(contract_id.to_string()));
        };
        let contract = map_contract_row(&row).map_err(ContractStoreError::Db)?;
        insert_notification(&tx, &notification).await?;

        tx.commit()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        Ok(contract)
    }

    async fn insert_review(
        &self,
        review: ReviewRow,
        slot: ReviewSlotV1,
        notification: NotificationRow,
    ) -> Result<(ReviewRow, ContractRow), ContractStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        let mut contract = lock_contract(&tx, review.contract_id.as_str()).await?;
        if contract.review_slot(slot).is_some() {
            return Err(ContractStoreError::ReviewSlotTaken(slot.as_str().to_string()));
        }

        tx.execute(
            r#"
            INSERT INTO marketplace.reviews (
                review_id, contract_id, reviewer_id, reviewee_id, rating, comment, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
            &[
                &review.review_id,
                &review.contract_id,
                &review.reviewer_id,
                &review.reviewee_id,
                &review.rating,
                &review.comment,
                &review.created_at,
            ],
        )
        .await
        .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        let statement = match slot {
            ReviewSlotV1::Provider => {
                r#"
                UPDATE marketplace.contracts
                   SET review_by_provider_id = $2, updated_at = $3
                 WHERE contract_id = $1
                "#
            }
            ReviewSlotV1::Client => {
                r#"
                UPDATE marketplace.contracts
                   SET review_by_client_id = $2, updated_at = $3
                 WHERE contract_id = $1
                "#
            }
        };
        tx.execute(
            statement,
            &[&review.contract_id, &review.review_id, &review.created_at],
        )
        .await
        .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        insert_notification(&tx, &notification).await?;

        tx.commit()
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;

        match slot {
            ReviewSlotV1::Provider => contract.review_by_provider_id = Some(review.review_id.clone()),
            ReviewSlotV1::Client => contract.review_by_client_id = Some(review.review_id.clone()),
        }
        contract.updated_at = review.created_at;
        Ok((review, contract))
    }

    async fn list_reviews(&self, contract_id: &str) -> Result<Vec<ReviewRow>, ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT review_id, contract_id, reviewer_id, reviewee_id, rating, comment, created_at
                  FROM marketplace.reviews
                 WHERE contract_id = $1
                 ORDER BY created_at ASC
                "#,
                &[&contract_id],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_review_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ContractStoreError::Db)
    }

    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT notification_id, user_id, title, description, status, attempts, last_error,
                       created_at, next_attempt_at, delivered_at
                  FROM marketplace.notifications
                 WHERE status = 'pending' AND next_attempt_at <= $1
                 ORDER BY next_attempt_at ASC, created_at ASC
                 LIMIT $2
                "#,
                &[&now, &limit],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_notification_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ContractStoreError::Db)
    }

    async fn mark_notification_delivered(
        &self,
        notification_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE marketplace.notifications
                   SET status = 'delivered', attempts = attempts + 1, delivered_at = $2
                 WHERE notification_id = $1
                "#,
                &[&notification_id, &now],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(ContractStoreError::NotFound("notification".to_string()));
        }
        Ok(())
    }

    async fn mark_notification_failed(
        &self,
        notification_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE marketplace.notifications
                   SET attempts = attempts + 1,
                       last_error = $2,
                       status = CASE WHEN $3::timestamptz IS NULL THEN 'failed' ELSE status END,
                       next_attempt_at = COALESCE($3, next_attempt_at)
                 WHERE notification_id = $1
                "#,
                &[&notification_id, &error, &retry_at],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(ContractStoreError::NotFound("notification".to_string()));
        }
        Ok(())
    }

    async fn list_notifications_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationRow>, ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT notification_id, user_id, title, description, status, attempts, last_error,
                       created_at, next_attempt_at, delivered_at
                  FROM marketplace.notifications
                 WHERE user_id = $1
                 ORDER BY created_at ASC
                "#,
                &[&user_id],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_notification_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ContractStoreError::Db)
    }

    async fn list_notifications_by_status(
        &self,
        status: NotificationStatusV1,
        limit: i64,
    ) -> Result<Vec<NotificationRow>, ContractStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT notification_id, user_id, title, description, status, attempts, last_error,
                       created_at, next_attempt_at, delivered_at
                  FROM marketplace.notifications
                 WHERE status = $1
                 ORDER BY created_at ASC
                 LIMIT $2
                "#,
                &[&status.as_str(), &limit],
            )
            .await
            .map_err(|error| ContractStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_notification_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ContractStoreError::Db)
    }
}

fn map_contract_row(row: &tokio_postgres::Row) -> Result<ContractRow, String> {
    Ok(ContractRow {
        contract_id: row.try_get("contract_id").map_err(|e| e.to_string())?,
        title: row.try_get("title").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        price: row.try_get("price").map_err(|e| e.to_string())?,
        provider_id: row.try_get("provider_id").map_err(|e| e.to_string())?,
        client_id: row.try_get("client_id").map_err(|e| e.to_string())?,
        brief_id: row.try_get("brief_id").map_err(|e| e.to_string())?,
        offer_ref: row.try_get("offer_ref").map_err(|e| e.to_string())?,
        status: row.try_get("status").map_err(|e| e.to_string())?,
        completed_by_provider: row
            .try_get("completed_by_provider")
            .map_err(|e| e.to_string())?,
        completed_by_client: row
            .try_get("completed_by_client")
            .map_err(|e| e.to_string())?,
        review_by_provider_id: row
            .try_get("review_by_provider_id")
            .map_err(|e| e.to_string())?,
        review_by_client_id: row
            .try_get("review_by_client_id")
            .map_err(|e| e.to_string())?,
        escrow_posting_id: row
            .try_get("escrow_posting_id")
            .map_err(|e| e.to_string())?,
        release_posting_id: row
            .try_get("release_posting_id")
            .map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
        completed_at: row.try_get("completed_at").map_err(|e| e.to_string())?,
    })
}

fn map_review_row(row: &tokio_postgres::Row) -> Result<ReviewRow, String> {
    Ok(ReviewRow {
        review_id: row.try_get("review_id").map_err(|e| e.to_string())?,
        contract_id: row.try_get("contract_id").map_err(|e| e.to_string())?,
        reviewer_id: row.try_get("reviewer_id").map_err(|e| e.to_string())?,
        reviewee_id: row.try_get("reviewee_id").map_err(|e| e.to_string())?,
        rating: row.try_get("rating").map_err(|e| e.to_string())?,
        comment: row.try_get("comment").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}

fn map_notification_row(row: &tokio_postgres::Row) -> Result<NotificationRow, String> {
    Ok(NotificationRow {
        notification_id: row
            .try_get("notification_id")
            .map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        title: row.try_get("title").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        status: row.try_get("status").map_err(|e| e.to_string())?,
        attempts: row.try_get("attempts").map_err(|e| e.to_string())?,
        last_error: row.try_get("last_error").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        next_attempt_at: row
            .try_get("next_attempt_at")
            .map_err(|e| e.to_string())?,
        delivered_at: row.try_get("delivered_at").map_err(|e| e.to_string())?,
    })
}
