use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::IsolationLevel;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use crate::db::EscrowDb;
use crate::ledger::types::{AccountRow, LedgerEntryKindV1, LedgerEntryRow, LedgerPostingRow};

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient funds on {account_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        account_id: String,
        available: i64,
        requested: i64,
    },
    #[error("db error: {0}")]
    Db(String),
}

#[derive(Debug, Clone)]
pub struct LedgerLegInput {
    pub account_id: String,
    pub kind: LedgerEntryKindV1,
    /// Positive magnitude; the sign comes from `kind`.
    pub amount: i64,
    pub description: String,
    pub external_payment_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LedgerPostingInput {
    pub posting_id: String,
    pub idempotency_key: Option<String>,
    pub request_fingerprint_sha256: String,
    pub legs: Vec<LedgerLegInput>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn ensure_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRow>, LedgerStoreError>;

    async fn list_account_ids(&self) -> Result<Vec<String>, LedgerStoreError>;

    /// Applies every leg or none. Returns the stored posting and whether it was
    /// created by this call (false on an idempotent replay).
    async fn apply_posting(
        &self,
        posting: LedgerPostingInput,
    ) -> Result<(LedgerPostingRow, bool), LedgerStoreError>;

    async fn list_entries(&self, account_id: &str)
    -> Result<Vec<LedgerEntryRow>, LedgerStoreError>;

    /// Counters and entries for one account, read at a single point in time.
    async fn account_snapshot(
        &self,
        account_id: &str,
    ) -> Result<(Option<AccountRow>, Vec<LedgerEntryRow>), LedgerStoreError>;
}

pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::default())
}

pub fn postgres(db: Arc<EscrowDb>) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { db })
}

/// Applies `legs` to the locked account snapshots in `accounts`, returning the
/// entries to append. Fails without partial effects when any counter would go
/// negative.
fn stage_posting(
    accounts: &mut BTreeMap<String, AccountRow>,
    posting: &LedgerPostingInput,
) -> Result<Vec<LedgerEntryRow>, LedgerStoreError> {
    if posting.legs.is_empty() {
        return Err(LedgerStoreError::Conflict(
            "posting must carry at least one leg".to_string(),
        ));
    }

    let mut staged = accounts.clone();
    let mut entries = Vec::with_capacity(posting.legs.len());
    for leg in &posting.legs {
        if leg.amount <= 0 {
            return Err(LedgerStoreError::Conflict(
                "leg amount must be positive".to_string(),
            ));
        }
        let account = staged
            .get_mut(leg.account_id.as_str())
            .ok_or_else(|| LedgerStoreError::NotFound(format!("account {}", leg.account_id)))?;
        let effect = leg.kind.effect(leg.amount);
        let next_balance = account.balance.checked_add(effect.balance_delta);
        let next_escrow = account.escrow.checked_add(effect.escrow_delta);
        match (next_balance, next_escrow) {
            (Some(balance), _) if balance < 0 => {
                return Err(LedgerStoreError::InsufficientFunds {
                    account_id: leg.account_id.clone(),
                    available: account.balance,
                    requested: leg.amount,
                });
            }
            (_, Some(escrow)) if escrow < 0 => {
                return Err(LedgerStoreError::InsufficientFunds {
                    account_id: leg.account_id.clone(),
                    available: account.escrow,
                    requested: leg.amount,
                });
            }
            (Some(balance), Some(escrow)) => {
                account.balance = balance;
                account.escrow = escrow;
                account.updated_at = posting.created_at;
            }
            _ => {
                return Err(LedgerStoreError::Conflict(
                    "account counter overflow".to_string(),
                ));
            }
        }
        entries.push(LedgerEntryRow {
            entry_id: format!("lent_{}", Uuid::now_v7().simple()),
            posting_id: posting.posting_id.clone(),
            account_id: leg.account_id.clone(),
            signed_amount: effect.signed_amount,
            kind: leg.kind.as_str().to_string(),
            description: leg.description.clone(),
            external_payment_ref: leg.external_payment_ref.clone(),
            created_at: posting.created_at,
        });
    }

    *accounts = staged;
    Ok(entries)
}

fn touched_account_ids(posting: &LedgerPostingInput) -> Vec<String> {
    posting
        .legs
        .iter()
        .map(|leg| leg.account_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn idempotency_conflict() -> LedgerStoreError {
    LedgerStoreError::Conflict(
        "idempotency key reused with different posting parameters".to_string(),
    )
}

#[derive(Default)]
struct MemoryLedgerStore {
    inner: Mutex<MemoryLedgerStoreInner>,
}

#[derive(Default)]
struct MemoryLedgerStoreInner {
    accounts: HashMap<String, AccountRow>,
    entries: Vec<LedgerEntryRow>,
    postings: HashMap<String, LedgerPostingRow>,
    postings_by_key: HashMap<String, (String, String)>,
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountRow::empty(account_id, now));
        Ok(row.clone())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(account_id).cloned())
    }

    async fn list_account_ids(&self) -> Result<Vec<String>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        let mut ids = inner.accounts.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    async fn apply_posting(
        &self,
        posting: LedgerPostingInput,
    ) -> Result<(LedgerPostingRow, bool), LedgerStoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(key) = posting.idempotency_key.as_deref() {
            if let Some((posting_id, fingerprint)) = inner.postings_by_key.get(key).cloned() {
                if fingerprint != posting.request_fingerprint_sha256 {
                    return Err(idempotency_conflict());
                }
                let existing = inner
                    .postings
                    .get(posting_id.as_str())
                    .cloned()
                    .ok_or_else(|| LedgerStoreError::NotFound("posting".to_string()))?;
                return Ok((existing, false));
            }
        }

        let mut locked = BTreeMap::new();
        for account_id in touched_account_ids(&posting) {
            let row = inner
                .accounts
                .get(account_id.as_str())
                .cloned()
                .unwrap_or_else(|| AccountRow::empty(account_id.as_str(), posting.created_at));
            locked.insert(account_id, row);
        }

        let entries = stage_posting(&mut locked, &posting)?;

        for (account_id, row) in locked {
            inner.accounts.insert(account_id, row);
        }
        inner.entries.extend(entries.iter().cloned());
        let row = LedgerPostingRow {
            posting_id: posting.posting_id.clone(),
            idempotency_key: posting.idempotency_key.clone(),
            entries,
            created_at: posting.created_at,
        };
        if let Some(key) = posting.idempotency_key {
            inner.postings_by_key.insert(
                key,
                (
                    posting.posting_id.clone(),
                    posting.request_fingerprint_sha256,
                ),
            );
        }
        inner.postings.insert(posting.posting_id, row.clone());
        Ok((row, true))
    }

    async fn list_entries(
        &self,
        account_id: &str,
    ) -> Result<Vec<LedgerEntryRow>, LedgerStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn account_snapshot(
        &self,
        account_id: &str,
    ) -> Result<(Option<AccountRow>, Vec<LedgerEntryRow>), LedgerStoreError> {
        let inner = self.inner.lock().await;
        let account = inner.accounts.get(account_id).cloned();
        let entries = inner
            .entries
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .cloned()
            .collect();
        Ok((account, entries))
    }
}

struct PostgresLedgerStore {
    db: Arc<EscrowDb>,
}

fn map_db_error(error: tokio_postgres::Error) -> LedgerStoreError {
    if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return idempotency_conflict();
    }
    LedgerStoreError::Db(error.to_string())
}

async fn load_posting(
    tx: &tokio_postgres::Transaction<'_>,
    posting_id: &str,
) -> Result<LedgerPostingRow, LedgerStoreError> {
    let header = tx
        .query_opt(
            r#"
            SELECT posting_id, idempotency_key, created_at
              FROM marketplace.ledger_postings
             WHERE posting_id = $1
            "#,
            &[&posting_id],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?
        .ok_or_else(|| LedgerStoreError::NotFound("posting".to_string()))?;

    let rows = tx
        .query(
            r#"
            SELECT entry_id, posting_id, account_id, signed_amount, kind, description,
                   external_payment_ref, created_at
              FROM marketplace.ledger_entries
             WHERE posting_id = $1
             ORDER BY entry_seq ASC
            "#,
            &[&posting_id],
        )
        .await
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
    let entries = rows
        .iter()
        .map(map_entry_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerStoreError::Db)?;

    Ok(LedgerPostingRow {
        posting_id: header
            .try_get("posting_id")
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?,
        idempotency_key: header
            .try_get("idempotency_key")
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?,
        entries,
        created_at: header
            .try_get("created_at")
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?,
    })
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn ensure_account(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccountRow, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO marketplace.wallet_accounts (account_id, balance, escrow, created_at, updated_at)
                VALUES ($1, 0, 0, $2, $2)
                ON CONFLICT (account_id) DO NOTHING
                "#,
                &[&account_id, &now],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let row = client
            .query_one(
                r#"
                SELECT account_id, balance, escrow, created_at, updated_at
                  FROM marketplace.wallet_accounts
                 WHERE account_id = $1
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        map_account_row(&row).map_err(LedgerStoreError::Db)
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<AccountRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT account_id, balance, escrow, created_at, updated_at
                  FROM marketplace.wallet_accounts
                 WHERE account_id = $1
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_account_row)
            .transpose()
            .map_err(LedgerStoreError::Db)
    }

    async fn list_account_ids(&self) -> Result<Vec<String>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT account_id FROM marketplace.wallet_accounts ORDER BY account_id ASC",
                &[],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(|row| {
                row.try_get("account_id")
                    .map_err(|error| LedgerStoreError::Db(error.to_string()))
            })
            .collect()
    }

    async fn apply_posting(
        &self,
        posting: LedgerPostingInput,
    ) -> Result<(LedgerPostingRow, bool), LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        let account_ids = touched_account_ids(&posting);
        for account_id in &account_ids {
            tx.execute(
                r#"
                INSERT INTO marketplace.wallet_accounts (account_id, balance, escrow, created_at, updated_at)
                VALUES ($1, 0, 0, $2, $2)
                ON CONFLICT (account_id) DO NOTHING
                "#,
                &[account_id, &posting.created_at],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        }

        // Row locks are taken in account id order so two postings touching the
        // same pair of accounts cannot deadlock.
        let rows = tx
            .query(
                r#"
                SELECT account_id, balance, escrow, created_at, updated_at
                  FROM marketplace.wallet_accounts
                 WHERE account_id = ANY($1)
                 ORDER BY account_id ASC
                 FOR UPDATE
                "#,
                &[&account_ids],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let mut locked = BTreeMap::new();
        for row in &rows {
            let account = map_account_row(row).map_err(LedgerStoreError::Db)?;
            locked.insert(account.account_id.clone(), account);
        }

        if let Some(key) = posting.idempotency_key.as_deref() {
            let existing = tx
                .query_opt(
                    r#"
                    SELECT posting_id, request_fingerprint_sha256
                      FROM marketplace.ledger_postings
                     WHERE idempotency_key = $1
                    "#,
                    &[&key],
                )
                .await
                .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
            if let Some(row) = existing {
                let fingerprint: String = row
                    .try_get("request_fingerprint_sha256")
                    .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
                if fingerprint != posting.request_fingerprint_sha256 {
                    return Err(idempotency_conflict());
                }
                let posting_id: String = row
                    .try_get("posting_id")
                    .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
                let out = load_posting(&tx, posting_id.as_str()).await?;
                tx.commit()
                    .await
                    .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
                return Ok((out, false));
            }
        }

        let entries = stage_posting(&mut locked, &posting)?;

        tx.execute(
            r#"
            INSERT INTO marketplace.ledger_postings (
                posting_id, idempotency_key, request_fingerprint_sha256, created_at
            ) VALUES ($1, $2, $3, $4)
            "#,
            &[
                &posting.posting_id,
                &posting.idempotency_key,
                &posting.request_fingerprint_sha256,
                &posting.created_at,
            ],
        )
        .await
        .map_err(map_db_error)?;

        for entry in &entries {
            tx.execute(
                r#"
                INSERT INTO marketplace.ledger_entries (
                    entry_id, posting_id, account_id, signed_amount, kind, description,
                    external_payment_ref, created_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                "#,
                &[
                    &entry.entry_id,
                    &entry.posting_id,
                    &entry.account_id,
                    &entry.signed_amount,
                    &entry.kind,
                    &entry.description,
                    &entry.external_payment_ref,
                    &entry.created_at,
                ],
            )
            .await
            .map_err(map_db_error)?;
        }

        for account in locked.values() {
            tx.execute(
                r#"
                UPDATE marketplace.wallet_accounts
                   SET balance = $2, escrow = $3, updated_at = $4
                 WHERE account_id = $1
                "#,
                &[
                    &account.account_id,
                    &account.balance,
                    &account.escrow,
                    &account.updated_at,
                ],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        Ok((
            LedgerPostingRow {
                posting_id: posting.posting_id,
                idempotency_key: posting.idempotency_key,
                entries,
                created_at: posting.created_at,
            },
            true,
        ))
    }

    async fn list_entries(
        &self,
        account_id: &str,
    ) -> Result<Vec<LedgerEntryRow>, LedgerStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT entry_id, posting_id, account_id, signed_amount, kind, description,
                       external_payment_ref, created_at
                  FROM marketplace.ledger_entries
                 WHERE account_id = $1
                 ORDER BY entry_seq ASC
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_entry_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)
    }

    async fn account_snapshot(
        &self,
        account_id: &str,
    ) -> Result<(Option<AccountRow>, Vec<LedgerEntryRow>), LedgerStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        let account = tx
            .query_opt(
                r#"
                SELECT account_id, balance, escrow, created_at, updated_at
                  FROM marketplace.wallet_accounts
                 WHERE account_id = $1
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .as_ref()
            .map(map_account_row)
            .transpose()
            .map_err(LedgerStoreError::Db)?;
        let entries = tx
            .query(
                r#"
                SELECT entry_id, posting_id, account_id, signed_amount, kind, description,
                       external_payment_ref, created_at
                  FROM marketplace.ledger_entries
                 WHERE account_id = $1
                 ORDER BY entry_seq ASC
                "#,
                &[&account_id],
            )
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?
            .iter()
            .map(map_entry_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerStoreError::Db)?;
        tx.commit()
            .await
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        Ok((account, entries))
    }
}

fn map_account_row(row: &tokio_postgres::Row) -> Result<AccountRow, String> {
    Ok(AccountRow {
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        balance: row.try_get("balance").map_err(|e| e.to_string())?,
        escrow: row.try_get("escrow").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_entry_row(row: &tokio_postgres::Row) -> Result<LedgerEntryRow, String> {
    Ok(LedgerEntryRow {
        entry_id: row.try_get("entry_id").map_err(|e| e.to_string())?,
        posting_id: row.try_get("posting_id").map_err(|e| e.to_string())?,
        account_id: row.try_get("account_id").map_err(|e| e.to_string())?,
        signed_amount: row
            .try_get("signed_amount")
            .map_err(|e| e.to_string())?,
        kind: row.try_get("kind").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        external_payment_ref: row
            .try_get("external_payment_ref")
            .map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
    })
}
