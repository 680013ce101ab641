use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ledger::store::{LedgerLegInput, LedgerPostingInput, LedgerStore, LedgerStoreError};
use crate::ledger::types::{
    AccountRow, LedgerEntryKindV1, LedgerEntryRow, LedgerPostingReceipt, LedgerProjection,
    ReconcileResponseV1, WALLET_RECONCILE_RESPONSE_SCHEMA_V1,
};

const MAX_ACCOUNT_ID_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 512;
const MAX_REFERENCE_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("insufficient funds on {account_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        account_id: String,
        available: u64,
        requested: u64,
    },
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::NotFound => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PersistenceFailure(_) => "persistence_failure",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::Conflict(message)
            | Self::PersistenceFailure(message) => message.clone(),
            Self::InsufficientFunds {
                available,
                requested,
                ..
            } => format!("insufficient funds: available {available}, requested {requested}"),
            Self::NotFound => "not found".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalletPolicyConfig {
    /// Upper bound for a single deposit, withdrawal or escrow movement.
    pub max_amount: u64,
}

impl Default for WalletPolicyConfig {
    fn default() -> Self {
        Self {
            max_amount: 1_000_000_000,
        }
    }
}

#[derive(Clone)]
pub struct WalletLedgerService {
    store: Arc<dyn LedgerStore>,
    policy: WalletPolicyConfig,
}

#[derive(Serialize)]
struct LegFingerprint<'a> {
    account_id: &'a str,
    kind: &'a str,
    amount: i64,
    description: &'a str,
    external_payment_ref: Option<&'a str>,
}

#[derive(Serialize)]
struct PostingFingerprint<'a> {
    legs: Vec<LegFingerprint<'a>>,
}

impl WalletLedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::new_with_policy(store, WalletPolicyConfig::default())
    }

    pub fn new_with_policy(store: Arc<dyn LedgerStore>, policy: WalletPolicyConfig) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &WalletPolicyConfig {
        &self.policy
    }

    pub async fn account(&self, account_id: &str) -> Result<AccountRow, LedgerError> {
        let account_id = normalize_account_id(account_id)?;
        self.store
            .ensure_account(account_id.as_str(), Utc::now())
            .await
            .map_err(map_store_error)
    }

    pub async fn entries(&self, account_id: &str) -> Result<Vec<LedgerEntryRow>, LedgerError> {
        let account_id = normalize_account_id(account_id)?;
        self.store
            .list_entries(account_id.as_str())
            .await
            .map_err(map_store_error)
    }

    pub async fn account_ids(&self) -> Result<Vec<String>, LedgerError> {
        self.store.list_account_ids().await.map_err(map_store_error)
    }

    /// Credits `amount` to the available balance. A present
    /// `external_payment_ref` doubles as the idempotency key.
    pub async fn deposit(
        &self,
        account_id: &str,
        amount: u64,
        description: &str,
        external_payment_ref: Option<&str>,
    ) -> Result<LedgerPostingReceipt, LedgerError> {
        let account_id = normalize_account_id(account_id)?;
        let amount = self.validate_amount(amount)?;
        let external_payment_ref = normalize_reference(external_payment_ref, "external_payment_ref")?;
        let idempotency_key = external_payment_ref
            .as_deref()
            .map(|reference| format!("deposit:{reference}"));
        let receipt = self
            .post(
                idempotency_key,
                vec![LedgerLegInput {
                    account_id: account_id.clone(),
                    kind: LedgerEntryKindV1::Deposit,
                    amount,
                    description: normalize_description(description, "deposit")?,
                    external_payment_ref,
                }],
            )
            .await?;
        if !receipt.replayed {
            tracing::info!(account_id = %account_id, amount, "wallet deposit posted");
        }
        Ok(receipt)
    }

    pub async fn withdraw(
        &self,
        account_id: &str,
        amount: u64,
        description: &str,
    ) -> Result<LedgerPostingReceipt, LedgerError> {
        let account_id = normalize_account_id(account_id)?;
        let amount = self.validate_amount(amount)?;
        let receipt = self
            .post(
                None,
                vec![LedgerLegInput {
                    account_id: account_id.clone(),
                    kind: LedgerEntryKindV1::Withdrawal,
                    amount,
                    description: normalize_description(description, "withdrawal")?,
                    external_payment_ref: None,
                }],
            )
            .await?;
        tracing::info!(account_id = %account_id, amount, "wallet withdrawal posted");
        Ok(receipt)
    }

    pub async fn move_to_escrow(
        &self,
        account_id: &str,
        amount: u64,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerPostingReceipt, LedgerError> {
        let account_id = normalize_account_id(account_id)?;
        let amount = self.validate_amount(amount)?;
        let idempotency_key = normalize_reference(idempotency_key, "idempotency_key")?;
        let receipt = self
            .post(
                idempotency_key,
                vec![LedgerLegInput {
                    account_id: account_id.clone(),
                    kind: LedgerEntryKindV1::EscrowPayment,
                    amount,
                    description: normalize_description(description, "escrow payment")?,
                    external_payment_ref: None,
                }],
            )
            .await?;
        tracing::info!(
            account_id = %account_id,
            amount,
            replayed = receipt.replayed,
            "funds moved to escrow"
        );
        Ok(receipt)
    }

    /// Pays `amount` out of `payer`'s escrow into `payee`'s balance as a single
    /// posting.
    pub async fn release_escrow(
        &self,
        payer_id: &str,
        payee_id: &str,
        amount: u64,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerPostingReceipt, LedgerError> {
        let payer_id = normalize_account_id(payer_id)?;
        let payee_id = normalize_account_id(payee_id)?;
        if payer_id == payee_id {
            return Err(LedgerError::InvalidRequest(
                "payer and payee must differ".to_string(),
            ));
        }
        let amount = self.validate_amount(amount)?;
        let idempotency_key = normalize_reference(idempotency_key, "idempotency_key")?;
        let description = normalize_description(description, "escrow release")?;
        let receipt = self
            .post(
                idempotency_key,
                vec![
                    LedgerLegInput {
                        account_id: payer_id.clone(),
                        kind: LedgerEntryKindV1::EscrowRelease,
                        amount,
                        description: description.clone(),
                        external_payment_ref: None,
                    },
                    LedgerLegInput {
                        account_id: payee_id.clone(),
                        kind: LedgerEntryKindV1::Income,
                        amount,
                        description,
                        external_payment_ref: None,
                    },
                ],
            )
            .await?;
        tracing::info!(
            payer_id = %payer_id,
            payee_id = %payee_id,
            amount,
            replayed = receipt.replayed,
            "escrow released"
        );
        Ok(receipt)
    }

    /// Returns escrowed funds to the available balance of the same account.
    pub async fn refund_escrow(
        &self,
        account_id: &str,
        amount: u64,
        description: &str,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerPostingReceipt, LedgerError> {
        let account_id = normalize_account_id(account_id)?;
        let amount = self.validate_amount(amount)?;
        let idempotency_key = normalize_reference(idempotency_key, "idempotency_key")?;
        let receipt = self
            .post(
                idempotency_key,
                vec![LedgerLegInput {
                    account_id: account_id.clone(),
                    kind: LedgerEntryKindV1::EscrowRefund,
                    amount,
                    description: normalize_description(description, "escrow refund")?,
                    external_payment_ref: None,
                }],
            )
            .await?;
        tracing::info!(
            account_id = %account_id,
            amount,
            replayed = receipt.replayed,
            "escrow refunded"
        );
        Ok(receipt)
    }

    pub async fn reconcile(&self, account_id: &str) -> Result<ReconcileResponseV1, LedgerError> {
        let account_id = normalize_account_id(account_id)?;
        let (account, entries) = self
            .store
            .account_snapshot(account_id.as_str())
            .await
            .map_err(map_store_error)?;
        let account = account.ok_or(LedgerError::NotFound)?;
        let projection = LedgerProjection::from_entries(entries.iter());
        let matches = projection.matches(&account);
        if !matches {
            tracing::warn!(
                account_id = %account_id,
                balance = account.balance,
                escrow = account.escrow,
                projected_balance = projection.balance,
                projected_escrow = projection.escrow,
                "wallet counters disagree with ledger"
            );
        }
        Ok(ReconcileResponseV1 {
            schema: WALLET_RECONCILE_RESPONSE_SCHEMA_V1.to_string(),
            account_id,
            balance: account.balance,
            escrow: account.escrow,
            projected_balance: projection.balance,
            projected_escrow: projection.escrow,
            entry_count: entries.len() as u64,
            matches,
            checked_at: Utc::now(),
        })
    }

    async fn post(
        &self,
        idempotency_key: Option<String>,
        legs: Vec<LedgerLegInput>,
    ) -> Result<LedgerPostingReceipt, LedgerError> {
        let fingerprint = PostingFingerprint {
            legs: legs
                .iter()
                .map(|leg| LegFingerprint {
                    account_id: leg.account_id.as_str(),
                    kind: leg.kind.as_str(),
                    amount: leg.amount,
                    description: leg.description.as_str(),
                    external_payment_ref: leg.external_payment_ref.as_deref(),
                })
                .collect(),
        };
        let request_fingerprint_sha256 =
            canonical_sha256(&fingerprint).map_err(LedgerError::PersistenceFailure)?;

        let (posting, created) = self
            .store
            .apply_posting(LedgerPostingInput {
                posting_id: format!("lpst_{}", Uuid::now_v7().simple()),
                idempotency_key,
                request_fingerprint_sha256,
                legs,
                created_at: Utc::now(),
            })
            .await
            .map_err(map_store_error)?;

        Ok(LedgerPostingReceipt {
            posting,
            replayed: !created,
        })
    }

    fn validate_amount(&self, amount: u64) -> Result<i64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidRequest(
                "amount must be greater than zero".to_string(),
            ));
        }
        if amount > self.policy.max_amount {
            return Err(LedgerError::InvalidRequest(format!(
                "amount exceeds policy maximum of {}",
                self.policy.max_amount
            )));
        }
        i64::try_from(amount)
            .map_err(|_| LedgerError::InvalidRequest("amount out of range".to_string()))
    }
}

pub(crate) fn normalize_account_id(raw: &str) -> Result<String, LedgerError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(LedgerError::InvalidRequest(
            "account_id is required".to_string(),
        ));
    }
    if value.len() > MAX_ACCOUNT_ID_LEN {
        return Err(LedgerError::InvalidRequest(
            "account_id is too long".to_string(),
        ));
    }
    Ok(value.to_string())
}

fn normalize_description(raw: &str, fallback: &str) -> Result<String, LedgerError> {
    let value = raw.trim();
    if value.len() > MAX_DESCRIPTION_LEN {
        return Err(LedgerError::InvalidRequest(
            "description is too long".to_string(),
        ));
    }
    if value.is_empty() {
        return Ok(fallback.to_string());
    }
    Ok(value.to_string())
}

fn normalize_reference(raw: Option<&str>, field: &str) -> Result<Option<String>, LedgerError> {
    let Some(value) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if value.len() > MAX_REFERENCE_LEN {
        return Err(LedgerError::InvalidRequest(format!("{field} is too long")));
    }
    Ok(Some(value.to_string()))
}

fn canonical_sha256(value: &impl Serialize) -> Result<String, String> {
    let canonical_json = serde_json::to_vec(value).map_err(|error| error.to_string())?;
    Ok(hex::encode(Sha256::digest(canonical_json)))
}

fn map_store_error(error: LedgerStoreError) -> LedgerError {
    match error {
        LedgerStoreError::Conflict(message) => LedgerError::Conflict(message),
        LedgerStoreError::NotFound(_) => LedgerError::NotFound,
        LedgerStoreError::InsufficientFunds {
            account_id,
            available,
            requested,
        } => LedgerError::InsufficientFunds {
            account_id,
            available: u64::try_from(available).unwrap_or_default(),
            requested: u64::try_from(requested).unwrap_or_default(),
        },
        LedgerStoreError::Db(message) => LedgerError::PersistenceFailure(message),
    }
}
