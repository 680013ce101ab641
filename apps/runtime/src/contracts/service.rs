use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::contracts::guard::OfferIntakeGuard;
use crate::contracts::reviews::ReviewLinker;
use crate::contracts::store::{ContractStore, ContractStoreError};
use crate::contracts::types::{
    CONTRACT_LIST_RESPONSE_SCHEMA_V1, CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1,
    CONTRACT_RESPONSE_SCHEMA_V1, ContractListResponseV1, ContractResponseV1, ContractRow,
    ContractStatusV1, OfferAcceptedRequestV1, ReviewRequestV1, ReviewResponseV1, ReviewRow,
};
use crate::ledger::service::normalize_account_id;
use crate::ledger::{LedgerError, WalletLedgerService};
use crate::notifications::types::NotificationRow;

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 4_000;
const MAX_REF_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: u64, requested: u64 },
    #[error("an active contract already exists for this offer")]
    DuplicateActiveContract,
    #[error("contract already completed")]
    AlreadyCompleted,
    #[error("review already exists")]
    ReviewAlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl ContractError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::DuplicateActiveContract => "duplicate_active_contract",
            Self::AlreadyCompleted => "already_completed",
            Self::ReviewAlreadyExists => "review_already_exists",
            Self::NotFound => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::PersistenceFailure(_) => "persistence_failure",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::Unauthorized(message)
            | Self::Conflict(message)
            | Self::PersistenceFailure(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ContractLifecycleManager {
    store: Arc<dyn ContractStore>,
    ledger: Arc<WalletLedgerService>,
    guard: OfferIntakeGuard,
    reviews: ReviewLinker,
}

struct ValidatedOffer {
    title: String,
    description: String,
    price: u64,
    provider_id: String,
    client_id: String,
    brief_id: Option<String>,
    offer_ref: Option<String>,
}

impl ContractLifecycleManager {
    pub fn new(store: Arc<dyn ContractStore>, ledger: Arc<WalletLedgerService>) -> Self {
        Self {
            guard: OfferIntakeGuard::new(store.clone()),
            reviews: ReviewLinker::new(store.clone()),
            store,
            ledger,
        }
    }

    pub fn store(&self) -> Arc<dyn ContractStore> {
        self.store.clone()
    }

    /// Turns an accepted offer into an active, escrow-backed contract.
    ///
    /// Money moves before the contract row is written. If that write fails the
    /// escrow is refunded under its own idempotency key; a failed refund is
    /// logged as orphaned escrow for manual recovery.
    pub async fn propose_contract(
        &self,
        body: OfferAcceptedRequestV1,
    ) -> Result<ContractResponseV1, ContractError> {
        let offer = validate_offer(body)?;
        let key = OfferIntakeGuard::dedup_key(
            offer.title.as_str(),
            offer.provider_id.as_str(),
            offer.client_id.as_str(),
            offer.offer_ref.as_deref(),
        );
        self.guard.check(&key).await?;

        let contract_id = format!("ctr_{}", Uuid::now_v7().simple());
        let escrow = self
            .ledger
            .move_to_escrow(
                offer.client_id.as_str(),
                offer.price,
                format!("escrow for {}", offer.title).as_str(),
                Some(format!("contract:{contract_id}:escrow").as_str()),
            )
            .await
            .map_err(map_ledger_error)?;

        let now = Utc::now();
        let price = i64::try_from(offer.price)
            .map_err(|_| ContractError::InvalidRequest("price out of range".to_string()))?;
        let contract = ContractRow {
            contract_id: contract_id.clone(),
            title: offer.title,
            description: offer.description,
            price,
            provider_id: offer.provider_id,
            client_id: offer.client_id,
            brief_id: offer.brief_id,
            offer_ref: offer.offer_ref,
            status: ContractStatusV1::Active.as_str().to_string(),
            completed_by_provider: false,
            completed_by_client: false,
            review_by_provider_id: None,
            review_by_client_id: None,
            escrow_posting_id: escrow.posting.posting_id,
            release_posting_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let notification = NotificationRow::pending(
            contract.provider_id.as_str(),
            "New contract",
            format!("A client started the contract \"{}\"", contract.title),
            now,
        );

        match self.store.insert_contract(contract.clone(), notification).await {
            Ok(contract) => {
                tracing::info!(
                    contract_id = %contract.contract_id,
                    provider_id = %contract.provider_id,
                    client_id = %contract.client_id,
                    amount = contract.price,
                    "contract created with escrow"
                );
                Ok(ContractResponseV1 {
                    schema: CONTRACT_RESPONSE_SCHEMA_V1.to_string(),
                    contract,
                })
            }
            Err(ContractStoreError::DuplicateActive(existing)) => {
                tracing::debug!(
                    contract_id = %contract.contract_id,
                    existing_contract_id = %existing,
                    "duplicate active contract detected at persistence"
                );
                self.compensate_escrow(&contract).await?;
                Err(ContractError::DuplicateActiveContract)
            }
            Err(error) => {
                tracing::error!(
                    account_id = %contract.client_id,
                    contract_id = %contract.contract_id,
                    amount = contract.price,
                    reason = %error,
                    "contract persistence failed after escrow"
                );
                self.compensate_escrow(&contract).await?;
                Err(ContractError::PersistenceFailure(
                    "contract could not be persisted; escrow refunded".to_string(),
                ))
            }
        }
    }

    pub async fn mark_delivered(
        &self,
        caller_id: &str,
        contract_id: &str,
    ) -> Result<ContractResponseV1, ContractError> {
        let contract = self.load_contract(contract_id).await?;
        if caller_id != contract.provider_id {
            return Err(ContractError::Unauthorized(
                "only the provider can mark work delivered".to_string(),
            ));
        }
        if !contract.is_active() {
            return Err(ContractError::AlreadyCompleted);
        }

        let now = Utc::now();
        let notification = NotificationRow::pending(
            contract.client_id.as_str(),
            "Work delivered",
            format!(
                "The provider marked \"{}\" as delivered. Confirm to release payment.",
                contract.title
            ),
            now,
        );
        let (contract, changed) = self
            .store
            .mark_delivered(contract_id, now, notification)
            .await
            .map_err(map_store_error)?;
        if changed {
            tracing::info!(contract_id = %contract.contract_id, "contract marked delivered");
        }

        Ok(ContractResponseV1 {
            schema: CONTRACT_RESPONSE_SCHEMA_V1.to_string(),
            contract,
        })
    }

    /// Releases escrow to the provider and completes the contract.
    ///
    /// The release posting is keyed by contract id so retries and concurrent
    /// confirmations move funds once. Completion is a compare-and-set, so only
    /// one caller sees success.
    pub async fn confirm_and_release(
        &self,
        caller_id: &str,
        contract_id: &str,
    ) -> Result<ContractResponseV1, ContractError> {
        let contract = self.load_contract(contract_id).await?;
        if caller_id != contract.client_id {
            return Err(ContractError::Unauthorized(
                "only the client can confirm completion".to_string(),
            ));
        }
        if contract.is_completed() {
            return Err(ContractError::AlreadyCompleted);
        }

        let amount = u64::try_from(contract.price)
            .map_err(|_| ContractError::PersistenceFailure("stored price is negative".to_string()))?;
        let release = self
            .ledger
            .release_escrow(
                contract.client_id.as_str(),
                contract.provider_id.as_str(),
                amount,
                format!("payment for {}", contract.title).as_str(),
                Some(format!("contract:{}:release", contract.contract_id).as_str()),
            )
            .await
            .map_err(map_ledger_error)?;

        let now = Utc::now();
        let notification = NotificationRow::pending(
            contract.provider_id.as_str(),
            "Payment released",
            format!(
                "The client confirmed \"{}\". {} has been added to your balance.",
                contract.title, amount
            ),
            now,
        );
        let completed = match self
            .store
            .complete_contract(
                contract_id,
                release.posting.posting_id.as_str(),
                now,
                notification,
            )
            .await
        {
            Ok(row) => row,
            Err(ContractStoreError::NotActive(_)) => return Err(ContractError::AlreadyCompleted),
            Err(error) => {
                tracing::error!(
                    account_id = %contract.client_id,
                    contract_id = %contract.contract_id,
                    amount = contract.price,
                    reason = %error,
                    "escrow released but contract completion was not persisted"
                );
                return Err(map_store_error(error));
            }
        };

        tracing::info!(
            contract_id = %completed.contract_id,
            provider_id = %completed.provider_id,
            amount = completed.price,
            "contract completed and escrow released"
        );
        Ok(ContractResponseV1 {
            schema: CONTRACT_RESPONSE_SCHEMA_V1.to_string(),
            contract: completed,
        })
    }

    pub async fn add_review(
        &self,
        caller_id: &str,
        contract_id: &str,
        body: ReviewRequestV1,
    ) -> Result<ReviewResponseV1, ContractError> {
        self.reviews.add_review(caller_id, contract_id, body).await
    }

    pub async fn contract(
        &self,
        caller_id: &str,
        contract_id: &str,
    ) -> Result<ContractResponseV1, ContractError> {
        let contract = self.load_contract(contract_id).await?;
        if !contract.is_party(caller_id) {
            return Err(ContractError::Unauthorized(
                "caller is not a party to this contract".to_string(),
            ));
        }
        Ok(ContractResponseV1 {
            schema: CONTRACT_RESPONSE_SCHEMA_V1.to_string(),
            contract,
        })
    }

    pub async fn contracts_for(
        &self,
        caller_id: &str,
    ) -> Result<ContractListResponseV1, ContractError> {
        let contracts = self
            .store
            .list_contracts_for_party(caller_id)
            .await
            .map_err(map_store_error)?;
        Ok(ContractListResponseV1 {
            schema: CONTRACT_LIST_RESPONSE_SCHEMA_V1.to_string(),
            contracts,
        })
    }

    pub async fn reviews(&self, contract_id: &str) -> Result<Vec<ReviewRow>, ContractError> {
        self.store
            .list_reviews(contract_id)
            .await
            .map_err(map_store_error)
    }

    async fn load_contract(&self, contract_id: &str) -> Result<ContractRow, ContractError> {
        self.store
            .get_contract(contract_id.trim())
            .await
            .map_err(map_store_error)?
            .ok_or(ContractError::NotFound)
    }

    async fn compensate_escrow(&self, contract: &ContractRow) -> Result<(), ContractError> {
        let amount = u64::try_from(contract.price).unwrap_or_default();
        match self
            .ledger
            .refund_escrow(
                contract.client_id.as_str(),
                amount,
                format!("refund for {}", contract.title).as_str(),
                Some(format!("contract:{}:escrow_refund", contract.contract_id).as_str()),
            )
            .await
        {
            Ok(_) => {
                tracing::warn!(
                    account_id = %contract.client_id,
                    contract_id = %contract.contract_id,
                    amount = contract.price,
                    "escrow refunded after failed contract write"
                );
                Ok(())
            }
            Err(error) => {
                tracing::error!(
                    account_id = %contract.client_id,
                    contract_id = %contract.contract_id,
                    amount = contract.price,
                    reason = %error,
                    "orphaned escrow: compensating refund failed"
                );
                Err(ContractError::PersistenceFailure(
                    "contract could not be persisted and escrow refund failed".to_string(),
                ))
            }
        }
    }
}

fn validate_offer(body: OfferAcceptedRequestV1) -> Result<ValidatedOffer, ContractError> {
    if body.schema.trim() != CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1 {
        return Err(ContractError::InvalidRequest(format!(
            "schema must be {CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1}"
        )));
    }
    let title = body.title.trim();
    if title.is_empty() {
        return Err(ContractError::InvalidRequest("title is required".to_string()));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(ContractError::InvalidRequest("title is too long".to_string()));
    }
    let description = body.description.trim();
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(ContractError::InvalidRequest(
            "description is too long".to_string(),
        ));
    }
    if body.price == 0 {
        return Err(ContractError::InvalidRequest(
            "price must be greater than zero".to_string(),
        ));
    }
    let provider_id = normalize_account_id(body.provider_id.as_str()).map_err(map_ledger_error)?;
    let client_id = normalize_account_id(body.client_id.as_str()).map_err(map_ledger_error)?;
    if provider_id == client_id {
        return Err(ContractError::InvalidRequest(
            "provider and client must differ".to_string(),
        ));
    }

    Ok(ValidatedOffer {
        title: title.to_string(),
        description: description.to_string(),
        price: body.price,
        provider_id,
        client_id,
        brief_id: normalize_optional_ref(body.brief_id, "brief_id")?,
        offer_ref: normalize_optional_ref(body.offer_ref, "offer_ref")?,
    })
}

fn normalize_optional_ref(raw: Option<String>, field: &str) -> Result<Option<String>, ContractError> {
    let Some(value) = raw
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };
    if value.len() > MAX_REF_LEN {
        return Err(ContractError::InvalidRequest(format!("{field} is too long")));
    }
    Ok(Some(value.to_string()))
}

pub(crate) fn map_store_error(error: ContractStoreError) -> ContractError {
    match error {
        ContractStoreError::DuplicateActive(_) => ContractError::DuplicateActiveContract,
        ContractStoreError::NotActive(_) => ContractError::AlreadyCompleted,
        ContractStoreError::ReviewSlotTaken(_) => ContractError::ReviewAlreadyExists,
        ContractStoreError::Conflict(message) => ContractError::Conflict(message),
        ContractStoreError::NotFound(_) => ContractError::NotFound,
        ContractStoreError::Db(message) => ContractError::PersistenceFailure(message),
    }
}

fn map_ledger_error(error: LedgerError) -> ContractError {
    match error {
        LedgerError::InvalidRequest(message) => ContractError::InvalidRequest(message),
        LedgerError::InsufficientFunds {
            available,
            requested,
            ..
        } => ContractError::InsufficientFunds {
            available,
            requested,
        },
        LedgerError::NotFound => ContractError::NotFound,
        LedgerError::Conflict(message) => ContractError::Conflict(message),
        LedgerError::PersistenceFailure(message) => ContractError::PersistenceFailure(message),
    }
}
