use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;

use crate::{
    auth::{AccountAuthorizer, AccountPrincipal, AuthError},
    config::Config,
    contracts::{
        ContractError, ContractLifecycleManager,
        types::{
            CONTRACT_REVIEW_LIST_RESPONSE_SCHEMA_V1, ContractListResponseV1, ContractResponseV1,
            OfferAcceptedRequestV1, ReviewListResponseV1, ReviewRequestV1, ReviewResponseV1,
        },
    },
    db::EscrowDb,
    ledger::{
        LedgerError, WalletLedgerService,
        types::{
            AccountResponseV1, DepositRequestV1, EntriesResponseV1, LedgerPostingReceipt,
            PostingResponseV1, ReconcileResponseV1, WALLET_ACCOUNT_RESPONSE_SCHEMA_V1,
            WALLET_ENTRIES_RESPONSE_SCHEMA_V1, WALLET_POSTING_RESPONSE_SCHEMA_V1,
            WithdrawRequestV1,
        },
    },
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    ledger: Arc<WalletLedgerService>,
    contracts: ContractLifecycleManager,
    auth: Arc<AccountAuthorizer>,
    db: Option<Arc<EscrowDb>>,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        ledger: Arc<WalletLedgerService>,
        contracts: ContractLifecycleManager,
        auth: Arc<AccountAuthorizer>,
        db: Option<Arc<EscrowDb>>,
    ) -> Self {
        Self {
            config,
            ledger,
            contracts,
            auth,
            db,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn contracts(&self) -> &ContractLifecycleManager {
        &self.contracts
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    store_driver: &'static str,
    uptime_seconds: i64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/v1/wallet", get(get_wallet))
        .route("/v1/wallet/entries", get(get_wallet_entries))
        .route("/v1/wallet/reconcile", get(get_wallet_reconcile))
        .route("/v1/wallet/deposits", post(post_wallet_deposit))
        .route("/v1/wallet/withdrawals", post(post_wallet_withdrawal))
        .route("/internal/v1/offers/accepted", post(post_offer_accepted))
        .route("/v1/contracts", get(list_contracts))
        .route("/v1/contracts/:contract_id", get(get_contract))
        .route("/v1/contracts/:contract_id/deliver", post(deliver_contract))
        .route("/v1/contracts/:contract_id/confirm", post(confirm_contract))
        .route(
            "/v1/contracts/:contract_id/reviews",
            get(list_contract_reviews).post(post_contract_review),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name,
        store_driver: if state.db.is_some() {
            "postgres"
        } else {
            "memory"
        },
        uptime_seconds,
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let ready = match state.db.as_ref() {
        Some(db) => match db.ping().await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(reason = %error, "escrow readiness check failed");
                false
            }
        },
        None => true,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "not_ready" },
        })),
    )
}

async fn get_wallet(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AccountResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let account = state
        .ledger
        .account(principal.account_id.as_str())
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(AccountResponseV1 {
        schema: WALLET_ACCOUNT_RESPONSE_SCHEMA_V1.to_string(),
        account,
    }))
}

async fn get_wallet_entries(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<EntriesResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let entries = state
        .ledger
        .entries(principal.account_id.as_str())
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(EntriesResponseV1 {
        schema: WALLET_ENTRIES_RESPONSE_SCHEMA_V1.to_string(),
        account_id: principal.account_id,
        entries,
    }))
}

async fn get_wallet_reconcile(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<ReconcileResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let report = state
        .ledger
        .reconcile(principal.account_id.as_str())
        .await
        .map_err(ApiError::from_ledger)?;
    Ok(Json(report))
}

async fn post_wallet_deposit(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(body): Json<DepositRequestV1>,
) -> Result<(StatusCode, Json<PostingResponseV1>), ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let receipt = state
        .ledger
        .deposit(
            principal.account_id.as_str(),
            body.amount,
            body.description.as_str(),
            body.external_payment_ref.as_deref(),
        )
        .await
        .map_err(ApiError::from_ledger)?;
    posting_response(&state, &principal, receipt).await
}

async fn post_wallet_withdrawal(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(body): Json<WithdrawRequestV1>,
) -> Result<(StatusCode, Json<PostingResponseV1>), ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let receipt = state
        .ledger
        .withdraw(
            principal.account_id.as_str(),
            body.amount,
            body.description.as_str(),
        )
        .await
        .map_err(ApiError::from_ledger)?;
    posting_response(&state, &principal, receipt).await
}

async fn posting_response(
    state: &AppState,
    principal: &AccountPrincipal,
    receipt: LedgerPostingReceipt,
) -> Result<(StatusCode, Json<PostingResponseV1>), ApiError> {
    let account = state
        .ledger
        .account(principal.account_id.as_str())
        .await
        .map_err(ApiError::from_ledger)?;
    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(PostingResponseV1 {
            schema: WALLET_POSTING_RESPONSE_SCHEMA_V1.to_string(),
            posting: receipt.posting,
            replayed: receipt.replayed,
            account,
        }),
    ))
}

async fn post_offer_accepted(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(body): Json<OfferAcceptedRequestV1>,
) -> Result<(StatusCode, Json<ContractResponseV1>), ApiError> {
    state
        .auth
        .verify_internal_token(authorization_header(&headers))
        .map_err(ApiError::from_auth)?;
    let response = state
        .contracts
        .propose_contract(body)
        .await
        .map_err(ApiError::from_contract)?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn list_contracts(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<ContractListResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let response = state
        .contracts
        .contracts_for(principal.account_id.as_str())
        .await
        .map_err(ApiError::from_contract)?;
    Ok(Json(response))
}

async fn get_contract(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
) -> Result<Json<ContractResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let response = state
        .contracts
        .contract(principal.account_id.as_str(), contract_id.as_str())
        .await
        .map_err(ApiError::from_contract)?;
    Ok(Json(response))
}

async fn deliver_contract(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
) -> Result<Json<ContractResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let response = state
        .contracts
        .mark_delivered(principal.account_id.as_str(), contract_id.as_str())
        .await
        .map_err(ApiError::from_contract)?;
    Ok(Json(response))
}

async fn confirm_contract(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
) -> Result<Json<ContractResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let response = state
        .contracts
        .confirm_and_release(principal.account_id.as_str(), contract_id.as_str())
        .await
        .map_err(ApiError::from_contract)?;
    Ok(Json(response))
}

async fn post_contract_review(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
    Json(body): Json<ReviewRequestV1>,
) -> Result<(StatusCode, Json<ReviewResponseV1>), ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    let response = state
        .contracts
        .add_review(principal.account_id.as_str(), contract_id.as_str(), body)
        .await
        .map_err(ApiError::from_contract)?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn list_contract_reviews(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(contract_id): Path<String>,
) -> Result<Json<ReviewListResponseV1>, ApiError> {
    let principal = authenticate_account(&state, &headers)?;
    // Party check doubles as the existence check.
    state
        .contracts
        .contract(principal.account_id.as_str(), contract_id.as_str())
        .await
        .map_err(ApiError::from_contract)?;
    let reviews = state
        .contracts
        .reviews(contract_id.as_str())
        .await
        .map_err(ApiError::from_contract)?;
    Ok(Json(ReviewListResponseV1 {
        schema: CONTRACT_REVIEW_LIST_RESPONSE_SCHEMA_V1.to_string(),
        contract_id,
        reviews,
    }))
}

fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn authenticate_account(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AccountPrincipal, ApiError> {
    let token = AccountAuthorizer::extract_bearer_token(authorization_header(headers))
        .map_err(ApiError::from_auth)?;
    state.auth.authenticate(token).map_err(ApiError::from_auth)
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    InsufficientFunds(String),
    Conflict { code: &'static str, message: String },
    NotFound,
    Unauthorized(String),
    Forbidden { code: &'static str, message: String },
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    fn from_ledger(error: LedgerError) -> Self {
        match error {
            LedgerError::InvalidRequest(message) => Self::InvalidRequest(message),
            LedgerError::InsufficientFunds { .. } => Self::InsufficientFunds(error.message()),
            LedgerError::NotFound => Self::NotFound,
            LedgerError::Conflict(message) => Self::Conflict {
                code: "conflict",
                message,
            },
            LedgerError::PersistenceFailure(message) => Self::Internal(message),
        }
    }

    fn from_contract(error: ContractError) -> Self {
        let code = error.code();
        match error {
            ContractError::InvalidRequest(message) => Self::InvalidRequest(message),
            ContractError::InsufficientFunds { .. } => Self::InsufficientFunds(error.message()),
            ContractError::DuplicateActiveContract
            | ContractError::AlreadyCompleted
            | ContractError::ReviewAlreadyExists
            | ContractError::Conflict(_) => Self::Conflict {
                code,
                message: error.message(),
            },
            ContractError::NotFound => Self::NotFound,
            ContractError::Unauthorized(message) => Self::Forbidden { code, message },
            ContractError::PersistenceFailure(message) => Self::Internal(message),
        }
    }

    fn from_auth(error: AuthError) -> Self {
        let code = error.code();
        if error.is_unauthorized() {
            tracing::debug!(reason_code = code, reason = %error, "escrow auth denied");
            Self::Unauthorized(code.to_string())
        } else {
            tracing::warn!(reason_code = code, reason = %error, "escrow auth misconfigured");
            Self::ServiceUnavailable(code.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::InsufficientFunds(message) => (
                StatusCode::PAYMENT_REQUIRED,
                Json(serde_json::json!({
                    "error": "insufficient_funds",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Conflict { code, message } => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": code,
                    "message": message,
                })),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::Unauthorized(reason_code) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "escrow authorization failed",
                    "reason_code": reason_code,
                })),
            )
                .into_response(),
            Self::Forbidden { code, message } => (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({
                    "error": code,
                    "message": message,
                })),
            )
                .into_response(),
            Self::ServiceUnavailable(reason_code) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "service_unavailable",
                    "reason_code": reason_code,
                })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "persistence_failure",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests;
