#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    auth::{AccountAuthorizer, AuthConfig},
    config::Config,
    contracts::{ContractLifecycleManager, store::ContractStore},
    db::EscrowDb,
    ledger::{WalletLedgerService, store::LedgerStore},
    notifications::{
        HttpNotificationSink, LogNotificationSink, NotificationDispatcher, NotificationSink,
    },
    server::{AppState, build_router},
};

pub mod auth;
pub mod config;
pub mod contracts;
pub mod db;
pub mod ledger;
pub mod notifications;
pub mod server;

const AUTH_CLOCK_SKEW_LEEWAY_SECONDS: u64 = 30;

/// Stores backing one service instance. Both live in the same database when
/// Postgres is configured.
#[derive(Clone)]
pub struct EscrowStores {
    pub ledger: Arc<dyn LedgerStore>,
    pub contracts: Arc<dyn ContractStore>,
    pub db: Option<Arc<EscrowDb>>,
}

impl EscrowStores {
    #[must_use]
    pub fn memory() -> Self {
        Self {
            ledger: ledger::store::memory(),
            contracts: contracts::store::memory(),
            db: None,
        }
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.db_url.as_deref() {
            Some(url) => {
                let db = Arc::new(EscrowDb::connect(url).await?);
                Ok(Self {
                    ledger: ledger::store::postgres(db.clone()),
                    contracts: contracts::store::postgres(db.clone()),
                    db: Some(db),
                })
            }
            None => Ok(Self::memory()),
        }
    }
}

#[must_use]
pub fn build_app_state(config: Config, stores: EscrowStores) -> AppState {
    let ledger = Arc::new(WalletLedgerService::new_with_policy(
        stores.ledger,
        config.wallet_policy.clone(),
    ));
    let contracts = ContractLifecycleManager::new(stores.contracts, ledger.clone());
    let auth = Arc::new(AccountAuthorizer::from_config(
        AuthConfig {
            signing_key: config.auth_signing_key.clone(),
            issuer: config.auth_issuer.clone(),
            audience: config.auth_audience.clone(),
            max_token_age_seconds: config.auth_max_token_age_seconds,
            clock_skew_leeway_seconds: AUTH_CLOCK_SKEW_LEEWAY_SECONDS,
            revoked_jtis: config.auth_revoked_jtis.clone(),
        },
        config.internal_token.as_deref(),
    ));
    AppState::new(config, ledger, contracts, auth, stores.db)
}

pub async fn build_runtime_state(config: Config) -> Result<AppState> {
    let stores = EscrowStores::from_config(&config).await?;
    Ok(build_app_state(config, stores))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_runtime_state(config).await?))
}

fn notification_sink(config: &Config) -> Result<Arc<dyn NotificationSink>> {
    let notifications = &config.notifications;
    if notifications.webhook_url.is_none() {
        info!("notification webhook not configured; logging notifications instead");
        return Ok(Arc::new(LogNotificationSink));
    }
    let sink = HttpNotificationSink::new(
        notifications.webhook_url.clone(),
        notifications.webhook_auth_token.clone(),
        notifications.timeout_ms,
    )?;
    Ok(Arc::new(sink))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "escrow service listening"
    );
    let state = build_runtime_state(config.clone()).await?;
    let dispatcher = if config.notifications.enabled {
        Some(
            NotificationDispatcher::new(
                state.contracts().store(),
                notification_sink(&config)?,
                config.notifications.dispatcher.clone(),
            )
            .spawn(),
        )
    } else {
        None
    };
    let served = axum::serve(listener, build_router(state)).await;
    if let Some(dispatcher) = dispatcher {
        dispatcher.abort();
    }
    served?;
    Ok(())
}
