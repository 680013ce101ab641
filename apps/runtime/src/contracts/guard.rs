use std::sync::Arc;

use crate::contracts::service::{ContractError, map_store_error};
use crate::contracts::store::ContractStore;
use crate::contracts::types::DuplicateKey;

/// Rejects an accepted offer when an active contract already covers it.
///
/// This is a fast pre-check ahead of any money movement. The store enforces
/// the same key when the contract row is written, so a proposal that races
/// past the guard still fails before it is persisted.
#[derive(Clone)]
pub struct OfferIntakeGuard {
    store: Arc<dyn ContractStore>,
}

impl OfferIntakeGuard {
    pub fn new(store: Arc<dyn ContractStore>) -> Self {
        Self { store }
    }

    pub fn dedup_key(
        title: &str,
        provider_id: &str,
        client_id: &str,
        offer_ref: Option<&str>,
    ) -> DuplicateKey {
        match offer_ref {
            Some(offer_ref) => DuplicateKey::OfferRef(offer_ref.to_string()),
            None => DuplicateKey::Legacy {
                title: title.to_string(),
                provider_id: provider_id.to_string(),
                client_id: client_id.to_string(),
            },
        }
    }

    pub async fn check(&self, key: &DuplicateKey) -> Result<(), ContractError> {
        let existing = self
            .store
            .find_active_contract(key)
            .await
            .map_err(map_store_error)?;
        if let Some(existing) = existing {
            tracing::debug!(
                contract_id = %existing.contract_id,
                provider_id = %existing.provider_id,
                client_id = %existing.client_id,
                "offer intake rejected duplicate active contract"
            );
            return Err(ContractError::DuplicateActiveContract);
        }
        Ok(())
    }
}
