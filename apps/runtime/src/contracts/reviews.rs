use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::contracts::service::{ContractError, map_store_error};
use crate::contracts::store::ContractStore;
use crate::contracts::types::{
    CONTRACT_REVIEW_RESPONSE_SCHEMA_V1, MAX_REVIEW_RATING, MIN_REVIEW_RATING, ReviewRequestV1,
    ReviewResponseV1, ReviewRow, ReviewSlotV1,
};
use crate::notifications::types::NotificationRow;

const MAX_COMMENT_LEN: usize = 2_000;

#[derive(Clone)]
pub struct ReviewLinker {
    store: Arc<dyn ContractStore>,
}

impl ReviewLinker {
    pub fn new(store: Arc<dyn ContractStore>) -> Self {
        Self { store }
    }

    pub async fn add_review(
        &self,
        caller_id: &str,
        contract_id: &str,
        body: ReviewRequestV1,
    ) -> Result<ReviewResponseV1, ContractError> {
        let contract = self
            .store
            .get_contract(contract_id.trim())
            .await
            .map_err(map_store_error)?
            .ok_or(ContractError::NotFound)?;

        let slot = if caller_id == contract.provider_id {
            ReviewSlotV1::Provider
        } else if caller_id == contract.client_id {
            ReviewSlotV1::Client
        } else {
            return Err(ContractError::Unauthorized(
                "reviewer is not a party to this contract".to_string(),
            ));
        };

        let reviewee_id = body.reviewee_id.trim();
        let expected_reviewee = match slot {
            ReviewSlotV1::Provider => contract.client_id.as_str(),
            ReviewSlotV1::Client => contract.provider_id.as_str(),
        };
        if reviewee_id != expected_reviewee {
            return Err(ContractError::InvalidRequest(
                "reviewee must be the other party".to_string(),
            ));
        }
        if !contract.is_completed() && !contract.completed_by_provider {
            return Err(ContractError::InvalidRequest(
                "work not yet delivered".to_string(),
            ));
        }
        if !(MIN_REVIEW_RATING..=MAX_REVIEW_RATING).contains(&body.rating) {
            return Err(ContractError::InvalidRequest(format!(
                "rating must be between {MIN_REVIEW_RATING} and {MAX_REVIEW_RATING}"
            )));
        }
        let comment = body.comment.trim();
        if comment.len() > MAX_COMMENT_LEN {
            return Err(ContractError::InvalidRequest(
                "comment is too long".to_string(),
            ));
        }
        if contract.review_slot(slot).is_some() {
            return Err(ContractError::ReviewAlreadyExists);
        }

        let now = Utc::now();
        let review = ReviewRow {
            review_id: format!("rvw_{}", Uuid::now_v7().simple()),
            contract_id: contract.contract_id.clone(),
            reviewer_id: caller_id.to_string(),
            reviewee_id: expected_reviewee.to_string(),
            rating: i16::from(body.rating),
            comment: comment.to_string(),
            created_at: now,
        };
        let notification = NotificationRow::pending(
            expected_reviewee,
            "New review",
            format!(
                "You received a {}-star review for \"{}\"",
                body.rating, contract.title
            ),
            now,
        );

        let (review, contract) = self
            .store
            .insert_review(review, slot, notification)
            .await
            .map_err(map_store_error)?;

        tracing::info!(
            contract_id = %contract.contract_id,
            review_id = %review.review_id,
            slot = slot.as_str(),
            rating = review.rating,
            "contract review recorded"
        );

        Ok(ReviewResponseV1 {
            schema: CONTRACT_REVIEW_RESPONSE_SCHEMA_V1.to_string(),
            review,
            contract,
        })
    }
}
