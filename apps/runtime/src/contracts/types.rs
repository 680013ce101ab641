use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CONTRACT_OFFER_ACCEPTED_REQUEST_SCHEMA_V1: &str =
    "marketplace.contracts.offer_accepted_request.v1";
pub const CONTRACT_RESPONSE_SCHEMA_V1: &str = "marketplace.contracts.contract_response.v1";
pub const CONTRACT_LIST_RESPONSE_SCHEMA_V1: &str = "marketplace.contracts.contract_list_response.v1";
pub const CONTRACT_REVIEW_RESPONSE_SCHEMA_V1: &str = "marketplace.contracts.review_response.v1";
pub const CONTRACT_REVIEW_LIST_RESPONSE_SCHEMA_V1: &str =
    "marketplace.contracts.review_list_response.v1";

pub const MIN_REVIEW_RATING: u8 = 1;
pub const MAX_REVIEW_RATING: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatusV1 {
    Active,
    Completed,
}

impl ContractStatusV1 {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

/// Which party's review slot a review fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSlotV1 {
    Provider,
    Client,
}

impl ReviewSlotV1 {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Client => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRow {
    pub contract_id: String,
    pub title: String,
    pub description: String,
    pub price: i64,
    pub provider_id: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brief_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer_ref: Option<String>,
    pub status: String,
    pub completed_by_provider: bool,
    pub completed_by_client: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_by_provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_by_client_id: Option<String>,
    pub escrow_posting_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_posting_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ContractRow {
    pub fn is_active(&self) -> bool {
        self.status == ContractStatusV1::Active.as_str()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ContractStatusV1::Completed.as_str()
    }

    pub fn is_party(&self, account_id: &str) -> bool {
        self.provider_id == account_id || self.client_id == account_id
    }

    pub fn review_slot(&self, slot: ReviewSlotV1) -> Option<&str> {
        match slot {
            ReviewSlotV1::Provider => self.review_by_provider_id.as_deref(),
            ReviewSlotV1::Client => self.review_by_client_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRow {
    pub review_id: String,
    pub contract_id: String,
    pub reviewer_id: String,
    pub reviewee_id: String,
    pub rating: i16,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Key under which at most one active contract may exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DuplicateKey {
    OfferRef(String),
    Legacy {
        title: String,
        provider_id: String,
        client_id: String,
    },
}

impl DuplicateKey {
    pub fn for_contract(contract: &ContractRow) -> Self {
        match contract.offer_ref.as_deref() {
            Some(offer_ref) => Self::OfferRef(offer_ref.to_string()),
            None => Self::Legacy {
                title: contract.title.clone(),
                provider_id: contract.provider_id.clone(),
                client_id: contract.client_id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferAcceptedRequestV1 {
    pub schema: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: u64,
    pub provider_id: String,
    pub client_id: String,
    #[serde(default)]
    pub brief_id: Option<String>,
    #[serde(default)]
    pub offer_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequestV1 {
    pub reviewee_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractResponseV1 {
    pub schema: String,
    pub contract: ContractRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractListResponseV1 {
    pub schema: String,
    pub contracts: Vec<ContractRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResponseV1 {
    pub schema: String,
    pub review: ReviewRow,
    pub contract: ContractRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewListResponseV1 {
    pub schema: String,
    pub contract_id: String,
    pub reviews: Vec<ReviewRow>,
}
