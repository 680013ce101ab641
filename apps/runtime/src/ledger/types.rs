use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const WALLET_ACCOUNT_RESPONSE_SCHEMA_V1: &str = "marketplace.wallet.account_response.v1";
pub const WALLET_ENTRIES_RESPONSE_SCHEMA_V1: &str = "marketplace.wallet.entries_response.v1";
pub const WALLET_POSTING_RESPONSE_SCHEMA_V1: &str = "marketplace.wallet.posting_response.v1";
pub const WALLET_RECONCILE_RESPONSE_SCHEMA_V1: &str = "marketplace.wallet.reconcile_response.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKindV1 {
    Deposit,
    Withdrawal,
    EscrowPayment,
    EscrowRelease,
    EscrowRefund,
    Income,
}

/// Counter deltas and the signed ledger amount produced by one leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegEffect {
    pub signed_amount: i64,
    pub balance_delta: i64,
    pub escrow_delta: i64,
}

impl LedgerEntryKindV1 {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::EscrowPayment => "escrow_payment",
            Self::EscrowRelease => "escrow_release",
            Self::EscrowRefund => "escrow_refund",
            Self::Income => "income",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            "escrow_payment" => Some(Self::EscrowPayment),
            "escrow_release" => Some(Self::EscrowRelease),
            "escrow_refund" => Some(Self::EscrowRefund),
            "income" => Some(Self::Income),
            _ => None,
        }
    }

    /// `amount` is the positive magnitude of the leg.
    pub fn effect(self, amount: i64) -> LegEffect {
        match self {
            Self::Deposit | Self::Income => LegEffect {
                signed_amount: amount,
                balance_delta: amount,
                escrow_delta: 0,
            },
            Self::Withdrawal => LegEffect {
                signed_amount: -amount,
                balance_delta: -amount,
                escrow_delta: 0,
            },
            Self::EscrowPayment => LegEffect {
                signed_amount: -amount,
                balance_delta: -amount,
                escrow_delta: amount,
            },
            Self::EscrowRefund => LegEffect {
                signed_amount: amount,
                balance_delta: amount,
                escrow_delta: -amount,
            },
            Self::EscrowRelease => LegEffect {
                signed_amount: -amount,
                balance_delta: 0,
                escrow_delta: -amount,
            },
        }
    }

    /// Kinds that move value across the account boundary. Escrow payments and
    /// refunds only shift value between the two counters of one account.
    pub fn crosses_account_boundary(self) -> bool {
        !matches!(self, Self::EscrowPayment | Self::EscrowRefund)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRow {
    pub account_id: String,
    pub balance: i64,
    pub escrow: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountRow {
    pub fn empty(account_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.to_string(),
            balance: 0,
            escrow: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntryRow {
    pub entry_id: String,
    pub posting_id: String,
    pub account_id: String,
    pub signed_amount: i64,
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_payment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPostingRow {
    pub posting_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub entries: Vec<LedgerEntryRow>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a wallet operation. `replayed` is true when the idempotency key
/// matched an earlier posting and nothing moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPostingReceipt {
    pub posting: LedgerPostingRow,
    pub replayed: bool,
}

/// Balance and escrow recomputed from ledger entries alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerProjection {
    pub balance: i64,
    pub escrow: i64,
    pub boundary_sum: i64,
}

impl LedgerProjection {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntryRow>) -> Self {
        let mut projection = Self::default();
        for entry in entries {
            let Some(kind) = LedgerEntryKindV1::parse(entry.kind.as_str()) else {
                continue;
            };
            let effect = kind.effect(entry.signed_amount.abs());
            projection.balance = projection.balance.saturating_add(effect.balance_delta);
            projection.escrow = projection.escrow.saturating_add(effect.escrow_delta);
            if kind.crosses_account_boundary() {
                projection.boundary_sum = projection.boundary_sum.saturating_add(entry.signed_amount);
            }
        }
        projection
    }

    pub fn matches(&self, account: &AccountRow) -> bool {
        self.balance == account.balance
            && self.escrow == account.escrow
            && self.boundary_sum == account.balance.saturating_add(account.escrow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequestV1 {
    pub amount: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub external_payment_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequestV1 {
    pub amount: u64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponseV1 {
    pub schema: String,
    pub account: AccountRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntriesResponseV1 {
    pub schema: String,
    pub account_id: String,
    pub entries: Vec<LedgerEntryRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingResponseV1 {
    pub schema: String,
    pub posting: LedgerPostingRow,
    pub replayed: bool,
    pub account: AccountRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponseV1 {
    pub schema: String,
    pub account_id: String,
    pub balance: i64,
    pub escrow: i64,
    pub projected_balance: i64,
    pub projected_escrow: i64,
    pub entry_count: u64,
    pub matches: bool,
    pub checked_at: DateTime<Utc>,
}
