use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, EntryId, LotId, ReservationId, TransferId};

/// Kind of principal a credit account belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Agent,
    Treasury,
    Pool,
}

/// A credit account. Identity is the `(entity_type, entity_id)` pair and is
/// immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditAccount {
    pub account_id: AccountId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub created_at: DateTime<Utc>,
}

/// Provenance of a credit lot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotSourceType {
    Deposit,
    Grant,
    Purchase,
    TransferIn,
    CommonsDividend,
    TbaDeposit,
}

impl LotSourceType {
    /// Idempotency key of the mint entry tied to an external occurrence.
    pub fn mint_entry_key(&self, source_id: &str) -> String {
        format!("mint:{self:?}:{source_id}").to_lowercase()
    }
}

/// A provenance-tagged slice of credit.
///
/// `original_micro` is fixed at creation; only the three partitions move, and
/// they must always satisfy `available + reserved + consumed == original`
/// with every partition non-negative.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditLot {
    pub lot_id: LotId,
    pub account_id: AccountId,
    pub source_type: LotSourceType,
    /// External occurrence this lot was minted from. `(source_type,
    /// source_id)` is unique when present, deduplicating retried mints.
    pub source_id: Option<String>,
    pub original_micro: i64,
    pub available_micro: i64,
    pub reserved_micro: i64,
    pub consumed_micro: i64,
    pub created_at: DateTime<Utc>,
}

impl CreditLot {
    /// Whether the per-lot conservation invariant holds.
    pub fn conserves(&self) -> bool {
        self.available_micro >= 0
            && self.reserved_micro >= 0
            && self.consumed_micro >= 0
            && self
                .available_micro
                .checked_add(self.reserved_micro)
                .and_then(|sum| sum.checked_add(self.consumed_micro))
                == Some(self.original_micro)
    }
}

/// Reservation lifecycle. `Pending` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Finalized,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }
}

/// A pending claim against one or more lots for a not-yet-finalized spend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub account_id: AccountId,
    pub estimated_cost_micro: i64,
    /// Known only at finalization, bounded by the estimate.
    pub actual_cost_micro: Option<i64>,
    /// Externally supplied idempotency guard against double-finalization.
    pub finalization_id: Option<String>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How much of a reservation was held against one specific lot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReservationLot {
    pub reservation_id: ReservationId,
    pub lot_id: LotId,
    pub reserved_micro: i64,
}

/// Kind of accounting event a ledger entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Deposit,
    Reserve,
    Finalize,
    Release,
    Refund,
    Grant,
    TransferOut,
    TransferIn,
    CommonsContribution,
    RevenueShare,
    MarketplaceSale,
    MarketplacePurchase,
    Escrow,
    EscrowRelease,
    ShadowDeposit,
    ShadowSpend,
}

/// An immutable, append-only record of one accounting event.
///
/// `entry_seq`, `pre_balance_micro`, and `post_balance_micro` are assigned by
/// storage at append time; the balances bracket the account's available
/// balance so reconciliation can replay the log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: EntryId,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount_micro: i64,
    /// Globally unique when present.
    pub idempotency_key: Option<String>,
    pub pre_balance_micro: i64,
    pub post_balance_micro: i64,
    /// Monotonic per account.
    pub entry_seq: u64,
    pub reservation_id: Option<ReservationId>,
    pub transfer_id: Option<TransferId>,
    pub created_at: DateTime<Utc>,
}

/// Transfer lifecycle. `Pending` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::Pending)
    }
}

/// A peer-to-peer movement of credit between two accounts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: TransferId,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount_micro: i64,
    pub idempotency_key: String,
    pub status: TransferStatus,
    /// Populated when the transfer is rejected.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
