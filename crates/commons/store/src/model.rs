use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use commons_types::{
    AccountId, AuditSubject, EconomicEventType, EntryType, EventEntity, LotId, LotSourceType,
    ReservationId, TransferId,
};

/// Ledger entry payload. Entry id, sequence number, and pre/post balances are
/// assigned by storage at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDraft {
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount_micro: i64,
    pub idempotency_key: Option<String>,
    pub reservation_id: Option<ReservationId>,
    pub transfer_id: Option<TransferId>,
}

/// Outbox event payload, inserted in the same storage operation as the
/// mutation it describes. Sequence is assigned by storage; a duplicate
/// idempotency key makes the insert a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: EconomicEventType,
    pub entity_type: EventEntity,
    pub entity_id: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

/// Governance audit payload. Sequence and hash chaining are assigned by
/// storage; the stored record is write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditDraft {
    pub subject: AuditSubject,
    pub action: String,
    pub actor: String,
    pub previous_status: Option<String>,
    pub new_status: Option<String>,
    pub reason: Option<String>,
    pub urgent: bool,
}

/// Request to mint a new lot. The lot id is generated by the caller so the
/// entry and event drafts can reference it.
#[derive(Debug, Clone)]
pub struct MintRequest {
    pub lot_id: LotId,
    pub account_id: AccountId,
    pub amount_micro: i64,
    pub source_type: LotSourceType,
    pub source_id: Option<String>,
}

/// Request to reserve credit against an account's lots.
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub reservation_id: ReservationId,
    pub account_id: AccountId,
    pub amount_micro: i64,
    pub expires_at: DateTime<Utc>,
}

/// Request for an atomic peer transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub transfer_id: TransferId,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount_micro: i64,
    pub idempotency_key: String,
}
