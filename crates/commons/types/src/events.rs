use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EventId;

/// Kind of economic occurrence an outbox event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EconomicEventType {
    LotMinted,
    CreditsReserved,
    ReservationFinalized,
    ReservationReleased,
    ReservationExpired,
    TransferCompleted,
    TransferRejected,
    RevenueRuleActivated,
    ParameterActivated,
}

/// Which kind of entity an event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventEntity {
    Account,
    Lot,
    Reservation,
    Transfer,
    RevenueRule,
    Proposal,
}

/// Durable outbox row, written in the same transaction as the ledger
/// mutation it describes.
///
/// Lifecycle: unclaimed -> claimed -> published. A claim whose
/// `published_at` stays null past the staleness window is reclaimable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub event_id: EventId,
    /// Insertion order, assigned by storage; claims follow it.
    pub sequence: u64,
    pub event_type: EconomicEventType,
    pub entity_type: EventEntity,
    pub entity_id: String,
    pub payload: Value,
    /// Globally unique when present; dedups emission for a retried mutation.
    pub idempotency_key: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EconomicEvent {
    /// Whether the event can be claimed at `now`.
    pub fn claimable(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        if self.published_at.is_some() {
            return false;
        }
        match self.claimed_at {
            None => true,
            Some(claimed_at) => now - claimed_at > stale_after,
        }
    }
}
