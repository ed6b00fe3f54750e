//! Commons credit data model.
//!
//! Shared record and identifier types for the credit ledger, peer transfers,
//! governance state machines, the economic event outbox, and reconciliation.
//! All monetary quantities are integer micro-credits; no floating point
//! touches balances anywhere in the system.

#![deny(unsafe_code)]

mod events;
mod governance;
mod ids;
mod ledger;
pub mod params;
mod recon;

pub use events::{EconomicEvent, EconomicEventType, EventEntity};
pub use governance::{
    AgentProposal, AuditSubject, GovernanceAuditRecord, ParamRecord, ProposalStatus, ProposalVote,
    RevenueRule, RevenueRuleStatus, RevenueSplit, RuleNotification,
};
pub use ids::{
    AccountId, AgentId, EntryId, EventId, LotId, ProposalId, ReservationId, RuleId, RunId,
    TransferId,
};
pub use ledger::{
    CreditAccount, CreditLot, EntityType, EntryType, LedgerEntry, LotSourceType, Reservation,
    ReservationLot, ReservationStatus, Transfer, TransferStatus,
};
pub use recon::{CheckResult, ReconCheckCode, ReconStatus, ReconciliationRun};

/// Basis points in a whole: revenue splits must sum to exactly this.
pub const BPS_WHOLE: u32 = 10_000;
