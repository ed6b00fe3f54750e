//! Storage contract for the commons credit engine.
//!
//! Every compound mutation the ledger and governance services need is one
//! trait method, and the store executes it atomically: the storage layer is
//! the final arbiter of conservation, idempotency, and state-machine
//! transitions, so no service-level read-then-write can race past them.
//! [`InMemoryCommonsStore`] is the deterministic reference adapter used in
//! tests and single-process deployments.

#![deny(unsafe_code)]

mod error;
mod memory;
mod model;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryCommonsStore;
pub use model::{AuditDraft, EntryDraft, EventDraft, MintRequest, ReserveRequest, TransferRequest};
pub use traits::{
    AccountStore, CommonsStore, EntryStore, LotStore, OutboxStore, ParamStore, ProposalStore,
    ReconStore, ReservationStore, RevenueRuleStore, TransferStore,
};
