//! Ledger core - accounts, credit lots, reservations, and the append-only
//! entry log, backed by commons storage.
//!
//! This crate is the facade external callers use to move value. Every
//! mutating operation delegates to one atomic storage method, so the
//! conservation invariant (`available + reserved + consumed == original` per
//! lot) and the idempotency guards hold regardless of what callers do. The
//! outbox event for each mutation is written in the same storage operation.

#![deny(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use commons_store::{
    CommonsStore, EntryDraft, EventDraft, InMemoryCommonsStore, MintRequest, ReserveRequest,
    StorageError,
};
use commons_types::{
    AccountId, CreditAccount, CreditLot, EconomicEventType, EntityType, EntryType, EventEntity,
    LedgerEntry, LotId, LotSourceType, Reservation, ReservationId, ReservationStatus,
};

/// The ledger core service.
pub struct LedgerService {
    store: Arc<dyn CommonsStore>,
}

impl LedgerService {
    /// Create a ledger backed by the in-memory reference store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryCommonsStore::new()),
        }
    }

    /// Create a ledger backed by an explicit storage adapter.
    pub fn with_store(store: Arc<dyn CommonsStore>) -> Self {
        Self { store }
    }

    /// Access the underlying storage adapter, for wiring sibling services
    /// onto the same tables.
    pub fn store(&self) -> Arc<dyn CommonsStore> {
        Arc::clone(&self.store)
    }

    /// Create a credit account. `(entity_type, entity_id)` must be unique.
    pub async fn create_account(
        &self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
    ) -> Result<CreditAccount, LedgerError> {
        let entity_id = entity_id.into();
        let account = self
            .store
            .create_account(entity_type, entity_id.clone(), Utc::now())
            .await?;
        info!(
            account_id = %account.account_id,
            ?entity_type,
            entity_id = %entity_id,
            "credit account created"
        );
        Ok(account)
    }

    /// Mint a new lot with the full amount available.
    ///
    /// When `source_id` is supplied, `(source_type, source_id)` deduplicates
    /// retried mints from the same external occurrence (a replayed deposit
    /// webhook mints once).
    pub async fn mint_lot(
        &self,
        account_id: &AccountId,
        amount_micro: i64,
        source_type: LotSourceType,
        source_id: Option<String>,
    ) -> Result<CreditLot, LedgerError> {
        if amount_micro <= 0 {
            return Err(LedgerError::InvalidInput(
                "mint amount must be positive".to_string(),
            ));
        }
        let lot_id = LotId::generate();
        let entry_key = source_id
            .as_ref()
            .map(|id| source_type.mint_entry_key(id));
        let lot = self
            .store
            .mint_lot(
                MintRequest {
                    lot_id: lot_id.clone(),
                    account_id: account_id.clone(),
                    amount_micro,
                    source_type,
                    source_id,
                },
                EntryDraft {
                    account_id: account_id.clone(),
                    entry_type: entry_type_for_source(source_type),
                    amount_micro,
                    idempotency_key: entry_key,
                    reservation_id: None,
                    transfer_id: None,
                },
                EventDraft {
                    event_type: EconomicEventType::LotMinted,
                    entity_type: EventEntity::Lot,
                    entity_id: lot_id.0.clone(),
                    payload: serde_json::json!({
                        "account_id": account_id.0,
                        "amount_micro": amount_micro,
                        "source_type": source_type,
                    }),
                    idempotency_key: Some(format!("lot-minted:{lot_id}")),
                },
                Utc::now(),
            )
            .await?;
        info!(
            lot_id = %lot.lot_id,
            account_id = %account_id,
            amount_micro,
            ?source_type,
            "lot minted"
        );
        Ok(lot)
    }

    /// Reserve credit against the account's lots, FIFO, all-or-nothing.
    pub async fn reserve(
        &self,
        account_id: &AccountId,
        amount_micro: i64,
        ttl: Duration,
    ) -> Result<Reservation, LedgerError> {
        let now = Utc::now();
        let reservation_id = ReservationId::generate();
        let reservation = self
            .store
            .reserve(
                ReserveRequest {
                    reservation_id: reservation_id.clone(),
                    account_id: account_id.clone(),
                    amount_micro,
                    expires_at: now + ttl,
                },
                EntryDraft {
                    account_id: account_id.clone(),
                    entry_type: EntryType::Reserve,
                    amount_micro,
                    idempotency_key: None,
                    reservation_id: Some(reservation_id.clone()),
                    transfer_id: None,
                },
                EventDraft {
                    event_type: EconomicEventType::CreditsReserved,
                    entity_type: EventEntity::Reservation,
                    entity_id: reservation_id.0.clone(),
                    payload: serde_json::json!({
                        "account_id": account_id.0,
                        "amount_micro": amount_micro,
                    }),
                    idempotency_key: Some(format!("reserved:{reservation_id}")),
                },
                now,
            )
            .await?;
        debug!(
            reservation_id = %reservation.reservation_id,
            account_id = %account_id,
            amount_micro,
            expires_at = %reservation.expires_at,
            "credits reserved"
        );
        Ok(reservation)
    }

    /// Finalize a pending reservation at its actual cost.
    ///
    /// Idempotent on `finalization_id`: a retried finalize returns the entry
    /// appended the first time and charges nothing further. The actual cost
    /// moves from `reserved` to `consumed`; the remainder of the estimate
    /// returns to `available`.
    pub async fn finalize(
        &self,
        reservation_id: &ReservationId,
        finalization_id: &str,
        actual_cost_micro: i64,
    ) -> Result<LedgerEntry, LedgerError> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("reservation {reservation_id} not found"))
            })?;
        let entry = self
            .store
            .finalize_reservation(
                reservation_id,
                finalization_id,
                actual_cost_micro,
                EntryDraft {
                    account_id: reservation.account_id.clone(),
                    entry_type: EntryType::Finalize,
                    amount_micro: actual_cost_micro,
                    idempotency_key: Some(finalization_id.to_string()),
                    reservation_id: Some(reservation_id.clone()),
                    transfer_id: None,
                },
                EventDraft {
                    event_type: EconomicEventType::ReservationFinalized,
                    entity_type: EventEntity::Reservation,
                    entity_id: reservation_id.0.clone(),
                    payload: serde_json::json!({
                        "account_id": reservation.account_id.0,
                        "actual_cost_micro": actual_cost_micro,
                    }),
                    idempotency_key: Some(format!("finalized:{finalization_id}")),
                },
                Utc::now(),
            )
            .await?;
        info!(
            reservation_id = %reservation_id,
            finalization_id,
            actual_cost_micro,
            "reservation finalized"
        );
        Ok(entry)
    }

    /// Cancel a pending reservation, returning the full hold to `available`.
    /// Returns `None` when the reservation is already terminal.
    pub async fn release(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        self.settle(
            reservation_id,
            ReservationStatus::Cancelled,
            EconomicEventType::ReservationReleased,
            Utc::now(),
        )
        .await
    }

    /// Expire a pending reservation whose TTL has lapsed. Same no-op
    /// semantics as [`release`](Self::release) on terminal reservations.
    pub async fn expire(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        self.settle(
            reservation_id,
            ReservationStatus::Expired,
            EconomicEventType::ReservationExpired,
            now,
        )
        .await
    }

    /// Sweep: expire every pending reservation whose TTL has lapsed at `now`.
    /// Idempotent; safe to run concurrently from multiple processes.
    pub async fn expire_due_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, LedgerError> {
        let due = self.store.list_due_pending(now).await?;
        let mut expired = Vec::with_capacity(due.len());
        for reservation in due {
            if self
                .expire(&reservation.reservation_id, now)
                .await?
                .is_some()
            {
                expired.push(reservation.reservation_id);
            }
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "expired overdue reservations");
        }
        Ok(expired)
    }

    async fn settle(
        &self,
        reservation_id: &ReservationId,
        terminal: ReservationStatus,
        event_type: EconomicEventType,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let reservation = self
            .store
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("reservation {reservation_id} not found"))
            })?;
        let entry = self
            .store
            .release_reservation(
                reservation_id,
                terminal,
                EntryDraft {
                    account_id: reservation.account_id.clone(),
                    entry_type: EntryType::Release,
                    amount_micro: reservation.estimated_cost_micro,
                    idempotency_key: None,
                    reservation_id: Some(reservation_id.clone()),
                    transfer_id: None,
                },
                EventDraft {
                    event_type,
                    entity_type: EventEntity::Reservation,
                    entity_id: reservation_id.0.clone(),
                    payload: serde_json::json!({
                        "account_id": reservation.account_id.0,
                        "terminal": terminal,
                    }),
                    idempotency_key: Some(format!("settled:{reservation_id}")),
                },
                now,
            )
            .await?;
        if entry.is_some() {
            debug!(reservation_id = %reservation_id, ?terminal, "reservation settled");
        }
        Ok(entry)
    }

    /// Available balance: the sum of `available_micro` across the account's
    /// lots.
    pub async fn available_balance(&self, account_id: &AccountId) -> Result<i64, LedgerError> {
        let lots = self.store.lots_for_account(account_id).await?;
        Ok(lots.iter().map(|lot| lot.available_micro).sum())
    }

    pub async fn get_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Option<CreditAccount>, LedgerError> {
        Ok(self.store.get_account(account_id).await?)
    }

    pub async fn find_account(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<CreditAccount>, LedgerError> {
        Ok(self.store.find_account(entity_type, entity_id).await?)
    }

    pub async fn get_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> Result<Option<Reservation>, LedgerError> {
        Ok(self.store.get_reservation(reservation_id).await?)
    }

    /// Lots for one account in FIFO order.
    pub async fn lots(&self, account_id: &AccountId) -> Result<Vec<CreditLot>, LedgerError> {
        Ok(self.store.lots_for_account(account_id).await?)
    }

    /// Entry log for one account in sequence order.
    pub async fn entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.store.entries_for_account(account_id).await?)
    }
}

impl Default for LedgerService {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_type_for_source(source_type: LotSourceType) -> EntryType {
    match source_type {
        LotSourceType::Deposit | LotSourceType::Purchase => EntryType::Deposit,
        LotSourceType::Grant | LotSourceType::CommonsDividend => EntryType::Grant,
        LotSourceType::TransferIn => EntryType::TransferIn,
        LotSourceType::TbaDeposit => EntryType::ShadowDeposit,
    }
}

/// Ledger-core errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient balance: required {required_micro}, available {available_micro}")]
    InsufficientBalance {
        required_micro: i64,
        available_micro: i64,
    },

    #[error("conservation violation: {0}")]
    ConservationViolation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for LedgerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InsufficientBalance {
                required_micro,
                available_micro,
            } => Self::InsufficientBalance {
                required_micro,
                available_micro,
            },
            StorageError::ConservationViolation(msg) => Self::ConservationViolation(msg),
            StorageError::InvalidState(msg) => Self::InvalidState(msg),
            StorageError::InvalidInput(msg) => Self::InvalidInput(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}
