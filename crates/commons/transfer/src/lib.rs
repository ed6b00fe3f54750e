//! Peer transfer service - atomic account-to-account movement of credit.
//!
//! A transfer debits the source's lots in FIFO order straight to `consumed`,
//! mints a fresh `transfer_in` lot on the destination (never merged, so
//! per-lot provenance survives), and records the transfer row, both ledger
//! entries, and the outbox event in one storage operation. The unique
//! idempotency key is the final arbiter: a retry returns the stored outcome
//! without moving anything again.

#![deny(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use commons_store::{CommonsStore, StorageError, TransferRequest};
use commons_types::{AccountId, Transfer, TransferId, TransferStatus};

/// The peer transfer service.
pub struct TransferService {
    store: Arc<dyn CommonsStore>,
}

impl TransferService {
    /// Create a transfer service over a shared storage adapter. Transfers
    /// only make sense against the same tables the ledger writes, so there
    /// is no self-standing constructor.
    pub fn with_store(store: Arc<dyn CommonsStore>) -> Self {
        Self { store }
    }

    /// Move `amount_micro` from one account to another.
    ///
    /// A rejected transfer (insufficient funds) persists as a `rejected` row
    /// with a reason and surfaces here as [`TransferError::Rejected`]; no
    /// balances move. Retrying with the same `idempotency_key` replays the
    /// stored outcome, completed or rejected.
    pub async fn transfer(
        &self,
        from_account: &AccountId,
        to_account: &AccountId,
        amount_micro: i64,
        idempotency_key: impl Into<String>,
    ) -> Result<Transfer, TransferError> {
        let idempotency_key = idempotency_key.into();
        let transfer = self
            .store
            .execute_transfer(
                TransferRequest {
                    transfer_id: TransferId::generate(),
                    from_account: from_account.clone(),
                    to_account: to_account.clone(),
                    amount_micro,
                    idempotency_key: idempotency_key.clone(),
                },
                Utc::now(),
            )
            .await?;

        match transfer.status {
            TransferStatus::Completed => {
                info!(
                    transfer_id = %transfer.transfer_id,
                    from = %from_account,
                    to = %to_account,
                    amount_micro,
                    "transfer completed"
                );
                Ok(transfer)
            }
            TransferStatus::Rejected => {
                let reason = transfer
                    .reason
                    .clone()
                    .unwrap_or_else(|| "transfer rejected".to_string());
                warn!(
                    transfer_id = %transfer.transfer_id,
                    from = %from_account,
                    to = %to_account,
                    amount_micro,
                    reason = %reason,
                    "transfer rejected"
                );
                Err(TransferError::Rejected { transfer, reason })
            }
            TransferStatus::Pending => Err(TransferError::Backend(
                "storage returned a pending transfer".to_string(),
            )),
        }
    }

    /// Look up a prior transfer by its idempotency key.
    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transfer>, TransferError> {
        Ok(self.store.find_transfer_by_idempotency_key(key).await?)
    }

    /// All transfer rows in creation order, completed and rejected alike.
    pub async fn history(&self) -> Result<Vec<Transfer>, TransferError> {
        Ok(self.store.all_transfers().await?)
    }
}

/// Peer-transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The transfer was recorded as rejected; the row persists for audit.
    #[error("transfer rejected: {reason}")]
    Rejected { transfer: Transfer, reason: String },

    #[error("conservation violation: {0}")]
    ConservationViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for TransferError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::ConservationViolation(msg) => Self::ConservationViolation(msg),
            StorageError::InvalidInput(msg) => Self::InvalidInput(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}
