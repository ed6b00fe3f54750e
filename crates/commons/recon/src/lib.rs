//! Reconciliation: the ledger's out-of-band self-check.
//!
//! A run re-derives every conservation total from raw rows, never from
//! cached aggregates, and compares against what the invariants demand. It
//! reads everything and mutates nothing except its own run history. A
//! failing check marks the run `divergence_detected` for operator attention;
//! it does not block new mutations.

#![deny(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use commons_store::{CommonsStore, StorageError};
use commons_types::{
    CheckResult, CreditLot, LedgerEntry, LotSourceType, ReconCheckCode, ReconStatus,
    ReconciliationRun, Reservation, ReservationLot, ReservationStatus, RunId, Transfer,
    TransferStatus,
};

/// The reconciliation service.
pub struct ReconciliationService {
    store: Arc<dyn CommonsStore>,
}

/// Raw rows a run works from, fetched once up front.
struct Snapshot {
    lots: Vec<CreditLot>,
    entries: Vec<LedgerEntry>,
    holds: Vec<ReservationLot>,
    reservations: HashMap<String, Reservation>,
    transfers: Vec<Transfer>,
}

impl ReconciliationService {
    pub fn with_store(store: Arc<dyn CommonsStore>) -> Self {
        Self { store }
    }

    /// Execute the full check battery and persist the run.
    pub async fn run(&self) -> Result<ReconciliationRun, ReconError> {
        let started_at = Utc::now();
        let run = match self.snapshot().await {
            Ok(snapshot) => {
                let checks = vec![
                    check_lot_conservation(&snapshot),
                    check_account_conservation(&snapshot),
                    check_platform_conservation(&snapshot),
                    check_budget_consistency(&snapshot),
                    check_transfer_conservation(&snapshot),
                    check_deposit_bridge_conservation(&snapshot),
                ];
                let status = ReconciliationRun::status_from_checks(&checks);
                ReconciliationRun {
                    run_id: RunId::generate(),
                    status,
                    checks,
                    started_at,
                    finished_at: Utc::now(),
                }
            }
            Err(err) => {
                // Could not even read the rows: the run itself errored.
                error!(%err, "reconciliation snapshot failed");
                ReconciliationRun {
                    run_id: RunId::generate(),
                    status: ReconStatus::Error,
                    checks: Vec::new(),
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        };

        match run.status {
            ReconStatus::Passed => {
                info!(run_id = %run.run_id, "reconciliation passed")
            }
            ReconStatus::DivergenceDetected => {
                let failing: Vec<_> = run
                    .checks
                    .iter()
                    .filter(|check| !check.passed)
                    .map(|check| check.code)
                    .collect();
                warn!(run_id = %run.run_id, ?failing, "reconciliation detected divergence");
            }
            ReconStatus::Error => {}
        }
        self.store.record_run(run.clone()).await?;
        Ok(run)
    }

    /// Run history, oldest first.
    pub async fn history(&self) -> Result<Vec<ReconciliationRun>, ReconError> {
        Ok(self.store.list_runs().await?)
    }

    async fn snapshot(&self) -> Result<Snapshot, StorageError> {
        let lots = self.store.all_lots().await?;
        let entries = self.store.all_entries().await?;
        let holds = self.store.all_reservation_lots().await?;
        let transfers = self.store.all_transfers().await?;

        let mut reservations = HashMap::new();
        for hold in &holds {
            if reservations.contains_key(&hold.reservation_id.0) {
                continue;
            }
            if let Some(reservation) = self.store.get_reservation(&hold.reservation_id).await? {
                reservations.insert(hold.reservation_id.0.clone(), reservation);
            }
        }
        Ok(Snapshot {
            lots,
            entries,
            holds,
            reservations,
            transfers,
        })
    }
}

/// Every lot's partitions sum to its original, all non-negative.
fn check_lot_conservation(snapshot: &Snapshot) -> CheckResult {
    let violations: Vec<_> = snapshot
        .lots
        .iter()
        .filter(|lot| !lot.conserves())
        .map(|lot| {
            serde_json::json!({
                "lot_id": lot.lot_id.0,
                "original_micro": lot.original_micro,
                "available_micro": lot.available_micro,
                "reserved_micro": lot.reserved_micro,
                "consumed_micro": lot.consumed_micro,
            })
        })
        .collect();
    CheckResult {
        code: ReconCheckCode::LotConservation,
        passed: violations.is_empty(),
        details: serde_json::json!({
            "lots_checked": snapshot.lots.len(),
            "violations": violations,
        }),
    }
}

/// Replaying the entry log per account lands on the current available
/// balance: the last entry's post balance must equal the lot-derived sum.
fn check_account_conservation(snapshot: &Snapshot) -> CheckResult {
    let mut available_by_account: HashMap<&str, i64> = HashMap::new();
    for lot in &snapshot.lots {
        *available_by_account.entry(&lot.account_id.0).or_insert(0) += lot.available_micro;
    }
    let mut last_post: HashMap<&str, i64> = HashMap::new();
    for entry in &snapshot.entries {
        last_post.insert(&entry.account_id.0, entry.post_balance_micro);
    }

    let mut divergences = Vec::new();
    for (account_id, post_balance) in &last_post {
        let derived = available_by_account.get(account_id).copied().unwrap_or(0);
        if derived != *post_balance {
            divergences.push(serde_json::json!({
                "account_id": account_id,
                "ledger_post_balance_micro": post_balance,
                "derived_available_micro": derived,
            }));
        }
    }
    CheckResult {
        code: ReconCheckCode::AccountConservation,
        passed: divergences.is_empty(),
        details: serde_json::json!({
            "accounts_checked": last_post.len(),
            "divergences": divergences,
        }),
    }
}

/// Global partition sums: available + reserved + consumed equals original
/// across the whole platform.
fn check_platform_conservation(snapshot: &Snapshot) -> CheckResult {
    let mut original: i64 = 0;
    let mut available: i64 = 0;
    let mut reserved: i64 = 0;
    let mut consumed: i64 = 0;
    for lot in &snapshot.lots {
        original += lot.original_micro;
        available += lot.available_micro;
        reserved += lot.reserved_micro;
        consumed += lot.consumed_micro;
    }
    let passed = available + reserved + consumed == original
        && available >= 0
        && reserved >= 0
        && consumed >= 0;
    CheckResult {
        code: ReconCheckCode::PlatformConservation,
        passed,
        details: serde_json::json!({
            "original_micro": original,
            "available_micro": available,
            "reserved_micro": reserved,
            "consumed_micro": consumed,
        }),
    }
}

/// Each lot's `reserved_micro` equals the sum of holds from still-pending
/// reservations against it.
fn check_budget_consistency(snapshot: &Snapshot) -> CheckResult {
    let mut live_holds: HashMap<&str, i64> = HashMap::new();
    for hold in &snapshot.holds {
        let pending = snapshot
            .reservations
            .get(&hold.reservation_id.0)
            .map(|reservation| reservation.status == ReservationStatus::Pending)
            .unwrap_or(false);
        if pending {
            *live_holds.entry(&hold.lot_id.0).or_insert(0) += hold.reserved_micro;
        }
    }

    let mut divergences = Vec::new();
    for lot in &snapshot.lots {
        let held = live_holds.get(lot.lot_id.0.as_str()).copied().unwrap_or(0);
        if held != lot.reserved_micro {
            divergences.push(serde_json::json!({
                "lot_id": lot.lot_id.0,
                "lot_reserved_micro": lot.reserved_micro,
                "live_holds_micro": held,
            }));
        }
    }
    CheckResult {
        code: ReconCheckCode::BudgetConsistency,
        passed: divergences.is_empty(),
        details: serde_json::json!({ "divergences": divergences }),
    }
}

/// Every completed transfer has its `transfer_out` entry and a destination
/// `transfer_in` lot of the same amount; no orphaned completions.
fn check_transfer_conservation(snapshot: &Snapshot) -> CheckResult {
    let mut out_entries: HashMap<&str, i64> = HashMap::new();
    for entry in &snapshot.entries {
        if let Some(transfer_id) = &entry.transfer_id {
            if entry.entry_type == commons_types::EntryType::TransferOut {
                out_entries.insert(&transfer_id.0, entry.amount_micro);
            }
        }
    }
    let mut in_lots: HashMap<String, i64> = HashMap::new();
    for lot in &snapshot.lots {
        if lot.source_type == LotSourceType::TransferIn {
            if let Some(source_id) = &lot.source_id {
                in_lots.insert(source_id.clone(), lot.original_micro);
            }
        }
    }

    let mut orphans = Vec::new();
    for transfer in &snapshot.transfers {
        if transfer.status != TransferStatus::Completed {
            continue;
        }
        let out_amount = out_entries.get(transfer.transfer_id.0.as_str()).copied();
        let in_amount = in_lots
            .get(&format!("transfer:{}", transfer.transfer_id))
            .copied();
        if out_amount != Some(transfer.amount_micro) || in_amount != Some(transfer.amount_micro) {
            orphans.push(serde_json::json!({
                "transfer_id": transfer.transfer_id.0,
                "amount_micro": transfer.amount_micro,
                "transfer_out_entry_micro": out_amount,
                "transfer_in_lot_micro": in_amount,
            }));
        }
    }
    CheckResult {
        code: ReconCheckCode::TransferConservation,
        passed: orphans.is_empty(),
        details: serde_json::json!({
            "completed_checked": snapshot
                .transfers
                .iter()
                .filter(|t| t.status == TransferStatus::Completed)
                .count(),
            "orphans": orphans,
        }),
    }
}

/// Deposit-sourced lots map one-to-one onto external occurrences:
/// `(source_type, source_id)` never repeats, and every such lot has its mint
/// entry with the same amount.
fn check_deposit_bridge_conservation(snapshot: &Snapshot) -> CheckResult {
    let mut mint_entries: HashMap<&str, i64> = HashMap::new();
    for entry in &snapshot.entries {
        if let Some(key) = &entry.idempotency_key {
            mint_entries.insert(key.as_str(), entry.amount_micro);
        }
    }

    let mut seen: HashSet<(LotSourceType, &str)> = HashSet::new();
    let mut duplicates = Vec::new();
    let mut unbridged = Vec::new();
    for lot in &snapshot.lots {
        let Some(source_id) = &lot.source_id else {
            continue;
        };
        if !seen.insert((lot.source_type, source_id.as_str())) {
            duplicates.push(serde_json::json!({
                "lot_id": lot.lot_id.0,
                "source_type": lot.source_type,
                "source_id": source_id,
            }));
        }
        if lot.source_type == LotSourceType::TransferIn {
            // Transfer-minted lots are bridged by the transfer check.
            continue;
        }
        let key = lot.source_type.mint_entry_key(source_id);
        if mint_entries.get(key.as_str()).copied() != Some(lot.original_micro) {
            unbridged.push(serde_json::json!({
                "lot_id": lot.lot_id.0,
                "source_type": lot.source_type,
                "source_id": source_id,
                "original_micro": lot.original_micro,
            }));
        }
    }
    CheckResult {
        code: ReconCheckCode::DepositBridgeConservation,
        passed: duplicates.is_empty() && unbridged.is_empty(),
        details: serde_json::json!({
            "duplicates": duplicates,
            "unbridged": unbridged,
        }),
    }
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for ReconError {
    fn from(value: StorageError) -> Self {
        Self::Backend(value.to_string())
    }
}
