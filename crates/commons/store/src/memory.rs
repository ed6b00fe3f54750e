//! In-memory reference implementation for the commons storage traits.
//!
//! This adapter is deterministic and test-friendly. Every table lives behind
//! one `RwLock`, so each trait method is one atomic transaction: a compound
//! mutation either commits across all tables or leaves no trace. Production
//! deployments should use a transactional backend implementing the same
//! traits, with the stated uniqueness and `CHECK` constraints pushed into the
//! store itself.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use commons_types::params as param_keys;
use commons_types::{
    AccountId, AgentId, AgentProposal, AuditSubject, CreditAccount, CreditLot, EconomicEvent,
    EconomicEventType, EntityType, EntryId, EntryType, EventEntity, EventId,
    GovernanceAuditRecord, LedgerEntry, LotId, LotSourceType, ParamRecord, ProposalId,
    ProposalStatus, ProposalVote, ReconciliationRun, Reservation, ReservationId, ReservationLot,
    ReservationStatus, RevenueRule, RevenueRuleStatus, RuleId, RuleNotification, Transfer,
    TransferId, TransferStatus,
};

use crate::model::{
    AuditDraft, EntryDraft, EventDraft, MintRequest, ReserveRequest, TransferRequest,
};
use crate::traits::{
    AccountStore, EntryStore, LotStore, OutboxStore, ParamStore, ProposalStore, ReconStore,
    ReservationStore, RevenueRuleStore, TransferStore,
};
use crate::{StorageError, StorageResult};

/// In-memory commons storage adapter.
#[derive(Default)]
pub struct InMemoryCommonsStore {
    inner: RwLock<CommonsState>,
}

#[derive(Default)]
struct CommonsState {
    accounts: HashMap<AccountId, CreditAccount>,
    account_index: HashMap<(EntityType, String), AccountId>,
    /// Insertion order doubles as FIFO selection order.
    lots: Vec<CreditLot>,
    lot_index: HashMap<LotId, usize>,
    mint_dedup: HashSet<(LotSourceType, String)>,
    reservations: HashMap<ReservationId, Reservation>,
    reservation_lots: Vec<ReservationLot>,
    entries: Vec<LedgerEntry>,
    entry_idempotency: HashMap<String, usize>,
    entry_seq: HashMap<AccountId, u64>,
    transfers: HashMap<TransferId, Transfer>,
    transfer_order: Vec<TransferId>,
    transfer_idempotency: HashMap<String, TransferId>,
    rules: HashMap<RuleId, RevenueRule>,
    rule_order: Vec<RuleId>,
    audit_log: Vec<GovernanceAuditRecord>,
    notifications: Vec<RuleNotification>,
    proposals: HashMap<ProposalId, AgentProposal>,
    proposal_order: Vec<ProposalId>,
    votes: Vec<ProposalVote>,
    vote_index: HashSet<(ProposalId, AgentId)>,
    params: HashMap<String, ParamRecord>,
    events: Vec<EconomicEvent>,
    event_idempotency: HashSet<String>,
    runs: Vec<ReconciliationRun>,
}

impl InMemoryCommonsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, CommonsState>> {
        self.inner
            .read()
            .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, CommonsState>> {
        self.inner
            .write()
            .map_err(|_| StorageError::Backend("state lock poisoned".to_string()))
    }
}

fn available_balance(state: &CommonsState, account_id: &AccountId) -> i64 {
    state
        .lots
        .iter()
        .filter(|lot| &lot.account_id == account_id)
        .map(|lot| lot.available_micro)
        .sum()
}

/// Pick lots for `account_id` in FIFO order until `amount_micro` is covered.
/// Returns `(lot index, amount taken)` pairs, or the total available on
/// shortfall.
fn select_fifo(
    state: &CommonsState,
    account_id: &AccountId,
    amount_micro: i64,
) -> Result<Vec<(usize, i64)>, i64> {
    let mut picked = Vec::new();
    let mut remaining = amount_micro;
    for (index, lot) in state.lots.iter().enumerate() {
        if &lot.account_id != account_id || lot.available_micro <= 0 {
            continue;
        }
        let take = lot.available_micro.min(remaining);
        picked.push((index, take));
        remaining -= take;
        if remaining == 0 {
            return Ok(picked);
        }
    }
    Err(amount_micro - remaining)
}

/// Compute a lot with shifted partitions, refusing any result that breaks
/// the conservation invariant. Nothing is committed here.
fn shift_partitions(
    lot: &CreditLot,
    delta_available: i64,
    delta_reserved: i64,
    delta_consumed: i64,
) -> StorageResult<CreditLot> {
    let overflow = || {
        StorageError::ConservationViolation(format!(
            "partition arithmetic overflow on lot {}",
            lot.lot_id
        ))
    };
    let mut updated = lot.clone();
    updated.available_micro = updated
        .available_micro
        .checked_add(delta_available)
        .ok_or_else(overflow)?;
    updated.reserved_micro = updated
        .reserved_micro
        .checked_add(delta_reserved)
        .ok_or_else(overflow)?;
    updated.consumed_micro = updated
        .consumed_micro
        .checked_add(delta_consumed)
        .ok_or_else(overflow)?;
    if !updated.conserves() {
        return Err(StorageError::ConservationViolation(format!(
            "lot {} partitions would not sum to original",
            updated.lot_id
        )));
    }
    Ok(updated)
}

fn append_entry(
    state: &mut CommonsState,
    draft: EntryDraft,
    pre_balance_micro: i64,
    post_balance_micro: i64,
    now: DateTime<Utc>,
) -> StorageResult<LedgerEntry> {
    if let Some(key) = &draft.idempotency_key {
        if state.entry_idempotency.contains_key(key) {
            return Err(StorageError::Conflict(format!(
                "ledger entry idempotency key {key} already used"
            )));
        }
    }
    let seq = state.entry_seq.entry(draft.account_id.clone()).or_insert(0);
    *seq += 1;
    let entry = LedgerEntry {
        entry_id: EntryId::generate(),
        account_id: draft.account_id.clone(),
        entry_type: draft.entry_type,
        amount_micro: draft.amount_micro,
        idempotency_key: draft.idempotency_key,
        pre_balance_micro,
        post_balance_micro,
        entry_seq: *seq,
        reservation_id: draft.reservation_id,
        transfer_id: draft.transfer_id,
        created_at: now,
    };
    if let Some(key) = &entry.idempotency_key {
        state
            .entry_idempotency
            .insert(key.clone(), state.entries.len());
    }
    state.entries.push(entry.clone());
    Ok(entry)
}

fn append_event(state: &mut CommonsState, draft: EventDraft, now: DateTime<Utc>) {
    if let Some(key) = &draft.idempotency_key {
        // Duplicate emission for the same logical occurrence is suppressed.
        if !state.event_idempotency.insert(key.clone()) {
            return;
        }
    }
    let sequence = state.events.len() as u64 + 1;
    state.events.push(EconomicEvent {
        event_id: EventId::generate(),
        sequence,
        event_type: draft.event_type,
        entity_type: draft.entity_type,
        entity_id: draft.entity_id,
        payload: draft.payload,
        idempotency_key: draft.idempotency_key,
        claimed_by: None,
        claimed_at: None,
        published_at: None,
        created_at: now,
    });
}

fn append_audit(
    state: &mut CommonsState,
    draft: AuditDraft,
    now: DateTime<Utc>,
) -> StorageResult<GovernanceAuditRecord> {
    let previous_hash = state.audit_log.last().map(|record| record.hash.clone());
    let sequence = state.audit_log.len() as u64 + 1;
    let hash = compute_audit_hash(&draft, previous_hash.as_deref(), sequence, now)?;
    let record = GovernanceAuditRecord {
        audit_id: format!("audit-{}", uuid::Uuid::new_v4()),
        subject: draft.subject,
        action: draft.action,
        actor: draft.actor,
        previous_status: draft.previous_status,
        new_status: draft.new_status,
        reason: draft.reason,
        urgent: draft.urgent,
        sequence,
        previous_hash,
        hash,
        timestamp: now,
    };
    state.audit_log.push(record.clone());
    Ok(record)
}

fn compute_audit_hash(
    draft: &AuditDraft,
    previous_hash: Option<&str>,
    sequence: u64,
    timestamp: DateTime<Utc>,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "timestamp": timestamp,
        "subject": draft.subject,
        "action": draft.action,
        "actor": draft.actor,
        "previous_status": draft.previous_status,
        "new_status": draft.new_status,
        "reason": draft.reason,
        "urgent": draft.urgent,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|error| StorageError::Serialization(error.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

fn param_i64(state: &CommonsState, key: &str, default: i64) -> i64 {
    state
        .params
        .get(key)
        .and_then(|record| record.value.as_i64())
        .unwrap_or(default)
}

fn param_u64(state: &CommonsState, key: &str, default: u64) -> u64 {
    state
        .params
        .get(key)
        .and_then(|record| record.value.as_u64())
        .unwrap_or(default)
}

fn set_param_inner(
    state: &mut CommonsState,
    key: &str,
    value: Value,
    actor: &str,
    now: DateTime<Utc>,
) -> ParamRecord {
    let version = state.params.get(key).map(|record| record.version).unwrap_or(0) + 1;
    let record = ParamRecord {
        key: key.to_string(),
        value,
        version,
        updated_by: actor.to_string(),
        updated_at: now,
    };
    state.params.insert(key.to_string(), record.clone());
    record
}

#[async_trait]
impl AccountStore for InMemoryCommonsStore {
    async fn create_account(
        &self,
        entity_type: EntityType,
        entity_id: String,
        now: DateTime<Utc>,
    ) -> StorageResult<CreditAccount> {
        let mut state = self.write()?;
        let key = (entity_type, entity_id.clone());
        if state.account_index.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "account for {entity_type:?}/{entity_id} already exists"
            )));
        }
        let account = CreditAccount {
            account_id: AccountId::generate(),
            entity_type,
            entity_id,
            created_at: now,
        };
        state.account_index.insert(key, account.account_id.clone());
        state
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(account)
    }

    async fn get_account(&self, account_id: &AccountId) -> StorageResult<Option<CreditAccount>> {
        let state = self.read()?;
        Ok(state.accounts.get(account_id).cloned())
    }

    async fn find_account(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StorageResult<Option<CreditAccount>> {
        let state = self.read()?;
        Ok(state
            .account_index
            .get(&(entity_type, entity_id.to_string()))
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn list_accounts(&self) -> StorageResult<Vec<CreditAccount>> {
        let state = self.read()?;
        let mut accounts = state.accounts.values().cloned().collect::<Vec<_>>();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(accounts)
    }
}

#[async_trait]
impl LotStore for InMemoryCommonsStore {
    async fn mint_lot(
        &self,
        request: MintRequest,
        entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<CreditLot> {
        let mut state = self.write()?;
        if !state.accounts.contains_key(&request.account_id) {
            return Err(StorageError::NotFound(format!(
                "account {} not found",
                request.account_id
            )));
        }
        if request.amount_micro <= 0 {
            return Err(StorageError::InvalidInput(
                "mint amount must be positive".to_string(),
            ));
        }
        if state.lot_index.contains_key(&request.lot_id) {
            return Err(StorageError::Conflict(format!(
                "lot {} already exists",
                request.lot_id
            )));
        }
        if let Some(source_id) = &request.source_id {
            let dedup_key = (request.source_type, source_id.clone());
            if state.mint_dedup.contains(&dedup_key) {
                return Err(StorageError::Conflict(format!(
                    "lot for source {:?}/{source_id} already minted",
                    request.source_type
                )));
            }
        }
        if let Some(key) = &entry.idempotency_key {
            if state.entry_idempotency.contains_key(key) {
                return Err(StorageError::Conflict(format!(
                    "ledger entry idempotency key {key} already used"
                )));
            }
        }

        let pre = available_balance(&state, &request.account_id);
        let lot = CreditLot {
            lot_id: request.lot_id.clone(),
            account_id: request.account_id.clone(),
            source_type: request.source_type,
            source_id: request.source_id.clone(),
            original_micro: request.amount_micro,
            available_micro: request.amount_micro,
            reserved_micro: 0,
            consumed_micro: 0,
            created_at: now,
        };
        let next_index = state.lots.len();
        state.lot_index.insert(lot.lot_id.clone(), next_index);
        state.lots.push(lot.clone());
        if let Some(source_id) = request.source_id {
            state.mint_dedup.insert((request.source_type, source_id));
        }
        append_entry(&mut state, entry, pre, pre + request.amount_micro, now)?;
        append_event(&mut state, event, now);
        Ok(lot)
    }

    async fn get_lot(&self, lot_id: &LotId) -> StorageResult<Option<CreditLot>> {
        let state = self.read()?;
        Ok(state
            .lot_index
            .get(lot_id)
            .map(|index| state.lots[*index].clone()))
    }

    async fn lots_for_account(&self, account_id: &AccountId) -> StorageResult<Vec<CreditLot>> {
        let state = self.read()?;
        Ok(state
            .lots
            .iter()
            .filter(|lot| &lot.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn all_lots(&self) -> StorageResult<Vec<CreditLot>> {
        let state = self.read()?;
        Ok(state.lots.clone())
    }
}

#[async_trait]
impl ReservationStore for InMemoryCommonsStore {
    async fn reserve(
        &self,
        request: ReserveRequest,
        entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<Reservation> {
        let mut state = self.write()?;
        if !state.accounts.contains_key(&request.account_id) {
            return Err(StorageError::NotFound(format!(
                "account {} not found",
                request.account_id
            )));
        }
        if request.amount_micro <= 0 {
            return Err(StorageError::InvalidInput(
                "reserve amount must be positive".to_string(),
            ));
        }
        if state.reservations.contains_key(&request.reservation_id) {
            return Err(StorageError::Conflict(format!(
                "reservation {} already exists",
                request.reservation_id
            )));
        }
        // Checked before any partition moves; a duplicate key must leave no
        // trace of the attempt.
        if let Some(key) = &entry.idempotency_key {
            if state.entry_idempotency.contains_key(key) {
                return Err(StorageError::Conflict(format!(
                    "ledger entry idempotency key {key} already used"
                )));
            }
        }

        let picks = select_fifo(&state, &request.account_id, request.amount_micro).map_err(
            |available_micro| StorageError::InsufficientBalance {
                required_micro: request.amount_micro,
                available_micro,
            },
        )?;

        // Compute every touched lot before committing anything.
        let mut updated = Vec::with_capacity(picks.len());
        for (index, take) in &picks {
            updated.push((*index, shift_partitions(&state.lots[*index], -take, *take, 0)?));
        }

        let pre = available_balance(&state, &request.account_id);
        for (index, lot) in updated {
            state.lots[index] = lot;
        }
        for (index, take) in &picks {
            let lot_id = state.lots[*index].lot_id.clone();
            state.reservation_lots.push(ReservationLot {
                reservation_id: request.reservation_id.clone(),
                lot_id,
                reserved_micro: *take,
            });
        }
        let reservation = Reservation {
            reservation_id: request.reservation_id.clone(),
            account_id: request.account_id.clone(),
            estimated_cost_micro: request.amount_micro,
            actual_cost_micro: None,
            finalization_id: None,
            status: ReservationStatus::Pending,
            created_at: now,
            expires_at: request.expires_at,
            updated_at: now,
        };
        state
            .reservations
            .insert(reservation.reservation_id.clone(), reservation.clone());
        append_entry(&mut state, entry, pre, pre - request.amount_micro, now)?;
        append_event(&mut state, event, now);
        Ok(reservation)
    }

    async fn finalize_reservation(
        &self,
        reservation_id: &ReservationId,
        finalization_id: &str,
        actual_cost_micro: i64,
        mut entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<LedgerEntry> {
        let mut state = self.write()?;

        // Idempotency: a retry with a known finalization id returns the
        // stored entry rather than double-charging.
        if let Some(index) = state.entry_idempotency.get(finalization_id) {
            let stored = state.entries[*index].clone();
            if stored.reservation_id.as_ref() == Some(reservation_id) {
                return Ok(stored);
            }
            return Err(StorageError::Conflict(format!(
                "finalization id {finalization_id} already used by another reservation"
            )));
        }

        let reservation = state
            .reservations
            .get(reservation_id)
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!("reservation {reservation_id} not found"))
            })?;
        if reservation.status != ReservationStatus::Pending {
            return Err(StorageError::InvalidState(format!(
                "reservation {reservation_id} is {:?}, not pending",
                reservation.status
            )));
        }
        if actual_cost_micro < 0 {
            return Err(StorageError::InvalidInput(
                "actual cost must be non-negative".to_string(),
            ));
        }

        let holds = state
            .reservation_lots
            .iter()
            .filter(|hold| &hold.reservation_id == reservation_id)
            .cloned()
            .collect::<Vec<_>>();
        let total_held: i64 = holds.iter().map(|hold| hold.reserved_micro).sum();
        if actual_cost_micro > total_held {
            return Err(StorageError::InvalidInput(format!(
                "actual cost {actual_cost_micro} exceeds reserved amount {total_held}"
            )));
        }

        // Consume proportionally to how much was reserved from each lot;
        // floor division first, then the leftover micros go to the earliest
        // lots that still have headroom so the parts sum exactly.
        let mut consumed_per_hold = holds
            .iter()
            .map(|hold| {
                ((actual_cost_micro as i128 * hold.reserved_micro as i128) / total_held as i128)
                    as i64
            })
            .collect::<Vec<_>>();
        let mut leftover = actual_cost_micro - consumed_per_hold.iter().sum::<i64>();
        for (index, hold) in holds.iter().enumerate() {
            if leftover == 0 {
                break;
            }
            let headroom = hold.reserved_micro - consumed_per_hold[index];
            let add = headroom.min(leftover);
            consumed_per_hold[index] += add;
            leftover -= add;
        }

        let mut updated = Vec::with_capacity(holds.len());
        for (position, hold) in holds.iter().enumerate() {
            let lot_index = *state.lot_index.get(&hold.lot_id).ok_or_else(|| {
                StorageError::Backend(format!("lot {} missing for hold", hold.lot_id))
            })?;
            let consumed = consumed_per_hold[position];
            let returned = hold.reserved_micro - consumed;
            updated.push((
                lot_index,
                shift_partitions(
                    &state.lots[lot_index],
                    returned,
                    -hold.reserved_micro,
                    consumed,
                )?,
            ));
        }

        let pre = available_balance(&state, &reservation.account_id);
        for (index, lot) in updated {
            state.lots[index] = lot;
        }
        if let Some(stored) = state.reservations.get_mut(reservation_id) {
            stored.status = ReservationStatus::Finalized;
            stored.actual_cost_micro = Some(actual_cost_micro);
            stored.finalization_id = Some(finalization_id.to_string());
            stored.updated_at = now;
        }
        entry.idempotency_key = Some(finalization_id.to_string());
        let post = pre + (total_held - actual_cost_micro);
        let entry = append_entry(&mut state, entry, pre, post, now)?;
        append_event(&mut state, event, now);
        Ok(entry)
    }

    async fn release_reservation(
        &self,
        reservation_id: &ReservationId,
        terminal: ReservationStatus,
        entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<LedgerEntry>> {
        if !matches!(
            terminal,
            ReservationStatus::Cancelled | ReservationStatus::Expired
        ) {
            return Err(StorageError::InvalidInput(format!(
                "release target must be cancelled or expired, got {terminal:?}"
            )));
        }
        let mut state = self.write()?;
        let reservation = state
            .reservations
            .get(reservation_id)
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!("reservation {reservation_id} not found"))
            })?;
        if reservation.status.is_terminal() {
            // Already settled one way or another; releasing again must not
            // mutate a second time.
            return Ok(None);
        }
        if let Some(key) = &entry.idempotency_key {
            if state.entry_idempotency.contains_key(key) {
                return Err(StorageError::Conflict(format!(
                    "ledger entry idempotency key {key} already used"
                )));
            }
        }

        let holds = state
            .reservation_lots
            .iter()
            .filter(|hold| &hold.reservation_id == reservation_id)
            .cloned()
            .collect::<Vec<_>>();
        let total_held: i64 = holds.iter().map(|hold| hold.reserved_micro).sum();

        let mut updated = Vec::with_capacity(holds.len());
        for hold in &holds {
            let lot_index = *state.lot_index.get(&hold.lot_id).ok_or_else(|| {
                StorageError::Backend(format!("lot {} missing for hold", hold.lot_id))
            })?;
            updated.push((
                lot_index,
                shift_partitions(
                    &state.lots[lot_index],
                    hold.reserved_micro,
                    -hold.reserved_micro,
                    0,
                )?,
            ));
        }

        let pre = available_balance(&state, &reservation.account_id);
        for (index, lot) in updated {
            state.lots[index] = lot;
        }
        if let Some(stored) = state.reservations.get_mut(reservation_id) {
            stored.status = terminal;
            stored.updated_at = now;
        }
        let entry = append_entry(&mut state, entry, pre, pre + total_held, now)?;
        append_event(&mut state, event, now);
        Ok(Some(entry))
    }

    async fn get_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> StorageResult<Option<Reservation>> {
        let state = self.read()?;
        Ok(state.reservations.get(reservation_id).cloned())
    }

    async fn holds_for_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> StorageResult<Vec<ReservationLot>> {
        let state = self.read()?;
        Ok(state
            .reservation_lots
            .iter()
            .filter(|hold| &hold.reservation_id == reservation_id)
            .cloned()
            .collect())
    }

    async fn list_due_pending(&self, now: DateTime<Utc>) -> StorageResult<Vec<Reservation>> {
        let state = self.read()?;
        let mut due = state
            .reservations
            .values()
            .filter(|reservation| {
                reservation.status == ReservationStatus::Pending && reservation.expires_at <= now
            })
            .cloned()
            .collect::<Vec<_>>();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(due)
    }

    async fn all_reservation_lots(&self) -> StorageResult<Vec<ReservationLot>> {
        let state = self.read()?;
        Ok(state.reservation_lots.clone())
    }
}

#[async_trait]
impl EntryStore for InMemoryCommonsStore {
    async fn entries_for_account(
        &self,
        account_id: &AccountId,
    ) -> StorageResult<Vec<LedgerEntry>> {
        let state = self.read()?;
        Ok(state
            .entries
            .iter()
            .filter(|entry| &entry.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn all_entries(&self) -> StorageResult<Vec<LedgerEntry>> {
        let state = self.read()?;
        Ok(state.entries.clone())
    }

    async fn find_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> StorageResult<Option<LedgerEntry>> {
        let state = self.read()?;
        Ok(state
            .entry_idempotency
            .get(key)
            .map(|index| state.entries[*index].clone()))
    }
}

#[async_trait]
impl TransferStore for InMemoryCommonsStore {
    async fn execute_transfer(
        &self,
        request: TransferRequest,
        now: DateTime<Utc>,
    ) -> StorageResult<Transfer> {
        let mut state = self.write()?;

        // Idempotent retry: the unique key returns the stored outcome,
        // completed or rejected, without re-executing.
        if let Some(transfer_id) = state.transfer_idempotency.get(&request.idempotency_key) {
            let stored = state.transfers.get(transfer_id).cloned().ok_or_else(|| {
                StorageError::Backend("transfer index points at missing row".to_string())
            })?;
            return Ok(stored);
        }

        if request.from_account == request.to_account {
            return Err(StorageError::InvalidInput(
                "transfer source and destination must differ".to_string(),
            ));
        }
        if request.amount_micro <= 0 {
            return Err(StorageError::InvalidInput(
                "transfer amount must be positive".to_string(),
            ));
        }
        for account_id in [&request.from_account, &request.to_account] {
            if !state.accounts.contains_key(account_id) {
                return Err(StorageError::NotFound(format!(
                    "account {account_id} not found"
                )));
            }
        }

        match select_fifo(&state, &request.from_account, request.amount_micro) {
            Err(available_micro) => {
                let transfer = Transfer {
                    transfer_id: request.transfer_id.clone(),
                    from_account: request.from_account.clone(),
                    to_account: request.to_account.clone(),
                    amount_micro: request.amount_micro,
                    idempotency_key: request.idempotency_key.clone(),
                    status: TransferStatus::Rejected,
                    reason: Some(format!(
                        "insufficient balance: required {}, available {available_micro}",
                        request.amount_micro
                    )),
                    created_at: now,
                    updated_at: now,
                };
                state
                    .transfer_idempotency
                    .insert(request.idempotency_key.clone(), transfer.transfer_id.clone());
                state.transfer_order.push(transfer.transfer_id.clone());
                state
                    .transfers
                    .insert(transfer.transfer_id.clone(), transfer.clone());
                append_event(
                    &mut state,
                    EventDraft {
                        event_type: EconomicEventType::TransferRejected,
                        entity_type: EventEntity::Transfer,
                        entity_id: transfer.transfer_id.0.clone(),
                        payload: serde_json::json!({
                            "from_account": transfer.from_account.0,
                            "to_account": transfer.to_account.0,
                            "amount_micro": transfer.amount_micro,
                            "reason": transfer.reason,
                        }),
                        idempotency_key: Some(format!(
                            "transfer-rejected:{}",
                            request.idempotency_key
                        )),
                    },
                    now,
                );
                Ok(transfer)
            }
            Ok(picks) => {
                let mut updated = Vec::with_capacity(picks.len());
                for (index, take) in &picks {
                    updated.push((
                        *index,
                        shift_partitions(&state.lots[*index], -take, 0, *take)?,
                    ));
                }

                let from_pre = available_balance(&state, &request.from_account);
                let to_pre = available_balance(&state, &request.to_account);
                for (index, lot) in updated {
                    state.lots[index] = lot;
                }

                // Transfers always mint a fresh lot on the destination so
                // per-lot provenance survives.
                let incoming = CreditLot {
                    lot_id: LotId::generate(),
                    account_id: request.to_account.clone(),
                    source_type: LotSourceType::TransferIn,
                    source_id: Some(format!("transfer:{}", request.transfer_id)),
                    original_micro: request.amount_micro,
                    available_micro: request.amount_micro,
                    reserved_micro: 0,
                    consumed_micro: 0,
                    created_at: now,
                };
                let next_index = state.lots.len();
                state.lot_index.insert(incoming.lot_id.clone(), next_index);
                state.mint_dedup.insert((
                    LotSourceType::TransferIn,
                    format!("transfer:{}", request.transfer_id),
                ));
                state.lots.push(incoming);

                append_entry(
                    &mut state,
                    EntryDraft {
                        account_id: request.from_account.clone(),
                        entry_type: EntryType::TransferOut,
                        amount_micro: request.amount_micro,
                        idempotency_key: Some(format!(
                            "transfer-out:{}",
                            request.idempotency_key
                        )),
                        reservation_id: None,
                        transfer_id: Some(request.transfer_id.clone()),
                    },
                    from_pre,
                    from_pre - request.amount_micro,
                    now,
                )?;
                append_entry(
                    &mut state,
                    EntryDraft {
                        account_id: request.to_account.clone(),
                        entry_type: EntryType::TransferIn,
                        amount_micro: request.amount_micro,
                        idempotency_key: Some(format!(
                            "transfer-in:{}",
                            request.idempotency_key
                        )),
                        reservation_id: None,
                        transfer_id: Some(request.transfer_id.clone()),
                    },
                    to_pre,
                    to_pre + request.amount_micro,
                    now,
                )?;

                let transfer = Transfer {
                    transfer_id: request.transfer_id.clone(),
                    from_account: request.from_account.clone(),
                    to_account: request.to_account.clone(),
                    amount_micro: request.amount_micro,
                    idempotency_key: request.idempotency_key.clone(),
                    status: TransferStatus::Completed,
                    reason: None,
                    created_at: now,
                    updated_at: now,
                };
                state
                    .transfer_idempotency
                    .insert(request.idempotency_key.clone(), transfer.transfer_id.clone());
                state.transfer_order.push(transfer.transfer_id.clone());
                state
                    .transfers
                    .insert(transfer.transfer_id.clone(), transfer.clone());
                append_event(
                    &mut state,
                    EventDraft {
                        event_type: EconomicEventType::TransferCompleted,
                        entity_type: EventEntity::Transfer,
                        entity_id: transfer.transfer_id.0.clone(),
                        payload: serde_json::json!({
                            "from_account": transfer.from_account.0,
                            "to_account": transfer.to_account.0,
                            "amount_micro": transfer.amount_micro,
                        }),
                        idempotency_key: Some(format!("transfer:{}", request.idempotency_key)),
                    },
                    now,
                );
                Ok(transfer)
            }
        }
    }

    async fn find_transfer_by_idempotency_key(
        &self,
        key: &str,
    ) -> StorageResult<Option<Transfer>> {
        let state = self.read()?;
        Ok(state
            .transfer_idempotency
            .get(key)
            .and_then(|transfer_id| state.transfers.get(transfer_id))
            .cloned())
    }

    async fn all_transfers(&self) -> StorageResult<Vec<Transfer>> {
        let state = self.read()?;
        Ok(state
            .transfer_order
            .iter()
            .filter_map(|transfer_id| state.transfers.get(transfer_id))
            .cloned()
            .collect())
    }
}

/// Activate one `cooling_down` rule, superseding the incumbent atomically.
fn activate_rule_inner(
    state: &mut CommonsState,
    rule_id: &RuleId,
    actor: &str,
    reason: Option<String>,
    urgent: bool,
    now: DateTime<Utc>,
) -> StorageResult<RevenueRule> {
    let rule = state
        .rules
        .get(rule_id)
        .cloned()
        .ok_or_else(|| StorageError::NotFound(format!("revenue rule {rule_id} not found")))?;
    if !rule.status.can_transition(RevenueRuleStatus::Active) {
        return Err(StorageError::InvalidState(format!(
            "revenue rule {rule_id} is {:?}, cannot activate",
            rule.status
        )));
    }

    let incumbent_id = state
        .rule_order
        .iter()
        .find(|candidate| {
            state
                .rules
                .get(*candidate)
                .map(|r| r.status == RevenueRuleStatus::Active)
                .unwrap_or(false)
        })
        .cloned();
    let old_split = incumbent_id
        .as_ref()
        .and_then(|id| state.rules.get(id))
        .map(|r| r.split);

    if let Some(incumbent_id) = &incumbent_id {
        if let Some(incumbent) = state.rules.get_mut(incumbent_id) {
            incumbent.status = RevenueRuleStatus::Superseded;
            incumbent.updated_at = now;
        }
        append_audit(
            state,
            AuditDraft {
                subject: AuditSubject::Rule(incumbent_id.clone()),
                action: "supersede".to_string(),
                actor: actor.to_string(),
                previous_status: Some("active".to_string()),
                new_status: Some("superseded".to_string()),
                reason: Some(format!("superseded by rule {rule_id}")),
                urgent: false,
            },
            now,
        )?;
    }

    let activated = {
        let stored = state
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| StorageError::NotFound(format!("revenue rule {rule_id} not found")))?;
        stored.status = RevenueRuleStatus::Active;
        stored.activated_at = Some(now);
        stored.updated_at = now;
        stored.clone()
    };

    append_audit(
        state,
        AuditDraft {
            subject: AuditSubject::Rule(rule_id.clone()),
            action: if urgent {
                "emergency_activate".to_string()
            } else {
                "activate".to_string()
            },
            actor: actor.to_string(),
            previous_status: Some("cooling_down".to_string()),
            new_status: Some("active".to_string()),
            reason,
            urgent,
        },
        now,
    )?;
    state.notifications.push(RuleNotification {
        notification_id: format!("notify-{}", uuid::Uuid::new_v4()),
        rule_id: rule_id.clone(),
        old_split,
        new_split: activated.split,
        urgent,
        created_at: now,
    });
    append_event(
        state,
        EventDraft {
            event_type: EconomicEventType::RevenueRuleActivated,
            entity_type: EventEntity::RevenueRule,
            entity_id: rule_id.0.clone(),
            payload: serde_json::json!({
                "old_split": old_split,
                "new_split": activated.split,
                "urgent": urgent,
            }),
            idempotency_key: Some(format!("rule-activated:{rule_id}")),
        },
        now,
    );
    Ok(activated)
}

#[async_trait]
impl RevenueRuleStore for InMemoryCommonsStore {
    async fn insert_rule(
        &self,
        rule: RevenueRule,
        audit: AuditDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule> {
        let mut state = self.write()?;
        if state.rules.contains_key(&rule.rule_id) {
            return Err(StorageError::Conflict(format!(
                "revenue rule {} already exists",
                rule.rule_id
            )));
        }
        if rule.status != RevenueRuleStatus::Draft {
            return Err(StorageError::InvalidInput(
                "new revenue rules must be drafts".to_string(),
            ));
        }
        if !rule.split.is_balanced() {
            return Err(StorageError::InvalidInput(format!(
                "revenue split must sum to 10000 bps, got {}",
                rule.split.total_bps()
            )));
        }
        state.rule_order.push(rule.rule_id.clone());
        state.rules.insert(rule.rule_id.clone(), rule.clone());
        append_audit(&mut state, audit, now)?;
        Ok(rule)
    }

    async fn submit_rule(
        &self,
        rule_id: &RuleId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule> {
        let mut state = self.write()?;
        let updated = {
            let rule = state.rules.get_mut(rule_id).ok_or_else(|| {
                StorageError::NotFound(format!("revenue rule {rule_id} not found"))
            })?;
            if rule.status != RevenueRuleStatus::Draft {
                return Err(StorageError::InvalidState(format!(
                    "revenue rule {rule_id} is {:?}, cannot submit",
                    rule.status
                )));
            }
            rule.status = RevenueRuleStatus::PendingApproval;
            rule.updated_at = now;
            rule.clone()
        };
        append_audit(
            &mut state,
            AuditDraft {
                subject: AuditSubject::Rule(rule_id.clone()),
                action: "submit".to_string(),
                actor: actor.to_string(),
                previous_status: Some("draft".to_string()),
                new_status: Some("pending_approval".to_string()),
                reason: None,
                urgent: false,
            },
            now,
        )?;
        Ok(updated)
    }

    async fn approve_rule(
        &self,
        rule_id: &RuleId,
        approved_by: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule> {
        let mut state = self.write()?;
        let cooldown_secs = param_i64(
            &state,
            param_keys::REVENUE_COOLDOWN_SECS,
            param_keys::DEFAULT_REVENUE_COOLDOWN_SECS,
        );
        let updated = {
            let rule = state.rules.get_mut(rule_id).ok_or_else(|| {
                StorageError::NotFound(format!("revenue rule {rule_id} not found"))
            })?;
            if rule.status != RevenueRuleStatus::PendingApproval {
                return Err(StorageError::InvalidState(format!(
                    "revenue rule {rule_id} is {:?}, cannot approve",
                    rule.status
                )));
            }
            if rule.proposed_by == approved_by {
                return Err(StorageError::FourEyes(format!(
                    "approver {approved_by} proposed rule {rule_id}"
                )));
            }
            rule.status = RevenueRuleStatus::CoolingDown;
            rule.approved_by = Some(approved_by.to_string());
            rule.activates_at = Some(now + Duration::seconds(cooldown_secs));
            rule.updated_at = now;
            rule.clone()
        };
        append_audit(
            &mut state,
            AuditDraft {
                subject: AuditSubject::Rule(rule_id.clone()),
                action: "approve".to_string(),
                actor: approved_by.to_string(),
                previous_status: Some("pending_approval".to_string()),
                new_status: Some("cooling_down".to_string()),
                reason: None,
                urgent: false,
            },
            now,
        )?;
        Ok(updated)
    }

    async fn reject_rule(
        &self,
        rule_id: &RuleId,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule> {
        let mut state = self.write()?;
        let (updated, previous) = {
            let rule = state.rules.get_mut(rule_id).ok_or_else(|| {
                StorageError::NotFound(format!("revenue rule {rule_id} not found"))
            })?;
            if !rule.status.can_transition(RevenueRuleStatus::Rejected) {
                return Err(StorageError::InvalidState(format!(
                    "revenue rule {rule_id} is {:?}, cannot reject",
                    rule.status
                )));
            }
            let previous = rule.status;
            rule.status = RevenueRuleStatus::Rejected;
            rule.updated_at = now;
            (rule.clone(), previous)
        };
        append_audit(
            &mut state,
            AuditDraft {
                subject: AuditSubject::Rule(rule_id.clone()),
                action: "reject".to_string(),
                actor: actor.to_string(),
                previous_status: Some(format!("{previous:?}").to_lowercase()),
                new_status: Some("rejected".to_string()),
                reason: Some(reason.to_string()),
                urgent: false,
            },
            now,
        )?;
        Ok(updated)
    }

    async fn activate_rule_now(
        &self,
        rule_id: &RuleId,
        actor: &str,
        justification: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule> {
        if justification.trim().is_empty() {
            return Err(StorageError::InvalidInput(
                "emergency activation requires a justification".to_string(),
            ));
        }
        let mut state = self.write()?;
        activate_rule_inner(
            &mut state,
            rule_id,
            actor,
            Some(justification.to_string()),
            true,
            now,
        )
    }

    async fn activate_ready_rules(&self, now: DateTime<Utc>) -> StorageResult<Vec<RevenueRule>> {
        let mut state = self.write()?;
        let mut ready = state
            .rules
            .values()
            .filter(|rule| {
                rule.status == RevenueRuleStatus::CoolingDown
                    && rule.activates_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|rule| (rule.activates_at, rule.rule_id.clone()))
            .collect::<Vec<_>>();
        // Earliest activation first; rule id breaks ties deterministically.
        ready.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));

        let mut activated = Vec::with_capacity(ready.len());
        for (_, rule_id) in ready {
            activated.push(activate_rule_inner(
                &mut state, &rule_id, "system", None, false, now,
            )?);
        }
        Ok(activated)
    }

    async fn get_rule(&self, rule_id: &RuleId) -> StorageResult<Option<RevenueRule>> {
        let state = self.read()?;
        Ok(state.rules.get(rule_id).cloned())
    }

    async fn active_rule(&self) -> StorageResult<Option<RevenueRule>> {
        let state = self.read()?;
        Ok(state
            .rules
            .values()
            .find(|rule| rule.status == RevenueRuleStatus::Active)
            .cloned())
    }

    async fn list_rules(&self) -> StorageResult<Vec<RevenueRule>> {
        let state = self.read()?;
        Ok(state
            .rule_order
            .iter()
            .filter_map(|rule_id| state.rules.get(rule_id))
            .cloned()
            .collect())
    }

    async fn list_rule_audit(&self) -> StorageResult<Vec<GovernanceAuditRecord>> {
        let state = self.read()?;
        Ok(state.audit_log.clone())
    }

    async fn list_notifications(&self) -> StorageResult<Vec<RuleNotification>> {
        let state = self.read()?;
        Ok(state.notifications.clone())
    }
}

/// Advance an open proposal through quorum when its tally reaches the
/// threshold, starting the cooldown in the same mutation.
fn advance_if_quorum(
    state: &mut CommonsState,
    proposal_id: &ProposalId,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    // The threshold is resolved at every tally, never trusted from the row:
    // a parameter change takes effect on the next vote.
    let quorum_weight = param_u64(
        state,
        param_keys::QUORUM_WEIGHT,
        param_keys::DEFAULT_QUORUM_WEIGHT,
    );
    let reached = match state.proposals.get_mut(proposal_id) {
        Some(proposal) => {
            proposal.quorum_weight = quorum_weight;
            proposal.status == ProposalStatus::Open && proposal.total_weight >= quorum_weight
        }
        None => false,
    };
    if !reached {
        return Ok(());
    }

    let cooldown_secs = param_i64(
        state,
        param_keys::AGENT_COOLDOWN_SECS,
        param_keys::DEFAULT_AGENT_COOLDOWN_SECS,
    );
    let actor = {
        let proposal = state.proposals.get_mut(proposal_id).ok_or_else(|| {
            StorageError::NotFound(format!("proposal {proposal_id} not found"))
        })?;
        // The quorum_reached state is momentary: cooldown starts in the same
        // mutation, so both transitions land as audit rows.
        proposal.status = ProposalStatus::CoolingDown;
        proposal.cooldown_ends_at = Some(now + Duration::seconds(cooldown_secs));
        proposal.updated_at = now;
        proposal.proposer.to_string()
    };
    append_audit(
        state,
        AuditDraft {
            subject: AuditSubject::Proposal(proposal_id.clone()),
            action: "quorum".to_string(),
            actor: actor.clone(),
            previous_status: Some("open".to_string()),
            new_status: Some("quorum_reached".to_string()),
            reason: None,
            urgent: false,
        },
        now,
    )?;
    append_audit(
        state,
        AuditDraft {
            subject: AuditSubject::Proposal(proposal_id.clone()),
            action: "cooldown_started".to_string(),
            actor,
            previous_status: Some("quorum_reached".to_string()),
            new_status: Some("cooling_down".to_string()),
            reason: None,
            urgent: false,
        },
        now,
    )?;
    Ok(())
}

#[async_trait]
impl ProposalStore for InMemoryCommonsStore {
    async fn insert_proposal(
        &self,
        mut proposal: AgentProposal,
        now: DateTime<Utc>,
    ) -> StorageResult<AgentProposal> {
        let mut state = self.write()?;
        if state.proposals.contains_key(&proposal.proposal_id) {
            return Err(StorageError::Conflict(format!(
                "proposal {} already exists",
                proposal.proposal_id
            )));
        }
        if proposal.status != ProposalStatus::Open {
            return Err(StorageError::InvalidInput(
                "new proposals must be open".to_string(),
            ));
        }
        // Backstop for the service-level whitelist check.
        if !param_keys::is_proposable(&proposal.param_key) {
            return Err(StorageError::InvalidInput(format!(
                "parameter {} is not proposable by agents",
                proposal.param_key
            )));
        }

        proposal.quorum_weight = param_u64(
            &state,
            param_keys::QUORUM_WEIGHT,
            param_keys::DEFAULT_QUORUM_WEIGHT,
        );
        proposal.total_weight = proposal.proposer_weight;

        let proposal_id = proposal.proposal_id.clone();
        let proposer = proposal.proposer.clone();
        state.proposal_order.push(proposal_id.clone());
        state
            .vote_index
            .insert((proposal_id.clone(), proposer.clone()));
        state.votes.push(ProposalVote {
            proposal_id: proposal_id.clone(),
            agent_id: proposer.clone(),
            weight: proposal.proposer_weight,
            cast_at: now,
        });
        state.proposals.insert(proposal_id.clone(), proposal);
        append_audit(
            &mut state,
            AuditDraft {
                subject: AuditSubject::Proposal(proposal_id.clone()),
                action: "propose".to_string(),
                actor: proposer.to_string(),
                previous_status: None,
                new_status: Some("open".to_string()),
                reason: None,
                urgent: false,
            },
            now,
        )?;
        advance_if_quorum(&mut state, &proposal_id, now)?;
        state
            .proposals
            .get(&proposal_id)
            .cloned()
            .ok_or_else(|| StorageError::Backend("proposal vanished during insert".to_string()))
    }

    async fn cast_vote(
        &self,
        proposal_id: &ProposalId,
        agent_id: AgentId,
        weight: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<AgentProposal> {
        let mut state = self.write()?;
        {
            let proposal = state.proposals.get(proposal_id).ok_or_else(|| {
                StorageError::NotFound(format!("proposal {proposal_id} not found"))
            })?;
            if proposal.status != ProposalStatus::Open {
                return Err(StorageError::InvalidState(format!(
                    "proposal {proposal_id} is {:?}, voting closed",
                    proposal.status
                )));
            }
            if now > proposal.deadline {
                return Err(StorageError::InvalidState(format!(
                    "proposal {proposal_id} is past its deadline"
                )));
            }
        }
        let vote_key = (proposal_id.clone(), agent_id.clone());
        if state.vote_index.contains(&vote_key) {
            return Err(StorageError::AlreadyVoted {
                proposal_id: proposal_id.0.clone(),
                agent_id: agent_id.0.clone(),
            });
        }

        state.vote_index.insert(vote_key);
        state.votes.push(ProposalVote {
            proposal_id: proposal_id.clone(),
            agent_id: agent_id.clone(),
            weight,
            cast_at: now,
        });
        {
            let proposal = state.proposals.get_mut(proposal_id).ok_or_else(|| {
                StorageError::NotFound(format!("proposal {proposal_id} not found"))
            })?;
            proposal.total_weight = proposal.total_weight.checked_add(weight).ok_or_else(|| {
                StorageError::InvalidInput("vote weight overflow".to_string())
            })?;
            proposal.updated_at = now;
        }
        advance_if_quorum(&mut state, proposal_id, now)?;
        state
            .proposals
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| StorageError::Backend("proposal vanished during vote".to_string()))
    }

    async fn activate_ready_proposals(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<AgentProposal>> {
        let mut state = self.write()?;
        let ready = state
            .proposal_order
            .iter()
            .filter(|proposal_id| {
                state
                    .proposals
                    .get(*proposal_id)
                    .map(|proposal| {
                        proposal.status == ProposalStatus::CoolingDown
                            && proposal.cooldown_ends_at.map(|at| at <= now).unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect::<Vec<_>>();

        let mut activated = Vec::with_capacity(ready.len());
        for proposal_id in ready {
            let (param_key, proposed_value, actor) = {
                let proposal = state.proposals.get_mut(&proposal_id).ok_or_else(|| {
                    StorageError::NotFound(format!("proposal {proposal_id} not found"))
                })?;
                proposal.status = ProposalStatus::Activated;
                proposal.updated_at = now;
                (
                    proposal.param_key.clone(),
                    proposal.proposed_value.clone(),
                    proposal.proposer.to_string(),
                )
            };
            set_param_inner(
                &mut state,
                &param_key,
                proposed_value.clone(),
                "agent-governance",
                now,
            );
            append_audit(
                &mut state,
                AuditDraft {
                    subject: AuditSubject::Proposal(proposal_id.clone()),
                    action: "activate".to_string(),
                    actor,
                    previous_status: Some("cooling_down".to_string()),
                    new_status: Some("activated".to_string()),
                    reason: None,
                    urgent: false,
                },
                now,
            )?;
            append_event(
                &mut state,
                EventDraft {
                    event_type: EconomicEventType::ParameterActivated,
                    entity_type: EventEntity::Proposal,
                    entity_id: proposal_id.0.clone(),
                    payload: serde_json::json!({
                        "param_key": param_key,
                        "value": proposed_value,
                    }),
                    idempotency_key: Some(format!("proposal-activated:{proposal_id}")),
                },
                now,
            );
            if let Some(proposal) = state.proposals.get(&proposal_id) {
                activated.push(proposal.clone());
            }
        }
        Ok(activated)
    }

    async fn expire_stale_proposals(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<AgentProposal>> {
        let mut state = self.write()?;
        let stale = state
            .proposal_order
            .iter()
            .filter(|proposal_id| {
                state
                    .proposals
                    .get(*proposal_id)
                    .map(|proposal| {
                        !proposal.status.is_terminal() && proposal.deadline < now
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect::<Vec<_>>();

        let mut expired = Vec::with_capacity(stale.len());
        for proposal_id in stale {
            let previous = {
                let proposal = state.proposals.get_mut(&proposal_id).ok_or_else(|| {
                    StorageError::NotFound(format!("proposal {proposal_id} not found"))
                })?;
                let previous = proposal.status;
                proposal.status = ProposalStatus::Expired;
                proposal.updated_at = now;
                previous
            };
            append_audit(
                &mut state,
                AuditDraft {
                    subject: AuditSubject::Proposal(proposal_id.clone()),
                    action: "expire".to_string(),
                    actor: "system".to_string(),
                    previous_status: Some(format!("{previous:?}").to_lowercase()),
                    new_status: Some("expired".to_string()),
                    reason: None,
                    urgent: false,
                },
                now,
            )?;
            if let Some(proposal) = state.proposals.get(&proposal_id) {
                expired.push(proposal.clone());
            }
        }
        Ok(expired)
    }

    async fn get_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> StorageResult<Option<AgentProposal>> {
        let state = self.read()?;
        Ok(state.proposals.get(proposal_id).cloned())
    }

    async fn list_proposals(&self) -> StorageResult<Vec<AgentProposal>> {
        let state = self.read()?;
        Ok(state
            .proposal_order
            .iter()
            .filter_map(|proposal_id| state.proposals.get(proposal_id))
            .cloned()
            .collect())
    }

    async fn votes_for(&self, proposal_id: &ProposalId) -> StorageResult<Vec<ProposalVote>> {
        let state = self.read()?;
        Ok(state
            .votes
            .iter()
            .filter(|vote| &vote.proposal_id == proposal_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ParamStore for InMemoryCommonsStore {
    async fn get_param(&self, key: &str) -> StorageResult<Option<ParamRecord>> {
        let state = self.read()?;
        Ok(state.params.get(key).cloned())
    }

    async fn set_param(
        &self,
        key: &str,
        value: Value,
        actor: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ParamRecord> {
        let mut state = self.write()?;
        Ok(set_param_inner(&mut state, key, value, actor, now))
    }

    async fn list_params(&self) -> StorageResult<Vec<ParamRecord>> {
        let state = self.read()?;
        let mut params = state.params.values().cloned().collect::<Vec<_>>();
        params.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(params)
    }
}

#[async_trait]
impl OutboxStore for InMemoryCommonsStore {
    async fn claim_next_event(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StorageResult<Option<EconomicEvent>> {
        let mut state = self.write()?;
        let next = state
            .events
            .iter_mut()
            .find(|event| event.claimable(now, stale_after));
        Ok(next.map(|event| {
            event.claimed_by = Some(worker.to_string());
            event.claimed_at = Some(now);
            event.clone()
        }))
    }

    async fn mark_published(
        &self,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> StorageResult<EconomicEvent> {
        let mut state = self.write()?;
        let event = state
            .events
            .iter_mut()
            .find(|event| &event.event_id == event_id)
            .ok_or_else(|| StorageError::NotFound(format!("event {event_id} not found")))?;
        if event.published_at.is_some() {
            // Duplicate ack after a reclaim race is harmless.
            return Ok(event.clone());
        }
        if event.claimed_by.is_none() {
            return Err(StorageError::InvalidState(format!(
                "event {event_id} has never been claimed"
            )));
        }
        event.published_at = Some(now);
        Ok(event.clone())
    }

    async fn list_unpublished(&self) -> StorageResult<Vec<EconomicEvent>> {
        let state = self.read()?;
        Ok(state
            .events
            .iter()
            .filter(|event| event.published_at.is_none())
            .cloned()
            .collect())
    }

    async fn all_events(&self) -> StorageResult<Vec<EconomicEvent>> {
        let state = self.read()?;
        Ok(state.events.clone())
    }
}

#[async_trait]
impl ReconStore for InMemoryCommonsStore {
    async fn record_run(&self, run: ReconciliationRun) -> StorageResult<()> {
        let mut state = self.write()?;
        state.runs.push(run);
        Ok(())
    }

    async fn list_runs(&self) -> StorageResult<Vec<ReconciliationRun>> {
        let state = self.read()?;
        Ok(state.runs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commons_types::RevenueSplit;

    fn entry_draft(
        account_id: &AccountId,
        entry_type: EntryType,
        amount_micro: i64,
        idempotency_key: Option<&str>,
        reservation_id: Option<&ReservationId>,
    ) -> EntryDraft {
        EntryDraft {
            account_id: account_id.clone(),
            entry_type,
            amount_micro,
            idempotency_key: idempotency_key.map(str::to_string),
            reservation_id: reservation_id.cloned(),
            transfer_id: None,
        }
    }

    fn event_draft(event_type: EconomicEventType, entity_id: &str, key: &str) -> EventDraft {
        EventDraft {
            event_type,
            entity_type: EventEntity::Lot,
            entity_id: entity_id.to_string(),
            payload: serde_json::json!({}),
            idempotency_key: Some(key.to_string()),
        }
    }

    async fn account_with_lot(
        store: &InMemoryCommonsStore,
        amount_micro: i64,
        now: DateTime<Utc>,
    ) -> AccountId {
        let account = store
            .create_account(EntityType::Person, uuid::Uuid::new_v4().to_string(), now)
            .await
            .unwrap();
        mint(store, &account.account_id, amount_micro, now).await;
        account.account_id
    }

    async fn mint(
        store: &InMemoryCommonsStore,
        account_id: &AccountId,
        amount_micro: i64,
        now: DateTime<Utc>,
    ) -> CreditLot {
        let lot_id = LotId::generate();
        store
            .mint_lot(
                MintRequest {
                    lot_id: lot_id.clone(),
                    account_id: account_id.clone(),
                    amount_micro,
                    source_type: LotSourceType::Deposit,
                    source_id: Some(format!("dep-{lot_id}")),
                },
                entry_draft(
                    account_id,
                    EntryType::Deposit,
                    amount_micro,
                    Some(&format!("mint:{lot_id}")),
                    None,
                ),
                event_draft(
                    EconomicEventType::LotMinted,
                    &lot_id.0,
                    &format!("lot-minted:{lot_id}"),
                ),
                now,
            )
            .await
            .unwrap()
    }

    async fn available(store: &InMemoryCommonsStore, account_id: &AccountId) -> i64 {
        store
            .lots_for_account(account_id)
            .await
            .unwrap()
            .iter()
            .map(|lot| lot.available_micro)
            .sum()
    }

    async fn reserve(
        store: &InMemoryCommonsStore,
        account_id: &AccountId,
        amount_micro: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Reservation> {
        let reservation_id = ReservationId::generate();
        store
            .reserve(
                ReserveRequest {
                    reservation_id: reservation_id.clone(),
                    account_id: account_id.clone(),
                    amount_micro,
                    expires_at: now + Duration::minutes(5),
                },
                entry_draft(
                    account_id,
                    EntryType::Reserve,
                    amount_micro,
                    None,
                    Some(&reservation_id),
                ),
                event_draft(
                    EconomicEventType::CreditsReserved,
                    &reservation_id.0,
                    &format!("reserved:{reservation_id}"),
                ),
                now,
            )
            .await
    }

    #[tokio::test]
    async fn duplicate_mint_source_conflicts() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = store
            .create_account(EntityType::Person, "p-1".to_string(), now)
            .await
            .unwrap();
        let request = MintRequest {
            lot_id: LotId::generate(),
            account_id: account.account_id.clone(),
            amount_micro: 1_000_000,
            source_type: LotSourceType::Deposit,
            source_id: Some("stripe-evt-1".to_string()),
        };
        store
            .mint_lot(
                request.clone(),
                entry_draft(&account.account_id, EntryType::Deposit, 1_000_000, None, None),
                event_draft(EconomicEventType::LotMinted, "l", "lot-minted:1"),
                now,
            )
            .await
            .unwrap();

        let retried = MintRequest {
            lot_id: LotId::generate(),
            ..request
        };
        let result = store
            .mint_lot(
                retried,
                entry_draft(&account.account_id, EntryType::Deposit, 1_000_000, None, None),
                event_draft(EconomicEventType::LotMinted, "l", "lot-minted:2"),
                now,
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert_eq!(available(&store, &account.account_id).await, 1_000_000);
    }

    #[tokio::test]
    async fn reserve_spans_lots_in_fifo_order() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = account_with_lot(&store, 30, now).await;
        mint(&store, &account, 20, now).await;

        let reservation = reserve(&store, &account, 40, now).await.unwrap();
        let holds = store
            .holds_for_reservation(&reservation.reservation_id)
            .await
            .unwrap();
        assert_eq!(
            holds.iter().map(|h| h.reserved_micro).collect::<Vec<_>>(),
            vec![30, 10]
        );
        assert_eq!(available(&store, &account).await, 10);
    }

    #[tokio::test]
    async fn shortfall_reserve_leaves_no_partial_state() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = account_with_lot(&store, 30, now).await;
        mint(&store, &account, 20, now).await;

        let result = reserve(&store, &account, 60, now).await;
        assert!(matches!(
            result,
            Err(StorageError::InsufficientBalance {
                required_micro: 60,
                available_micro: 50,
            })
        ));
        assert_eq!(available(&store, &account).await, 50);
        for lot in store.lots_for_account(&account).await.unwrap() {
            assert_eq!(lot.reserved_micro, 0);
        }
        assert!(store.all_reservation_lots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_retry_returns_stored_entry() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = account_with_lot(&store, 100, now).await;
        let reservation = reserve(&store, &account, 50, now).await.unwrap();

        let first = store
            .finalize_reservation(
                &reservation.reservation_id,
                "fin-1",
                30,
                entry_draft(
                    &account,
                    EntryType::Finalize,
                    30,
                    None,
                    Some(&reservation.reservation_id),
                ),
                event_draft(EconomicEventType::ReservationFinalized, "r", "fin-evt:1"),
                now,
            )
            .await
            .unwrap();
        let retry = store
            .finalize_reservation(
                &reservation.reservation_id,
                "fin-1",
                30,
                entry_draft(
                    &account,
                    EntryType::Finalize,
                    30,
                    None,
                    Some(&reservation.reservation_id),
                ),
                event_draft(EconomicEventType::ReservationFinalized, "r", "fin-evt:1"),
                now,
            )
            .await
            .unwrap();
        assert_eq!(first.entry_id, retry.entry_id);

        // 30 consumed, the remaining 20 of the hold back to available.
        assert_eq!(available(&store, &account).await, 70);
        let lot = &store.lots_for_account(&account).await.unwrap()[0];
        assert_eq!(lot.consumed_micro, 30);
        assert_eq!(lot.reserved_micro, 0);
        assert!(lot.conserves());
    }

    #[tokio::test]
    async fn finalize_splits_consumption_across_held_lots() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = account_with_lot(&store, 60, now).await;
        mint(&store, &account, 40, now).await;
        let reservation = reserve(&store, &account, 100, now).await.unwrap();

        store
            .finalize_reservation(
                &reservation.reservation_id,
                "fin-split",
                33,
                entry_draft(
                    &account,
                    EntryType::Finalize,
                    33,
                    None,
                    Some(&reservation.reservation_id),
                ),
                event_draft(EconomicEventType::ReservationFinalized, "r", "fin-evt:s"),
                now,
            )
            .await
            .unwrap();

        let lots = store.lots_for_account(&account).await.unwrap();
        let consumed: i64 = lots.iter().map(|lot| lot.consumed_micro).sum();
        assert_eq!(consumed, 33);
        assert_eq!(available(&store, &account).await, 67);
        for lot in &lots {
            assert!(lot.conserves());
            assert_eq!(lot.reserved_micro, 0);
        }
    }

    #[tokio::test]
    async fn release_after_terminal_is_a_noop() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = account_with_lot(&store, 100, now).await;
        let reservation = reserve(&store, &account, 40, now).await.unwrap();

        let released = store
            .release_reservation(
                &reservation.reservation_id,
                ReservationStatus::Cancelled,
                entry_draft(
                    &account,
                    EntryType::Release,
                    40,
                    None,
                    Some(&reservation.reservation_id),
                ),
                event_draft(EconomicEventType::ReservationReleased, "r", "rel-evt:1"),
                now,
            )
            .await
            .unwrap();
        assert!(released.is_some());
        assert_eq!(available(&store, &account).await, 100);

        let again = store
            .release_reservation(
                &reservation.reservation_id,
                ReservationStatus::Cancelled,
                entry_draft(
                    &account,
                    EntryType::Release,
                    40,
                    None,
                    Some(&reservation.reservation_id),
                ),
                event_draft(EconomicEventType::ReservationReleased, "r", "rel-evt:2"),
                now,
            )
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(available(&store, &account).await, 100);
    }

    #[tokio::test]
    async fn transfer_moves_credit_and_retry_is_idempotent() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let alice = account_with_lot(&store, 50_000_000, now).await;
        let bob = account_with_lot(&store, 10_000_000, now).await;

        let request = TransferRequest {
            transfer_id: TransferId::generate(),
            from_account: alice.clone(),
            to_account: bob.clone(),
            amount_micro: 20_000_000,
            idempotency_key: "xfer-1".to_string(),
        };
        let first = store.execute_transfer(request.clone(), now).await.unwrap();
        assert_eq!(first.status, TransferStatus::Completed);
        assert_eq!(available(&store, &alice).await, 30_000_000);
        assert_eq!(available(&store, &bob).await, 30_000_000);

        let retry = store
            .execute_transfer(
                TransferRequest {
                    transfer_id: TransferId::generate(),
                    ..request
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(retry.transfer_id, first.transfer_id);
        assert_eq!(available(&store, &alice).await, 30_000_000);
        assert_eq!(available(&store, &bob).await, 30_000_000);

        // Destination got a fresh transfer_in lot with provenance.
        let incoming = store
            .lots_for_account(&bob)
            .await
            .unwrap()
            .into_iter()
            .find(|lot| lot.source_type == LotSourceType::TransferIn)
            .unwrap();
        assert_eq!(incoming.original_micro, 20_000_000);
    }

    #[tokio::test]
    async fn shortfall_transfer_records_rejected_row() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let alice = account_with_lot(&store, 10, now).await;
        let bob = account_with_lot(&store, 1, now).await;

        let rejected = store
            .execute_transfer(
                TransferRequest {
                    transfer_id: TransferId::generate(),
                    from_account: alice.clone(),
                    to_account: bob.clone(),
                    amount_micro: 25,
                    idempotency_key: "xfer-short".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(rejected.status, TransferStatus::Rejected);
        assert!(rejected.reason.as_deref().unwrap().contains("available 10"));
        assert_eq!(available(&store, &alice).await, 10);

        let stored = store
            .find_transfer_by_idempotency_key("xfer-short")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.transfer_id, rejected.transfer_id);
    }

    fn draft_rule(proposed_by: &str, now: DateTime<Utc>) -> RevenueRule {
        RevenueRule {
            rule_id: RuleId::generate(),
            split: RevenueSplit {
                commons_bps: 5_000,
                community_bps: 3_000,
                foundation_bps: 2_000,
            },
            proposed_by: proposed_by.to_string(),
            approved_by: None,
            status: RevenueRuleStatus::Draft,
            activates_at: None,
            activated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn rule_audit(rule_id: &RuleId, actor: &str) -> AuditDraft {
        AuditDraft {
            subject: AuditSubject::Rule(rule_id.clone()),
            action: "create".to_string(),
            actor: actor.to_string(),
            previous_status: None,
            new_status: Some("draft".to_string()),
            reason: None,
            urgent: false,
        }
    }

    #[tokio::test]
    async fn self_approval_violates_four_eyes() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let rule = draft_rule("carol", now);
        store
            .insert_rule(rule.clone(), rule_audit(&rule.rule_id, "carol"), now)
            .await
            .unwrap();
        store.submit_rule(&rule.rule_id, "carol", now).await.unwrap();

        let result = store.approve_rule(&rule.rule_id, "carol", now).await;
        assert!(matches!(result, Err(StorageError::FourEyes(_))));
    }

    #[tokio::test]
    async fn timer_activation_supersedes_incumbent() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();

        let first = draft_rule("carol", now);
        store
            .insert_rule(first.clone(), rule_audit(&first.rule_id, "carol"), now)
            .await
            .unwrap();
        store.submit_rule(&first.rule_id, "carol", now).await.unwrap();
        store.approve_rule(&first.rule_id, "dave", now).await.unwrap();

        let after_cooldown = now + Duration::seconds(172_801);
        let activated = store.activate_ready_rules(after_cooldown).await.unwrap();
        assert_eq!(activated.len(), 1);

        let second = draft_rule("dave", after_cooldown);
        store
            .insert_rule(
                second.clone(),
                rule_audit(&second.rule_id, "dave"),
                after_cooldown,
            )
            .await
            .unwrap();
        store
            .submit_rule(&second.rule_id, "dave", after_cooldown)
            .await
            .unwrap();
        store
            .approve_rule(&second.rule_id, "carol", after_cooldown)
            .await
            .unwrap();
        let later = after_cooldown + Duration::seconds(172_801);
        store.activate_ready_rules(later).await.unwrap();

        let rules = store.list_rules().await.unwrap();
        let active = rules
            .iter()
            .filter(|r| r.status == RevenueRuleStatus::Active)
            .count();
        assert_eq!(active, 1);
        assert_eq!(
            store.get_rule(&first.rule_id).await.unwrap().unwrap().status,
            RevenueRuleStatus::Superseded
        );
        assert_eq!(store.list_notifications().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn emergency_activation_flags_audit_urgent() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let rule = draft_rule("carol", now);
        store
            .insert_rule(rule.clone(), rule_audit(&rule.rule_id, "carol"), now)
            .await
            .unwrap();
        store.submit_rule(&rule.rule_id, "carol", now).await.unwrap();
        store.approve_rule(&rule.rule_id, "dave", now).await.unwrap();

        store
            .activate_rule_now(&rule.rule_id, "dave", "split misconfigured in prod", now)
            .await
            .unwrap();
        let audit = store.list_rule_audit().await.unwrap();
        let urgent = audit.iter().find(|record| record.urgent).unwrap();
        assert_eq!(urgent.action, "emergency_activate");
        assert_eq!(
            urgent.reason.as_deref(),
            Some("split misconfigured in prod")
        );
    }

    #[tokio::test]
    async fn audit_log_is_hash_chained() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let rule = draft_rule("carol", now);
        store
            .insert_rule(rule.clone(), rule_audit(&rule.rule_id, "carol"), now)
            .await
            .unwrap();
        store.submit_rule(&rule.rule_id, "carol", now).await.unwrap();

        let audit = store.list_rule_audit().await.unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit[0].previous_hash.is_none());
        assert_eq!(audit[1].previous_hash.as_deref(), Some(audit[0].hash.as_str()));
        assert_eq!(audit[1].sequence, 2);
    }

    fn open_proposal(proposer: &str, weight: u64, now: DateTime<Utc>) -> AgentProposal {
        AgentProposal {
            proposal_id: ProposalId::generate(),
            param_key: "economics.transfer_fee_bps".to_string(),
            proposed_value: serde_json::json!(25),
            proposer: AgentId::new(proposer),
            proposer_weight: weight,
            total_weight: 0,
            quorum_weight: 0,
            status: ProposalStatus::Open,
            deadline: now + Duration::days(7),
            cooldown_ends_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_vote_is_rejected() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let proposal = store
            .insert_proposal(open_proposal("agent-a", 40, now), now)
            .await
            .unwrap();
        assert_eq!(proposal.status, ProposalStatus::Open);

        // The proposer's vote was auto-cast at creation.
        let result = store
            .cast_vote(&proposal.proposal_id, AgentId::new("agent-a"), 40, now)
            .await;
        assert!(matches!(result, Err(StorageError::AlreadyVoted { .. })));
    }

    #[tokio::test]
    async fn quorum_starts_cooldown_and_activation_writes_param() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let proposal = store
            .insert_proposal(open_proposal("agent-a", 40, now), now)
            .await
            .unwrap();

        let after_vote = store
            .cast_vote(&proposal.proposal_id, AgentId::new("agent-b"), 60, now)
            .await
            .unwrap();
        assert_eq!(after_vote.status, ProposalStatus::CoolingDown);
        assert_eq!(after_vote.total_weight, 100);

        let activated = store.activate_ready_proposals(now).await.unwrap();
        assert_eq!(activated.len(), 1);
        let param = store
            .get_param("economics.transfer_fee_bps")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(param.value, serde_json::json!(25));
        assert_eq!(param.version, 1);
        assert_eq!(param.updated_by, "agent-governance");
    }

    #[tokio::test]
    async fn non_proposable_key_is_refused() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let mut proposal = open_proposal("agent-a", 40, now);
        proposal.param_key = "governance.quorum_weight".to_string();
        let result = store.insert_proposal(proposal, now).await;
        assert!(matches!(result, Err(StorageError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn stale_outbox_claim_is_reclaimable() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        account_with_lot(&store, 100, now).await;

        let claimed = store
            .claim_next_event("worker-1", now, Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        // Still within the staleness window: nothing to claim.
        assert!(store
            .claim_next_event("worker-2", now + Duration::seconds(30), Duration::seconds(60))
            .await
            .unwrap()
            .is_none());

        // Past the window the claim has gone stale and moves to worker-2.
        let reclaimed = store
            .claim_next_event("worker-2", now + Duration::seconds(61), Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.event_id, claimed.event_id);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("worker-2"));

        store
            .mark_published(&claimed.event_id, now + Duration::seconds(62))
            .await
            .unwrap();
        assert!(store.list_unpublished().await.unwrap().is_empty());
    }

    async fn release_cancelled(
        store: &InMemoryCommonsStore,
        account_id: &AccountId,
        reservation_id: &ReservationId,
        amount_micro: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<LedgerEntry>> {
        store
            .release_reservation(
                reservation_id,
                ReservationStatus::Cancelled,
                entry_draft(
                    account_id,
                    EntryType::Release,
                    amount_micro,
                    Some("release-key-1"),
                    Some(reservation_id),
                ),
                event_draft(
                    EconomicEventType::ReservationReleased,
                    &reservation_id.0,
                    &format!("released:{reservation_id}"),
                ),
                now,
            )
            .await
    }

    #[tokio::test]
    async fn duplicate_reserve_entry_key_leaves_no_partial_state() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = account_with_lot(&store, 100, now).await;

        let reserve_with_key = |reservation_id: ReservationId| {
            store.reserve(
                ReserveRequest {
                    reservation_id: reservation_id.clone(),
                    account_id: account.clone(),
                    amount_micro: 20,
                    expires_at: now + Duration::minutes(5),
                },
                entry_draft(
                    &account,
                    EntryType::Reserve,
                    20,
                    Some("hold-key-1"),
                    Some(&reservation_id),
                ),
                event_draft(
                    EconomicEventType::CreditsReserved,
                    &reservation_id.0,
                    &format!("reserved:{reservation_id}"),
                ),
                now,
            )
        };
        reserve_with_key(ReservationId::generate()).await.unwrap();
        let result = reserve_with_key(ReservationId::generate()).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        // Only the first reserve left a trace.
        let lot = &store.lots_for_account(&account).await.unwrap()[0];
        assert_eq!(lot.reserved_micro, 20);
        assert!(lot.conserves());
        assert_eq!(store.all_reservation_lots().await.unwrap().len(), 1);
        assert_eq!(available(&store, &account).await, 80);
    }

    #[tokio::test]
    async fn duplicate_release_entry_key_leaves_reservation_pending() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let account = account_with_lot(&store, 100, now).await;
        mint(&store, &account, 1, now).await;
        let first = reserve(&store, &account, 40, now).await.unwrap();
        let second = reserve(&store, &account, 30, now).await.unwrap();

        release_cancelled(&store, &account, &first.reservation_id, 40, now)
            .await
            .unwrap();
        let result = release_cancelled(&store, &account, &second.reservation_id, 30, now).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        // The failed release must not have touched lots or the reservation.
        let stored = store
            .get_reservation(&second.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ReservationStatus::Pending);
        assert_eq!(available(&store, &account).await, 71);
        for lot in store.lots_for_account(&account).await.unwrap() {
            assert!(lot.conserves());
        }
    }

    #[tokio::test]
    async fn quorum_threshold_is_reread_at_every_tally() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        store
            .set_param("governance.quorum_weight", serde_json::json!(40), "ops", now)
            .await
            .unwrap();
        let proposal = store
            .insert_proposal(open_proposal("agent-a", 10, now), now)
            .await
            .unwrap();
        assert_eq!(proposal.status, ProposalStatus::Open);
        assert_eq!(proposal.quorum_weight, 40);

        // Lowering the parameter takes effect on the next vote, not at the
        // threshold captured when the proposal was created.
        store
            .set_param("governance.quorum_weight", serde_json::json!(20), "ops", now)
            .await
            .unwrap();
        let after_vote = store
            .cast_vote(&proposal.proposal_id, AgentId::new("agent-b"), 15, now)
            .await
            .unwrap();
        assert_eq!(after_vote.total_weight, 25);
        assert_eq!(after_vote.quorum_weight, 20);
        assert_eq!(after_vote.status, ProposalStatus::CoolingDown);
    }

    #[tokio::test]
    async fn param_versions_increment() {
        let store = InMemoryCommonsStore::new();
        let now = Utc::now();
        let v1 = store
            .set_param("economics.transfer_fee_bps", serde_json::json!(10), "ops", now)
            .await
            .unwrap();
        let v2 = store
            .set_param("economics.transfer_fee_bps", serde_json::json!(15), "ops", now)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
    }
}
