use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use commons_types::{
    AccountId, AgentId, AgentProposal, CreditAccount, CreditLot, EconomicEvent, EntityType,
    EventId, GovernanceAuditRecord, LedgerEntry, LotId, ParamRecord, ProposalId, ProposalVote,
    ReconciliationRun, Reservation, ReservationId, ReservationLot, ReservationStatus, RevenueRule,
    RuleId, RuleNotification, Transfer,
};
use serde_json::Value;

use crate::model::{AuditDraft, EntryDraft, EventDraft, MintRequest, ReserveRequest, TransferRequest};
use crate::StorageResult;

/// Storage interface for credit accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Create an account. `(entity_type, entity_id)` must be unique.
    async fn create_account(
        &self,
        entity_type: EntityType,
        entity_id: String,
        now: DateTime<Utc>,
    ) -> StorageResult<CreditAccount>;

    async fn get_account(&self, account_id: &AccountId) -> StorageResult<Option<CreditAccount>>;

    async fn find_account(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> StorageResult<Option<CreditAccount>>;

    async fn list_accounts(&self) -> StorageResult<Vec<CreditAccount>>;
}

/// Storage interface for credit lots.
#[async_trait]
pub trait LotStore: Send + Sync {
    /// Mint a lot with `available == original`, appending the entry and the
    /// outbox event in the same operation. A duplicate `(source_type,
    /// source_id)` is a conflict; this is the dedup guard against
    /// double-minting from the same external occurrence.
    async fn mint_lot(
        &self,
        request: MintRequest,
        entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<CreditLot>;

    async fn get_lot(&self, lot_id: &LotId) -> StorageResult<Option<CreditLot>>;

    /// Lots for one account in creation (FIFO) order.
    async fn lots_for_account(&self, account_id: &AccountId) -> StorageResult<Vec<CreditLot>>;

    async fn all_lots(&self) -> StorageResult<Vec<CreditLot>>;
}

/// Storage interface for reservations against lots.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Reserve `amount_micro` across the account's lots in FIFO order,
    /// all-or-nothing. Appends the `reserve` entry and outbox event in the
    /// same operation.
    async fn reserve(
        &self,
        request: ReserveRequest,
        entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<Reservation>;

    /// Finalize a pending reservation, idempotent on `finalization_id`: a
    /// retry returns the previously appended entry without mutating.
    async fn finalize_reservation(
        &self,
        reservation_id: &ReservationId,
        finalization_id: &str,
        actual_cost_micro: i64,
        entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<LedgerEntry>;

    /// Return the full reserved amount to `available` and move the
    /// reservation to `terminal` (`cancelled` or `expired`). Returns `None`
    /// without mutating when the reservation is already terminal.
    async fn release_reservation(
        &self,
        reservation_id: &ReservationId,
        terminal: ReservationStatus,
        entry: EntryDraft,
        event: EventDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<LedgerEntry>>;

    async fn get_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> StorageResult<Option<Reservation>>;

    async fn holds_for_reservation(
        &self,
        reservation_id: &ReservationId,
    ) -> StorageResult<Vec<ReservationLot>>;

    /// Pending reservations whose TTL has lapsed at `now`.
    async fn list_due_pending(&self, now: DateTime<Utc>) -> StorageResult<Vec<Reservation>>;

    async fn all_reservation_lots(&self) -> StorageResult<Vec<ReservationLot>>;
}

/// Storage interface for the append-only ledger entry log.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Entries for one account in sequence order.
    async fn entries_for_account(&self, account_id: &AccountId)
        -> StorageResult<Vec<LedgerEntry>>;

    async fn all_entries(&self) -> StorageResult<Vec<LedgerEntry>>;

    async fn find_entry_by_idempotency_key(
        &self,
        key: &str,
    ) -> StorageResult<Option<LedgerEntry>>;
}

/// Storage interface for peer transfers.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Execute a transfer atomically: debit source lots FIFO to `consumed`,
    /// append `transfer_out`/`transfer_in` entries, mint a fresh
    /// `transfer_in` lot on the destination, record the transfer row, and
    /// emit the outbox event. On insufficient funds, record a
    /// `rejected` row with a reason and move nothing. A retry with a known
    /// `idempotency_key` returns the stored row without re-executing.
    async fn execute_transfer(
        &self,
        request: TransferRequest,
        now: DateTime<Utc>,
    ) -> StorageResult<Transfer>;

    async fn find_transfer_by_idempotency_key(
        &self,
        key: &str,
    ) -> StorageResult<Option<Transfer>>;

    async fn all_transfers(&self) -> StorageResult<Vec<Transfer>>;
}

/// Storage interface for revenue-rule governance.
#[async_trait]
pub trait RevenueRuleStore: Send + Sync {
    /// Persist a draft rule and its audit row.
    async fn insert_rule(
        &self,
        rule: RevenueRule,
        audit: AuditDraft,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule>;

    /// `draft -> pending_approval`.
    async fn submit_rule(
        &self,
        rule_id: &RuleId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule>;

    /// `pending_approval -> cooling_down`. Enforces four-eyes and stamps
    /// `activates_at = now + revenue.cooldown_secs` (resolved from the
    /// parameter store inside the same operation).
    async fn approve_rule(
        &self,
        rule_id: &RuleId,
        approved_by: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule>;

    /// `pending_approval | cooling_down -> rejected`.
    async fn reject_rule(
        &self,
        rule_id: &RuleId,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule>;

    /// Emergency override: `cooling_down -> active` immediately, superseding
    /// the incumbent in the same mutation. Audit row is flagged urgent.
    async fn activate_rule_now(
        &self,
        rule_id: &RuleId,
        actor: &str,
        justification: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<RevenueRule>;

    /// Activate every `cooling_down` rule whose `activates_at` has passed,
    /// one at a time, each atomically superseding the incumbent. Idempotent
    /// and safe to run concurrently from multiple processes.
    async fn activate_ready_rules(&self, now: DateTime<Utc>) -> StorageResult<Vec<RevenueRule>>;

    async fn get_rule(&self, rule_id: &RuleId) -> StorageResult<Option<RevenueRule>>;

    /// The at-most-one currently active rule.
    async fn active_rule(&self) -> StorageResult<Option<RevenueRule>>;

    async fn list_rules(&self) -> StorageResult<Vec<RevenueRule>>;

    async fn list_rule_audit(&self) -> StorageResult<Vec<GovernanceAuditRecord>>;

    async fn list_notifications(&self) -> StorageResult<Vec<RuleNotification>>;
}

/// Storage interface for agent governance proposals.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    /// Persist a proposal, auto-cast the proposer's vote, resolve the quorum
    /// threshold from the parameter store, and advance to quorum if the
    /// proposer's weight alone reaches it.
    async fn insert_proposal(
        &self,
        proposal: AgentProposal,
        now: DateTime<Utc>,
    ) -> StorageResult<AgentProposal>;

    /// Cast one vote. A second vote from the same agent on the same proposal
    /// is `AlreadyVoted`. Reaching quorum starts the cooldown
    /// (`governance.agent_cooldown_secs`, resolved in the same operation).
    async fn cast_vote(
        &self,
        proposal_id: &ProposalId,
        agent_id: AgentId,
        weight: u64,
        now: DateTime<Utc>,
    ) -> StorageResult<AgentProposal>;

    /// Promote every `cooling_down` proposal whose cooldown has elapsed to
    /// `activated`, writing the proposed value into the parameter store in
    /// the same mutation.
    async fn activate_ready_proposals(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<AgentProposal>>;

    /// Move every non-terminal proposal past its deadline to `expired`.
    async fn expire_stale_proposals(&self, now: DateTime<Utc>)
        -> StorageResult<Vec<AgentProposal>>;

    async fn get_proposal(&self, proposal_id: &ProposalId)
        -> StorageResult<Option<AgentProposal>>;

    async fn list_proposals(&self) -> StorageResult<Vec<AgentProposal>>;

    async fn votes_for(&self, proposal_id: &ProposalId) -> StorageResult<Vec<ProposalVote>>;
}

/// Storage interface for the versioned runtime parameter store.
#[async_trait]
pub trait ParamStore: Send + Sync {
    async fn get_param(&self, key: &str) -> StorageResult<Option<ParamRecord>>;

    /// Set a parameter, incrementing its version.
    async fn set_param(
        &self,
        key: &str,
        value: Value,
        actor: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ParamRecord>;

    async fn list_params(&self) -> StorageResult<Vec<ParamRecord>>;
}

/// Storage interface for the economic event outbox claim protocol.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim the oldest unpublished event that is unclaimed or whose claim
    /// went stale (`claimed_at` older than `stale_after` with no
    /// `published_at`). Atomic: two workers never hold the same live claim.
    async fn claim_next_event(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StorageResult<Option<EconomicEvent>>;

    /// Acknowledge delivery by stamping `published_at`.
    async fn mark_published(
        &self,
        event_id: &EventId,
        now: DateTime<Utc>,
    ) -> StorageResult<EconomicEvent>;

    async fn list_unpublished(&self) -> StorageResult<Vec<EconomicEvent>>;

    async fn all_events(&self) -> StorageResult<Vec<EconomicEvent>>;
}

/// Storage interface for reconciliation run history.
#[async_trait]
pub trait ReconStore: Send + Sync {
    async fn record_run(&self, run: ReconciliationRun) -> StorageResult<()>;

    async fn list_runs(&self) -> StorageResult<Vec<ReconciliationRun>>;
}

/// Unified storage bundle used by the commons credit services.
pub trait CommonsStore:
    AccountStore
    + LotStore
    + ReservationStore
    + EntryStore
    + TransferStore
    + RevenueRuleStore
    + ProposalStore
    + ParamStore
    + OutboxStore
    + ReconStore
    + Send
    + Sync
{
}

impl<T> CommonsStore for T where
    T: AccountStore
        + LotStore
        + ReservationStore
        + EntryStore
        + TransferStore
        + RevenueRuleStore
        + ProposalStore
        + ParamStore
        + OutboxStore
        + ReconStore
        + Send
        + Sync
{
}
