use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentId, ProposalId, RuleId};
use crate::BPS_WHOLE;

/// Revenue split in basis points. Must sum to [`BPS_WHOLE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueSplit {
    pub commons_bps: u32,
    pub community_bps: u32,
    pub foundation_bps: u32,
}

impl RevenueSplit {
    /// Sum widened to `u64` so oversized inputs report their real total
    /// instead of wrapping.
    pub fn total_bps(&self) -> u64 {
        u64::from(self.commons_bps) + u64::from(self.community_bps) + u64::from(self.foundation_bps)
    }

    pub fn is_balanced(&self) -> bool {
        self.total_bps() == u64::from(BPS_WHOLE)
    }
}

/// Revenue rule lifecycle. `Rejected` and `Superseded` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevenueRuleStatus {
    Draft,
    PendingApproval,
    CoolingDown,
    Active,
    Superseded,
    Rejected,
}

impl RevenueRuleStatus {
    /// Exhaustive transition table for the rule state machine.
    ///
    /// `cooling_down -> active` covers both the timer path and the emergency
    /// override; `active -> superseded` happens only when another rule
    /// activates.
    pub fn can_transition(self, to: RevenueRuleStatus) -> bool {
        use RevenueRuleStatus::*;
        matches!(
            (self, to),
            (Draft, PendingApproval)
                | (PendingApproval, CoolingDown)
                | (PendingApproval, Rejected)
                | (CoolingDown, Active)
                | (CoolingDown, Rejected)
                | (Active, Superseded)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RevenueRuleStatus::Rejected | RevenueRuleStatus::Superseded)
    }
}

/// A platform revenue-split rule moving through governance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevenueRule {
    pub rule_id: RuleId,
    pub split: RevenueSplit,
    pub proposed_by: String,
    /// Must differ from `proposed_by` (four-eyes).
    pub approved_by: Option<String>,
    pub status: RevenueRuleStatus,
    /// Stamped at approval: `now + cooldown`.
    pub activates_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Agent proposal lifecycle. `Activated` and `Expired` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Open,
    QuorumReached,
    CoolingDown,
    Activated,
    Expired,
}

impl ProposalStatus {
    /// Exhaustive transition table for the proposal state machine.
    /// `Expired` is reachable from any non-terminal state.
    pub fn can_transition(self, to: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, to),
            (Open, QuorumReached)
                | (QuorumReached, CoolingDown)
                | (CoolingDown, Activated)
                | (Open, Expired)
                | (QuorumReached, Expired)
                | (CoolingDown, Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProposalStatus::Activated | ProposalStatus::Expired)
    }
}

/// An agent-proposed runtime parameter change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentProposal {
    pub proposal_id: ProposalId,
    pub param_key: String,
    pub proposed_value: Value,
    pub proposer: AgentId,
    pub proposer_weight: u64,
    /// Aggregate weight of all votes cast so far.
    pub total_weight: u64,
    /// Quorum threshold in effect at the most recent tally.
    pub quorum_weight: u64,
    pub status: ProposalStatus,
    pub deadline: DateTime<Utc>,
    pub cooldown_ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One agent's vote on one proposal. At most one per `(proposal, agent)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalVote {
    pub proposal_id: ProposalId,
    pub agent_id: AgentId,
    pub weight: u64,
    pub cast_at: DateTime<Utc>,
}

/// Which governance object an audit row concerns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSubject {
    Rule(RuleId),
    Proposal(ProposalId),
}

/// Immutable, hash-chained governance audit row.
///
/// Sequence, previous hash, and hash are assigned by storage; the chain makes
/// after-the-fact edits detectable even if the write-once API is bypassed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernanceAuditRecord {
    pub audit_id: String,
    pub subject: AuditSubject,
    pub action: String,
    pub actor: String,
    pub previous_status: Option<String>,
    pub new_status: Option<String>,
    pub reason: Option<String>,
    pub urgent: bool,
    pub sequence: u64,
    pub previous_hash: Option<String>,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Notification emitted when a revenue rule activates, for downstream
/// consumers that need the old and new splits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleNotification {
    pub notification_id: String,
    pub rule_id: RuleId,
    pub old_split: Option<RevenueSplit>,
    pub new_split: RevenueSplit,
    pub urgent: bool,
    pub created_at: DateTime<Utc>,
}

/// A versioned runtime parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamRecord {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_split_sums_to_whole() {
        let split = RevenueSplit {
            commons_bps: 5_000,
            community_bps: 3_000,
            foundation_bps: 2_000,
        };
        assert!(split.is_balanced());
    }

    #[test]
    fn unbalanced_split_detected() {
        let split = RevenueSplit {
            commons_bps: 5_000,
            community_bps: 3_000,
            foundation_bps: 1_999,
        };
        assert!(!split.is_balanced());
    }

    #[test]
    fn oversized_split_does_not_wrap_around() {
        let split = RevenueSplit {
            commons_bps: u32::MAX,
            community_bps: 1,
            foundation_bps: 10_000,
        };
        assert!(!split.is_balanced());
        assert_eq!(
            split.total_bps(),
            u64::from(u32::MAX) + 1 + 10_000
        );
    }

    #[test]
    fn rule_transition_table_is_closed() {
        use RevenueRuleStatus::*;
        assert!(Draft.can_transition(PendingApproval));
        assert!(PendingApproval.can_transition(CoolingDown));
        assert!(PendingApproval.can_transition(Rejected));
        assert!(CoolingDown.can_transition(Active));
        assert!(CoolingDown.can_transition(Rejected));
        assert!(Active.can_transition(Superseded));

        assert!(!Draft.can_transition(Active));
        assert!(!Active.can_transition(CoolingDown));
        assert!(!Rejected.can_transition(PendingApproval));
        assert!(!Superseded.can_transition(Active));
    }

    #[test]
    fn proposal_expiry_reachable_from_non_terminal_only() {
        use ProposalStatus::*;
        assert!(Open.can_transition(Expired));
        assert!(QuorumReached.can_transition(Expired));
        assert!(CoolingDown.can_transition(Expired));
        assert!(!Activated.can_transition(Expired));
        assert!(!Expired.can_transition(Open));
    }
}
