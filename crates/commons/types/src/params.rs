//! Runtime parameter keys and fallback defaults.
//!
//! Parameters live in the versioned key-value store and are resolved inside
//! the same storage operation as the mutation that depends on them, never
//! cached across operations.

/// Cooldown between revenue-rule approval and activation, in seconds.
pub const REVENUE_COOLDOWN_SECS: &str = "revenue.cooldown_secs";
pub const DEFAULT_REVENUE_COOLDOWN_SECS: i64 = 172_800; // 48h

/// Cooldown between proposal quorum and activation, in seconds. May be zero.
pub const AGENT_COOLDOWN_SECS: &str = "governance.agent_cooldown_secs";
pub const DEFAULT_AGENT_COOLDOWN_SECS: i64 = 0;

/// Aggregate voting weight required for a proposal to reach quorum.
pub const QUORUM_WEIGHT: &str = "governance.quorum_weight";
pub const DEFAULT_QUORUM_WEIGHT: u64 = 100;

/// Which voting-weight strategy is in effect: `fixed`, `delegation`, or
/// `reputation`.
pub const WEIGHT_STRATEGY: &str = "governance.weight_strategy";
pub const DEFAULT_WEIGHT_STRATEGY: &str = "fixed";

/// How long an agent proposal stays open before it expires, in seconds.
pub const PROPOSAL_TTL_SECS: &str = "governance.proposal_ttl_secs";
pub const DEFAULT_PROPOSAL_TTL_SECS: i64 = 604_800; // 7 days

/// Parameter keys agents are allowed to propose changes to.
///
/// This whitelist is the primary safety boundary for agent governance:
/// proposals come from semi-trusted agent principals, so security-sensitive
/// keys (quorum weight, weight strategy, revenue cooldown) stay off the list.
pub const PROPOSABLE_PARAM_KEYS: &[&str] = &[
    "economics.reserve_ttl_secs",
    "economics.daily_grant_micro",
    "economics.transfer_fee_bps",
    AGENT_COOLDOWN_SECS,
    PROPOSAL_TTL_SECS,
];

/// Whether agents may propose changes to `key`.
pub fn is_proposable(key: &str) -> bool {
    PROPOSABLE_PARAM_KEYS.contains(&key)
}
