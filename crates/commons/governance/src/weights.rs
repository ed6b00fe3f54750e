//! Pluggable voting-weight strategies for agent governance.
//!
//! Which strategy is in effect comes from the `governance.weight_strategy`
//! parameter, resolved per operation. Weights from different strategies are
//! not mutually comparable; a deployment picks one and its quorum threshold
//! is calibrated against it.

use std::collections::HashMap;

use commons_types::AgentId;

/// Computes one agent's voting weight.
pub trait WeightStrategy: Send + Sync {
    /// Strategy name as stored in `governance.weight_strategy`.
    fn name(&self) -> &'static str;

    fn weight_of(&self, agent_id: &AgentId) -> u64;
}

/// Every agent carries the same weight.
pub struct FixedWeight {
    weight: u64,
}

impl FixedWeight {
    pub fn new(weight: u64) -> Self {
        Self { weight }
    }
}

impl Default for FixedWeight {
    fn default() -> Self {
        Self { weight: 10 }
    }
}

impl WeightStrategy for FixedWeight {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn weight_of(&self, _agent_id: &AgentId) -> u64 {
        self.weight
    }
}

/// Base weight plus the weight delegated to the agent by others.
pub struct DelegationWeight {
    base: u64,
    delegated: HashMap<AgentId, u64>,
}

impl DelegationWeight {
    pub fn new(base: u64, delegated: HashMap<AgentId, u64>) -> Self {
        Self { base, delegated }
    }
}

impl WeightStrategy for DelegationWeight {
    fn name(&self) -> &'static str {
        "delegation"
    }

    fn weight_of(&self, agent_id: &AgentId) -> u64 {
        self.base
            .saturating_add(self.delegated.get(agent_id).copied().unwrap_or(0))
    }
}

/// Weight scaled by an externally maintained reputation score. Agents with
/// no recorded score vote at the floor weight.
pub struct ReputationWeight {
    floor: u64,
    scores: HashMap<AgentId, u64>,
}

impl ReputationWeight {
    pub fn new(floor: u64, scores: HashMap<AgentId, u64>) -> Self {
        Self { floor, scores }
    }
}

impl WeightStrategy for ReputationWeight {
    fn name(&self) -> &'static str {
        "reputation"
    }

    fn weight_of(&self, agent_id: &AgentId) -> u64 {
        self.scores
            .get(agent_id)
            .copied()
            .unwrap_or(self.floor)
            .max(self.floor)
    }
}
