//! Agent governance: weighted quorum voting on whitelisted runtime
//! parameters, proposed by semi-trusted agent principals.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{info, warn};

use commons_store::CommonsStore;
use commons_types::params as param_keys;
use commons_types::{AgentId, AgentProposal, ProposalId, ProposalStatus, ProposalVote};

use crate::weights::{FixedWeight, WeightStrategy};
use crate::GovernanceError;

/// The agent governance service.
///
/// Voting weight comes from whichever registered [`WeightStrategy`] the
/// `governance.weight_strategy` parameter names, resolved per operation.
/// Everything else (quorum, cooldown, vote uniqueness, the parameter write
/// on activation) is enforced by storage.
pub struct AgentGovernanceService {
    store: Arc<dyn CommonsStore>,
    strategies: HashMap<&'static str, Arc<dyn WeightStrategy>>,
}

impl AgentGovernanceService {
    /// Create the service with only the fixed-weight strategy registered.
    pub fn with_store(store: Arc<dyn CommonsStore>) -> Self {
        let mut service = Self {
            store,
            strategies: HashMap::new(),
        };
        service.register_strategy(Arc::new(FixedWeight::default()));
        service
    }

    /// Register (or replace) a weight strategy under its own name.
    pub fn register_strategy(&mut self, strategy: Arc<dyn WeightStrategy>) {
        self.strategies.insert(strategy.name(), strategy);
    }

    async fn resolve_strategy(&self) -> Result<Arc<dyn WeightStrategy>, GovernanceError> {
        let name = self
            .store
            .get_param(param_keys::WEIGHT_STRATEGY)
            .await?
            .and_then(|record| record.value.as_str().map(str::to_string))
            .unwrap_or_else(|| param_keys::DEFAULT_WEIGHT_STRATEGY.to_string());
        self.strategies
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| {
                GovernanceError::InvalidState(format!(
                    "weight strategy {name} is configured but not registered"
                ))
            })
    }

    /// Propose a parameter change as an agent. The key must be on the
    /// proposable whitelist; the proposer's vote is auto-cast at their
    /// strategy weight and quorum may be reached immediately.
    pub async fn propose(
        &self,
        agent_id: AgentId,
        param_key: &str,
        proposed_value: Value,
    ) -> Result<AgentProposal, GovernanceError> {
        if !param_keys::is_proposable(param_key) {
            warn!(agent_id = %agent_id, param_key, "non-proposable parameter refused");
            return Err(GovernanceError::NotProposableByAgents(
                param_key.to_string(),
            ));
        }
        let strategy = self.resolve_strategy().await?;
        let weight = strategy.weight_of(&agent_id);
        let now = Utc::now();
        let ttl_secs = self
            .store
            .get_param(param_keys::PROPOSAL_TTL_SECS)
            .await?
            .and_then(|record| record.value.as_i64())
            .unwrap_or(param_keys::DEFAULT_PROPOSAL_TTL_SECS);

        let proposal = self
            .store
            .insert_proposal(
                AgentProposal {
                    proposal_id: ProposalId::generate(),
                    param_key: param_key.to_string(),
                    proposed_value,
                    proposer: agent_id.clone(),
                    proposer_weight: weight,
                    total_weight: 0,
                    quorum_weight: 0,
                    status: ProposalStatus::Open,
                    deadline: now + Duration::seconds(ttl_secs),
                    cooldown_ends_at: None,
                    created_at: now,
                    updated_at: now,
                },
                now,
            )
            .await?;
        info!(
            proposal_id = %proposal.proposal_id,
            agent_id = %agent_id,
            param_key,
            weight,
            strategy = strategy.name(),
            "agent proposal created"
        );
        Ok(proposal)
    }

    /// Cast a vote at the agent's strategy weight. One vote per agent per
    /// proposal; reaching quorum starts the cooldown in the same mutation.
    pub async fn vote(
        &self,
        proposal_id: &ProposalId,
        agent_id: AgentId,
    ) -> Result<AgentProposal, GovernanceError> {
        let strategy = self.resolve_strategy().await?;
        let weight = strategy.weight_of(&agent_id);
        let proposal = self
            .store
            .cast_vote(proposal_id, agent_id.clone(), weight, Utc::now())
            .await?;
        info!(
            proposal_id = %proposal_id,
            agent_id = %agent_id,
            weight,
            total_weight = proposal.total_weight,
            quorum_weight = proposal.quorum_weight,
            status = ?proposal.status,
            "vote cast"
        );
        Ok(proposal)
    }

    /// Sweep: activate every proposal whose cooldown has elapsed at `now`,
    /// writing the proposed value into the parameter store.
    pub async fn activate_expired_cooldowns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AgentProposal>, GovernanceError> {
        let activated = self.store.activate_ready_proposals(now).await?;
        for proposal in &activated {
            info!(
                proposal_id = %proposal.proposal_id,
                param_key = %proposal.param_key,
                "agent proposal activated"
            );
        }
        Ok(activated)
    }

    /// Sweep: expire every non-terminal proposal past its deadline at `now`.
    pub async fn expire_stale_proposals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AgentProposal>, GovernanceError> {
        let expired = self.store.expire_stale_proposals(now).await?;
        for proposal in &expired {
            info!(proposal_id = %proposal.proposal_id, "agent proposal expired");
        }
        Ok(expired)
    }

    pub async fn get_proposal(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Option<AgentProposal>, GovernanceError> {
        Ok(self.store.get_proposal(proposal_id).await?)
    }

    pub async fn list_proposals(&self) -> Result<Vec<AgentProposal>, GovernanceError> {
        Ok(self.store.list_proposals().await?)
    }

    pub async fn votes(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<Vec<ProposalVote>, GovernanceError> {
        Ok(self.store.votes_for(proposal_id).await?)
    }
}
