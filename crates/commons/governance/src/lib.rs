//! Governance for the commons credit engine.
//!
//! Two independent state machines over the same storage: revenue-split rules
//! (human-proposed, four-eyes approval, cooldown, at most one active) and
//! agent parameter proposals (whitelisted keys, weighted quorum voting).
//! Neither touches ledger balances; activation only changes parameters that
//! other components read.

#![deny(unsafe_code)]

mod agents;
mod error;
pub mod params;
mod revenue;
pub mod weights;

pub use agents::AgentGovernanceService;
pub use error::GovernanceError;
pub use params::ParamsService;
pub use revenue::RevenueRuleService;
pub use weights::{DelegationWeight, FixedWeight, ReputationWeight, WeightStrategy};

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use commons_store::InMemoryCommonsStore;
    use commons_types::params as param_keys;
    use commons_types::{AgentId, ProposalStatus, RevenueRuleStatus, RevenueSplit};

    use super::*;

    fn split(commons: u32, community: u32, foundation: u32) -> RevenueSplit {
        RevenueSplit {
            commons_bps: commons,
            community_bps: community,
            foundation_bps: foundation,
        }
    }

    fn services() -> (Arc<InMemoryCommonsStore>, RevenueRuleService, ParamsService) {
        let store = Arc::new(InMemoryCommonsStore::new());
        let rules = RevenueRuleService::with_store(store.clone());
        let params = ParamsService::with_store(store.clone());
        (store, rules, params)
    }

    #[tokio::test]
    async fn unbalanced_split_is_refused_at_proposal_time() {
        let (_store, rules, _params) = services();
        let result = rules.propose_rule(split(5_000, 3_000, 1_000), "carol").await;
        assert!(matches!(
            result,
            Err(GovernanceError::UnbalancedSplit { total_bps: 9_000 })
        ));
        assert!(rules.list_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_approval_fails_four_eyes() {
        let (_store, rules, _params) = services();
        let rule = rules
            .propose_rule(split(5_000, 3_000, 2_000), "carol")
            .await
            .unwrap();
        rules.submit(&rule.rule_id, "carol").await.unwrap();

        let result = rules.approve(&rule.rule_id, "carol").await;
        assert!(matches!(result, Err(GovernanceError::FourEyesViolation(_))));
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_active_after_cooldown() {
        let (_store, rules, params) = services();
        // Collapse the cooldown so the sweep sees the rule immediately.
        params
            .set(param_keys::REVENUE_COOLDOWN_SECS, json!(0), "ops")
            .await
            .unwrap();

        let rule = rules
            .propose_rule(split(5_000, 3_000, 2_000), "carol")
            .await
            .unwrap();
        rules.submit(&rule.rule_id, "carol").await.unwrap();
        let approved = rules.approve(&rule.rule_id, "dave").await.unwrap();
        assert_eq!(approved.status, RevenueRuleStatus::CoolingDown);
        assert_eq!(approved.approved_by.as_deref(), Some("dave"));

        let activated = rules
            .activate_ready_rules(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(activated.len(), 1);
        let active = rules.active_rule().await.unwrap().unwrap();
        assert_eq!(active.rule_id, rule.rule_id);

        // A second rule through the same flow supersedes the first.
        let second = rules
            .propose_rule(split(6_000, 2_500, 1_500), "dave")
            .await
            .unwrap();
        rules.submit(&second.rule_id, "dave").await.unwrap();
        rules.approve(&second.rule_id, "carol").await.unwrap();
        rules
            .activate_ready_rules(Utc::now() + Duration::seconds(2))
            .await
            .unwrap();

        assert_eq!(
            rules.active_rule().await.unwrap().unwrap().rule_id,
            second.rule_id
        );
        assert_eq!(
            rules
                .get_rule(&rule.rule_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            RevenueRuleStatus::Superseded
        );

        let notifications = rules.notifications().await.unwrap();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[1].old_split, Some(split(5_000, 3_000, 2_000)));
        assert_eq!(notifications[1].new_split, split(6_000, 2_500, 1_500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sweeps_leave_one_active_rule() {
        let (_store, rules, params) = services();
        params
            .set(param_keys::REVENUE_COOLDOWN_SECS, json!(0), "ops")
            .await
            .unwrap();

        // Two rules ready at once; racing sweeps must activate each exactly
        // once and end with a single incumbent.
        for (proposer, approver) in [("carol", "dave"), ("dave", "carol")] {
            let rule = rules
                .propose_rule(split(5_000, 3_000, 2_000), proposer)
                .await
                .unwrap();
            rules.submit(&rule.rule_id, proposer).await.unwrap();
            rules.approve(&rule.rule_id, approver).await.unwrap();
        }

        let rules = Arc::new(rules);
        let sweep_at = Utc::now() + Duration::seconds(1);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rules = Arc::clone(&rules);
            handles.push(tokio::spawn(async move {
                rules.activate_ready_rules(sweep_at).await.unwrap().len()
            }));
        }
        let mut total_activated = 0;
        for handle in handles {
            total_activated += handle.await.unwrap();
        }
        assert_eq!(total_activated, 2);

        let active = rules
            .list_rules()
            .await
            .unwrap()
            .into_iter()
            .filter(|rule| rule.status == RevenueRuleStatus::Active)
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn emergency_override_requires_justification() {
        let (_store, rules, _params) = services();
        let rule = rules
            .propose_rule(split(5_000, 3_000, 2_000), "carol")
            .await
            .unwrap();
        rules.submit(&rule.rule_id, "carol").await.unwrap();
        rules.approve(&rule.rule_id, "dave").await.unwrap();

        let refused = rules.emergency_activate(&rule.rule_id, "dave", "  ").await;
        assert!(matches!(refused, Err(GovernanceError::InvalidInput(_))));

        // With a justification the override bypasses the 48h default timer.
        let active = rules
            .emergency_activate(&rule.rule_id, "dave", "incumbent split misconfigured")
            .await
            .unwrap();
        assert_eq!(active.status, RevenueRuleStatus::Active);
        let audit = rules.audit_log().await.unwrap();
        assert!(audit.iter().any(|record| record.urgent));
    }

    #[tokio::test]
    async fn rejection_is_terminal() {
        let (_store, rules, _params) = services();
        let rule = rules
            .propose_rule(split(5_000, 3_000, 2_000), "carol")
            .await
            .unwrap();
        rules.submit(&rule.rule_id, "carol").await.unwrap();
        rules
            .reject(&rule.rule_id, "dave", "community share too low")
            .await
            .unwrap();

        let result = rules.approve(&rule.rule_id, "dave").await;
        assert!(matches!(result, Err(GovernanceError::InvalidState(_))));
    }

    fn agent_service(store: Arc<InMemoryCommonsStore>) -> AgentGovernanceService {
        let mut service = AgentGovernanceService::with_store(store);
        let mut delegated = HashMap::new();
        delegated.insert(AgentId::new("delegate"), 40);
        service.register_strategy(Arc::new(DelegationWeight::new(10, delegated)));
        service
    }

    #[tokio::test]
    async fn blacklisted_key_fails_immediately() {
        let store = Arc::new(InMemoryCommonsStore::new());
        let agents = agent_service(store);
        let result = agents
            .propose(
                AgentId::new("agent-a"),
                "governance.quorum_weight",
                json!(1),
            )
            .await;
        assert!(matches!(
            result,
            Err(GovernanceError::NotProposableByAgents(_))
        ));
    }

    #[tokio::test]
    async fn whitelisted_key_reaches_activated_after_quorum_and_cooldown() {
        let store = Arc::new(InMemoryCommonsStore::new());
        let params = ParamsService::with_store(store.clone());
        params
            .set(param_keys::QUORUM_WEIGHT, json!(25), "ops")
            .await
            .unwrap();
        let agents = agent_service(store.clone());

        let proposal = agents
            .propose(
                AgentId::new("agent-a"),
                "economics.transfer_fee_bps",
                json!(30),
            )
            .await
            .unwrap();
        // Fixed weight 10 < quorum 25: still open.
        assert_eq!(proposal.status, ProposalStatus::Open);
        assert_eq!(proposal.total_weight, 10);

        let after = agents
            .vote(&proposal.proposal_id, AgentId::new("agent-b"))
            .await
            .unwrap();
        assert_eq!(after.total_weight, 20);
        let after = agents
            .vote(&proposal.proposal_id, AgentId::new("agent-c"))
            .await
            .unwrap();
        assert_eq!(after.status, ProposalStatus::CoolingDown);

        let activated = agents.activate_expired_cooldowns(Utc::now()).await.unwrap();
        assert_eq!(activated.len(), 1);
        assert_eq!(activated[0].status, ProposalStatus::Activated);

        let params = ParamsService::with_store(store);
        let fee = params.get_i64("economics.transfer_fee_bps", 0).await.unwrap();
        assert_eq!(fee, 30);
    }

    #[tokio::test]
    async fn double_vote_is_rejected() {
        let store = Arc::new(InMemoryCommonsStore::new());
        let agents = agent_service(store);
        let proposal = agents
            .propose(
                AgentId::new("agent-a"),
                "economics.daily_grant_micro",
                json!(2_000_000),
            )
            .await
            .unwrap();

        let result = agents
            .vote(&proposal.proposal_id, AgentId::new("agent-a"))
            .await;
        assert!(matches!(result, Err(GovernanceError::AlreadyVoted { .. })));
    }

    #[tokio::test]
    async fn delegation_strategy_changes_effective_weight() {
        let store = Arc::new(InMemoryCommonsStore::new());
        let params = ParamsService::with_store(store.clone());
        params
            .set(param_keys::WEIGHT_STRATEGY, json!("delegation"), "ops")
            .await
            .unwrap();
        let agents = agent_service(store);

        // Base 10 plus 40 delegated: quorum (default 100) not reached, but
        // the proposer's auto-vote carries the delegated weight.
        let proposal = agents
            .propose(
                AgentId::new("delegate"),
                "economics.reserve_ttl_secs",
                json!(600),
            )
            .await
            .unwrap();
        assert_eq!(proposal.proposer_weight, 50);
        assert_eq!(proposal.total_weight, 50);
    }

    #[tokio::test]
    async fn stale_proposals_expire_past_deadline() {
        let store = Arc::new(InMemoryCommonsStore::new());
        let agents = agent_service(store);
        let proposal = agents
            .propose(
                AgentId::new("agent-a"),
                "economics.transfer_fee_bps",
                json!(5),
            )
            .await
            .unwrap();

        let expired = agents
            .expire_stale_proposals(proposal.deadline + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, ProposalStatus::Expired);

        // Voting after expiry is an invalid-state error, not a silent drop.
        let result = agents
            .vote(&proposal.proposal_id, AgentId::new("agent-b"))
            .await;
        assert!(matches!(result, Err(GovernanceError::InvalidState(_))));
    }
}
