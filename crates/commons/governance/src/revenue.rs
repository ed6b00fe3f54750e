//! Revenue-rule governance: propose, approve under four-eyes, cool down,
//! activate (timer or emergency override), supersede.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use commons_store::{AuditDraft, CommonsStore};
use commons_types::{
    AuditSubject, GovernanceAuditRecord, RevenueRule, RevenueRuleStatus, RevenueSplit, RuleId,
    RuleNotification,
};

use crate::GovernanceError;

/// The revenue-rule governance service.
pub struct RevenueRuleService {
    store: Arc<dyn CommonsStore>,
}

impl RevenueRuleService {
    pub fn with_store(store: Arc<dyn CommonsStore>) -> Self {
        Self { store }
    }

    /// Propose a new split as a draft rule. The split must sum to 10,000 bps;
    /// an unbalanced split is refused before anything persists.
    pub async fn propose_rule(
        &self,
        split: RevenueSplit,
        proposed_by: impl Into<String>,
    ) -> Result<RevenueRule, GovernanceError> {
        if !split.is_balanced() {
            return Err(GovernanceError::UnbalancedSplit {
                total_bps: split.total_bps(),
            });
        }
        let proposed_by = proposed_by.into();
        let now = Utc::now();
        let rule = RevenueRule {
            rule_id: RuleId::generate(),
            split,
            proposed_by: proposed_by.clone(),
            approved_by: None,
            status: RevenueRuleStatus::Draft,
            activates_at: None,
            activated_at: None,
            created_at: now,
            updated_at: now,
        };
        let rule_id = rule.rule_id.clone();
        let rule = self
            .store
            .insert_rule(
                rule,
                AuditDraft {
                    subject: AuditSubject::Rule(rule_id),
                    action: "create".to_string(),
                    actor: proposed_by.clone(),
                    previous_status: None,
                    new_status: Some("draft".to_string()),
                    reason: None,
                    urgent: false,
                },
                now,
            )
            .await?;
        info!(rule_id = %rule.rule_id, proposed_by = %proposed_by, "revenue rule drafted");
        Ok(rule)
    }

    /// `draft -> pending_approval`.
    pub async fn submit(
        &self,
        rule_id: &RuleId,
        actor: &str,
    ) -> Result<RevenueRule, GovernanceError> {
        let rule = self.store.submit_rule(rule_id, actor, Utc::now()).await?;
        info!(rule_id = %rule_id, actor, "revenue rule submitted for approval");
        Ok(rule)
    }

    /// `pending_approval -> cooling_down`. The approver must differ from the
    /// proposer; `activates_at` is stamped from the cooldown parameter inside
    /// the same storage operation.
    pub async fn approve(
        &self,
        rule_id: &RuleId,
        approved_by: &str,
    ) -> Result<RevenueRule, GovernanceError> {
        let rule = self
            .store
            .approve_rule(rule_id, approved_by, Utc::now())
            .await?;
        info!(
            rule_id = %rule_id,
            approved_by,
            activates_at = ?rule.activates_at,
            "revenue rule approved, cooling down"
        );
        Ok(rule)
    }

    /// `pending_approval | cooling_down -> rejected`.
    pub async fn reject(
        &self,
        rule_id: &RuleId,
        actor: &str,
        reason: &str,
    ) -> Result<RevenueRule, GovernanceError> {
        let rule = self
            .store
            .reject_rule(rule_id, actor, reason, Utc::now())
            .await?;
        info!(rule_id = %rule_id, actor, reason, "revenue rule rejected");
        Ok(rule)
    }

    /// Emergency override: activate a cooling-down rule immediately,
    /// bypassing the timer. Requires a non-empty justification; the audit
    /// row is flagged urgent.
    pub async fn emergency_activate(
        &self,
        rule_id: &RuleId,
        actor: &str,
        justification: &str,
    ) -> Result<RevenueRule, GovernanceError> {
        if justification.trim().is_empty() {
            return Err(GovernanceError::InvalidInput(
                "emergency activation requires a justification".to_string(),
            ));
        }
        let rule = self
            .store
            .activate_rule_now(rule_id, actor, justification, Utc::now())
            .await?;
        warn!(
            rule_id = %rule_id,
            actor,
            justification,
            "revenue rule activated by emergency override"
        );
        Ok(rule)
    }

    /// Sweep: activate every cooling-down rule whose timer has elapsed at
    /// `now`, each atomically superseding the incumbent. Idempotent; safe to
    /// run from multiple processes.
    pub async fn activate_ready_rules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RevenueRule>, GovernanceError> {
        let activated = self.store.activate_ready_rules(now).await?;
        for rule in &activated {
            info!(rule_id = %rule.rule_id, "revenue rule activated");
        }
        Ok(activated)
    }

    /// The at-most-one currently active rule.
    pub async fn active_rule(&self) -> Result<Option<RevenueRule>, GovernanceError> {
        Ok(self.store.active_rule().await?)
    }

    pub async fn get_rule(&self, rule_id: &RuleId) -> Result<Option<RevenueRule>, GovernanceError> {
        Ok(self.store.get_rule(rule_id).await?)
    }

    pub async fn list_rules(&self) -> Result<Vec<RevenueRule>, GovernanceError> {
        Ok(self.store.list_rules().await?)
    }

    /// The hash-chained audit log, oldest first.
    pub async fn audit_log(&self) -> Result<Vec<GovernanceAuditRecord>, GovernanceError> {
        Ok(self.store.list_rule_audit().await?)
    }

    /// Activation notifications carrying old and new splits.
    pub async fn notifications(&self) -> Result<Vec<RuleNotification>, GovernanceError> {
        Ok(self.store.list_notifications().await?)
    }
}
