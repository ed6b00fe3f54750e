use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RunId;

/// Overall verdict of a reconciliation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconStatus {
    Passed,
    DivergenceDetected,
    Error,
}

/// The fixed battery of reconciliation checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconCheckCode {
    LotConservation,
    AccountConservation,
    PlatformConservation,
    BudgetConsistency,
    TransferConservation,
    DepositBridgeConservation,
}

/// Outcome of one named check, with structured divergence details.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckResult {
    pub code: ReconCheckCode,
    pub passed: bool,
    pub details: Value,
}

/// A point-in-time audit record persisted for history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub run_id: RunId,
    pub status: ReconStatus,
    pub checks: Vec<CheckResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconciliationRun {
    /// Derive the run status from its checks: any failure marks divergence.
    pub fn status_from_checks(checks: &[CheckResult]) -> ReconStatus {
        if checks.iter().all(|check| check.passed) {
            ReconStatus::Passed
        } else {
            ReconStatus::DivergenceDetected
        }
    }
}
