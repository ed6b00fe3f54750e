//! Typed accessors over the versioned runtime parameter store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use commons_store::CommonsStore;
use commons_types::ParamRecord;

use crate::GovernanceError;

/// Read/write surface for runtime parameters.
///
/// Writes go through [`set`](Self::set) only, which increments the version
/// and records the actor. Mutations that depend on a parameter (cooldowns,
/// quorum) resolve it inside their own storage operation, not through this
/// accessor, so these reads are for inspection and service-level defaults.
pub struct ParamsService {
    store: Arc<dyn CommonsStore>,
}

impl ParamsService {
    pub fn with_store(store: Arc<dyn CommonsStore>) -> Self {
        Self { store }
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> Result<i64, GovernanceError> {
        Ok(self
            .store
            .get_param(key)
            .await?
            .and_then(|record| record.value.as_i64())
            .unwrap_or(default))
    }

    pub async fn get_u64(&self, key: &str, default: u64) -> Result<u64, GovernanceError> {
        Ok(self
            .store
            .get_param(key)
            .await?
            .and_then(|record| record.value.as_u64())
            .unwrap_or(default))
    }

    pub async fn get_str(&self, key: &str, default: &str) -> Result<String, GovernanceError> {
        Ok(self
            .store
            .get_param(key)
            .await?
            .and_then(|record| record.value.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string()))
    }

    pub async fn set(
        &self,
        key: &str,
        value: Value,
        actor: &str,
    ) -> Result<ParamRecord, GovernanceError> {
        let record = self.store.set_param(key, value, actor, Utc::now()).await?;
        info!(key, version = record.version, actor, "parameter updated");
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<ParamRecord>, GovernanceError> {
        Ok(self.store.list_params().await?)
    }
}
