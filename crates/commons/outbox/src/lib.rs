//! Economic event outbox dispatch.
//!
//! Events are written by storage in the same operation as the ledger
//! mutation they describe; this crate is the consuming side. A dispatcher
//! claims the oldest unpublished event by writing its worker identity,
//! hands it to an [`EventSink`], and acks with `published_at`. A claim that
//! is never acked goes stale after a window (60s by default) and any worker
//! may reclaim it, so a crashed dispatcher loses nothing. Delivery failures
//! never touch the ledger mutation that produced the event.

#![deny(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use commons_store::{CommonsStore, StorageError};
use commons_types::{EconomicEvent, EventId};

/// Default staleness window before an unacked claim is reclaimable.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 60;

/// Downstream consumer of economic events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &EconomicEvent) -> Result<(), DeliveryError>;
}

/// A sink-side delivery failure. The claim is left in place to go stale and
/// be retried.
#[derive(Debug, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Outcome of one dispatch attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing claimable right now.
    Idle,
    Published(EventId),
    /// Claimed but the sink refused it; the claim will go stale.
    Failed(EventId),
}

/// Claims events from the outbox and forwards them to a sink.
pub struct OutboxDispatcher {
    store: Arc<dyn CommonsStore>,
    sink: Arc<dyn EventSink>,
    worker_id: String,
    stale_after: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn CommonsStore>,
        sink: Arc<dyn EventSink>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sink,
            worker_id: worker_id.into(),
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }

    /// Override the staleness window.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Claim and deliver at most one event.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DispatchOutcome, OutboxError> {
        let Some(event) = self
            .store
            .claim_next_event(&self.worker_id, now, self.stale_after)
            .await?
        else {
            return Ok(DispatchOutcome::Idle);
        };
        debug!(
            event_id = %event.event_id,
            sequence = event.sequence,
            worker = %self.worker_id,
            "event claimed"
        );

        match self.sink.publish(&event).await {
            Ok(()) => {
                self.store.mark_published(&event.event_id, now).await?;
                info!(
                    event_id = %event.event_id,
                    event_type = ?event.event_type,
                    "event published"
                );
                Ok(DispatchOutcome::Published(event.event_id))
            }
            Err(error) => {
                // The claim stays; after the staleness window any worker
                // picks it up again.
                warn!(
                    event_id = %event.event_id,
                    worker = %self.worker_id,
                    %error,
                    "delivery failed, leaving claim to go stale"
                );
                Ok(DispatchOutcome::Failed(event.event_id))
            }
        }
    }

    /// Dispatch until the outbox has nothing claimable or a delivery fails.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<Vec<EventId>, OutboxError> {
        let mut published = Vec::new();
        loop {
            match self.run_once(now).await? {
                DispatchOutcome::Published(event_id) => published.push(event_id),
                DispatchOutcome::Idle | DispatchOutcome::Failed(_) => return Ok(published),
            }
        }
    }

    /// Events not yet acked, in insertion order.
    pub async fn backlog(&self) -> Result<Vec<EconomicEvent>, OutboxError> {
        Ok(self.store.list_unpublished().await?)
    }
}

/// Outbox errors.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for OutboxError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::InvalidState(msg) => Self::InvalidState(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}
