//! External collaborators.
//!
//! The tracker is a protocol client. It depends on two collaborators, both
//! provided by the host application:
//!
//! ```text
//!   JobSource                          SubscriptionTransport
//!   ├── fetch_records(job)  (db read)  ├── subscribe(job) ──→ Subscription
//!   └── fetch_status(job, symbol)      └── unsubscribe(id)
//! ```
//!
//! ## Method table
//!
//! | Method | Used by | Returns |
//! |--------|---------|---------|
//! | `fetch_records()` | reconciliation | `SyncResult<Vec<JobRecord>>` |
//! | `fetch_status()` | polling fallback | `SyncResult<StatusReport>` |
//! | `subscribe()` | push channel | `SyncResult<Subscription>` |
//! | `unsubscribe()` | push channel | `()` |
//!
//! Neither collaborator has to be reliable. Push events may be duplicated,
//! dropped, or reordered; the store's freshness rule absorbs all of that.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SyncResult;
use crate::job::JobId;
use crate::record::{EventKind, JobRecord, StatusReport};

/// Pull-side access to authoritative job state.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Read every record (main job and sub-jobs) belonging to `job_id`.
    ///
    /// MUST fail with `SyncError::StoreUnavailable` when the store cannot be
    /// reached and with `SyncError::NotFound` when nothing exists yet.
    async fn fetch_records(&self, job_id: &JobId) -> SyncResult<Vec<JobRecord>>;

    /// Query the status endpoint for the main job.
    async fn fetch_status(&self, job_id: &JobId, symbol: &str) -> SyncResult<StatusReport>;
}

/// Push-side access: a live event stream filtered to one job.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Open a subscription for `job_id`.
    ///
    /// Returning `Ok` only means the request was accepted. Confirmation
    /// arrives later as [`ConnectionStatus::Subscribed`] on the stream.
    async fn subscribe(&self, job_id: &JobId) -> SyncResult<Subscription>;

    /// Release a subscription. Must tolerate ids that are already gone.
    async fn unsubscribe(&self, id: SubscriptionId);
}

/// Transport-assigned subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Connection-status transitions reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// One item on a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Event { kind: EventKind, record: JobRecord },
    Status(ConnectionStatus),
}

/// An accepted subscription.
///
/// The stream ending is treated as [`ConnectionStatus::Closed`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub messages: mpsc::Receiver<TransportMessage>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, messages: mpsc::Receiver<TransportMessage>) -> Self {
        Self { id, messages }
    }
}
