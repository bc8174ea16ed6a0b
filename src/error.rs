//! Sync error types.
//!
//! Errors are categorized by how the tracking session recovers from them:
//!
//! | Category | Variants | Recovery |
//! |----------|----------|----------|
//! | **Transient** | `StoreUnavailable`, `Transport`, `Timeout` | Supervised reconnect or next poll tick |
//! | **Not yet** | `NotFound` | Nothing to sync yet, retried on the next reconciliation |
//! | **Data** | `InvalidRecord` | Record dropped |
//! | **Job-level** | `JobFailed` | Surfaced once through `JobObserver::on_error` |
//! | **Config** | `Configuration` | Fix configuration |
//! | **Session** | `SessionClosed` | The session driver is gone |
//!
//! Only `Configuration` and `SessionClosed` are ever returned from the
//! [`TrackingSession`](crate::TrackingSession) façade. Everything else is
//! absorbed inside the session and turned into a supervisory action.

use thiserror::Error;

/// Errors produced while synchronizing a job.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    // ── Transient errors ─────────────────────────────────────────────
    /// The authoritative store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The push or status transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A transport operation timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    // ── Not yet ──────────────────────────────────────────────────────
    /// No records exist for the job yet.
    #[error("No records found for job {0}")]
    NotFound(String),

    // ── Data errors ──────────────────────────────────────────────────
    /// A record could not be interpreted.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    // ── Job-level errors ─────────────────────────────────────────────
    /// The job itself reported failure.
    #[error("The job failed: {0}")]
    JobFailed(String),

    // ── Config / session ─────────────────────────────────────────────
    /// Invalid tracker configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The session driver has shut down.
    #[error("Tracking session closed")]
    SessionClosed,
}

impl SyncError {
    /// Returns `true` if the failure is expected to heal on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }

    /// Returns `true` for "no records yet", which is not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
