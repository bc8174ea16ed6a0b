//! Job Sync — client-side status synchronization for long-running jobs
//!
//! This crate keeps a local view of one server-side job (and its sub-jobs)
//! consistent with the authoritative store while the job runs. Updates arrive
//! over a push subscription; when push misbehaves the session reconnects with
//! bounded exponential backoff, and once the retry budget is spent it falls
//! back to fixed-interval polling until the environment reports recovery.
//!
//! # Overview
//!
//! The crate defines:
//! - A [`TrackingSession`] façade that owns one tracked job at a time
//! - [`JobSource`] / [`SubscriptionTransport`] traits for the server side
//! - [`StateUpdaters`] / [`JobObserver`] traits for the UI side
//! - [`StateStore`] enforcing terminal immutability and freshness
//! - [`ReconnectSupervisor`] and [`PollingFallback`] for degraded operation
//! - [`Environment`] signals that bring a polling session back to push
//! - [`SyncError`] with transient/permanent classification
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use job_sync::{TrackingSession, TrackerConfig};
//!
//! let session = TrackingSession::builder(Arc::new(MySource))
//!     .transport(Arc::new(MyTransport))
//!     .observer(Arc::new(MyObserver))
//!     .config(TrackerConfig::from_env()?)
//!     .build()?;
//! session.initialize(Arc::new(MyUpdaters));
//! session.start_tracking("job-42", "AAPL").await?;
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   start_tracking() ──→ reconcile ──→ subscribe ──→ events ──→ terminal
//!        (async)          (read)        (push)      (store)     (stop)
//!                                         │
//!                               reconnect / polling
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod polling;
pub mod reconcile;
pub mod record;
pub mod session;
pub mod source;
pub mod store;
pub mod supervisor;

pub use channel::{ChannelHandle, ChannelId, ChannelState, PushChannel};
pub use config::TrackerConfig;
pub use error::{SyncError, SyncResult};
pub use job::{Job, JobId, JobStatus, JobStep, SubJob};
pub use lifecycle::{Environment, EnvironmentSignal, LifecycleMonitor};
pub use polling::PollingFallback;
pub use reconcile::{ReconciliationReader, Snapshot};
pub use record::{EventKind, JobRecord, JobUpdate, StatusReport};
pub use session::{SessionStatus, TrackingSession, TrackingSessionBuilder};
pub use source::{
    ConnectionStatus, JobSource, Subscription, SubscriptionId, SubscriptionTransport,
    TransportMessage,
};
pub use store::{JobObserver, NoopObserver, StateStore, StateUpdaters, StoreOutcome, StoreView};
pub use supervisor::{ConnectionMode, ReconnectDecision, ReconnectSupervisor};
