//! Push channel over a [`SubscriptionTransport`].
//!
//! Each [`PushChannel::open`] produces a fresh [`ChannelHandle`] with its own
//! id. A handle is never reused: re-subscribing always opens a new one, so a
//! late status from a replaced handle can be told apart by its id.
//!
//! ```text
//!   Opening ──subscribed──→ Subscribed
//!      │                        │
//!      ├──channel_error/timed_out──→ Errored   (supervised reconnect)
//!      └──closed────────────────→ Closed       (supervised reconnect)
//! ```
//!
//! [`PushChannel::close`] consumes the handle, so a channel we closed
//! ourselves is no longer the session's current channel. Anything it still
//! emits fails the id check and is dropped.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::job::JobId;
use crate::record::{EventKind, JobUpdate};
use crate::source::{ConnectionStatus, SubscriptionId, SubscriptionTransport, TransportMessage};

/// Session-local channel identifier.
pub type ChannelId = u64;

/// Per-handle connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Subscribed,
    Errored,
    Closed,
}

/// A transport message after ingestion.
#[derive(Debug)]
pub enum ChannelEvent {
    Update { kind: EventKind, update: JobUpdate },
    Status(ConnectionStatus),
    /// A record that could not be classified.
    Rejected(SyncError),
}

/// One open subscription.
pub struct ChannelHandle {
    id: ChannelId,
    job_id: JobId,
    subscription: SubscriptionId,
    state: ChannelState,
    pump: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == ChannelState::Subscribed
    }

    /// Classify a message and advance the state machine.
    pub fn ingest(&mut self, message: TransportMessage) -> ChannelEvent {
        match message {
            TransportMessage::Event { kind, record } => {
                match JobUpdate::classify(record, &self.job_id) {
                    Ok(update) => ChannelEvent::Update { kind, update },
                    Err(e) => ChannelEvent::Rejected(e),
                }
            }
            TransportMessage::Status(status) => {
                self.state = match status {
                    ConnectionStatus::Subscribed => ChannelState::Subscribed,
                    ConnectionStatus::ChannelError | ConnectionStatus::TimedOut => {
                        ChannelState::Errored
                    }
                    ConnectionStatus::Closed => ChannelState::Closed,
                };
                ChannelEvent::Status(status)
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Opens and closes subscriptions for one session.
pub struct PushChannel {
    transport: Arc<dyn SubscriptionTransport>,
    next_id: ChannelId,
}

impl PushChannel {
    pub fn new(transport: Arc<dyn SubscriptionTransport>) -> Self {
        Self {
            transport,
            next_id: 0,
        }
    }

    /// Subscribe to `job_id` and start forwarding its messages.
    ///
    /// `forward` receives every message tagged with the new handle's id and
    /// returns `false` once the receiver is gone. A stream that ends is
    /// forwarded as `Closed`.
    pub async fn open<F>(&mut self, job_id: &JobId, forward: F) -> SyncResult<ChannelHandle>
    where
        F: Fn(ChannelId, TransportMessage) -> bool + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        let subscription = self.transport.subscribe(job_id).await?;
        debug!(%job_id, channel = id, subscription = %subscription.id, "subscription requested");

        let mut messages = subscription.messages;
        let pump = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if !forward(id, message) {
                    return;
                }
            }
            forward(id, TransportMessage::Status(ConnectionStatus::Closed));
        });

        Ok(ChannelHandle {
            id,
            job_id: job_id.clone(),
            subscription: subscription.id,
            state: ChannelState::Opening,
            pump,
        })
    }

    /// Close a handle on our own initiative.
    ///
    /// The pump stops before the transport is told, so this never surfaces
    /// as a `Closed` status.
    pub async fn close(&self, handle: ChannelHandle) {
        handle.pump.abort();
        debug!(job_id = %handle.job_id, channel = handle.id, "closing subscription");
        self.transport.unsubscribe(handle.subscription).await;
    }
}
