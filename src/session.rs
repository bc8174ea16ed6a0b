//! The tracking session façade and its driver.
//!
//! A [`TrackingSession`] is a handle to one driver task that owns every piece
//! of mutable state: the store, the push channel, the poll loop, the
//! reconnect supervisor and the lifecycle listener. Everything that happens
//! asynchronously (push messages, poll results, reconnect timers,
//! environment signals, caller requests) arrives as a message on a single
//! mailbox and is handled in order.
//!
//! ```text
//!   start_tracking ──→ reconcile ──→ open push ──subscribed──→ reconcile
//!                                       │
//!                          channel_error / timed_out / closed
//!                                       ▼
//!                               ReconnectSupervisor
//!                       ┌──────────────┴──────────────┐
//!                 backoff timer                  exhausted
//!                       │                             │
//!                  reopen push                 PollingFallback
//!                                                     │
//!                        visible / online ────────────┘ (back to push)
//! ```
//!
//! Every background message carries the epoch it was created under. Starting
//! a new job or calling [`cleanup`](TrackingSession::cleanup) bumps the
//! shared epoch before returning, so anything that completes afterwards is
//! dropped at the mailbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ChannelHandle, ChannelId, PushChannel};
use crate::config::TrackerConfig;
use crate::error::{SyncError, SyncResult};
use crate::job::JobId;
use crate::lifecycle::{Environment, EnvironmentSignal, LifecycleAction, LifecycleMonitor};
use crate::polling::PollingFallback;
use crate::reconcile::{ReconciliationReader, Snapshot};
use crate::record::{JobUpdate, StatusReport};
use crate::source::{ConnectionStatus, JobSource, SubscriptionTransport, TransportMessage};
use crate::store::{
    JobObserver, NoopObserver, StateStore, StateUpdaters, StoreOutcome, StoreView,
};
use crate::supervisor::{ConnectionMode, ReconnectDecision, ReconnectSupervisor};

/// Observable session state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub active_job_id: Option<JobId>,
    pub connection_mode: ConnectionMode,
    pub reconnect_attempts: u32,
}

enum SessionMsg {
    Initialize(Arc<dyn StateUpdaters>),
    Start {
        epoch: u64,
        job_id: JobId,
        symbol: String,
        done: oneshot::Sender<()>,
    },
    Cleanup,
    Resync {
        job_id: JobId,
        done: oneshot::Sender<()>,
    },
    Channel {
        epoch: u64,
        channel: ChannelId,
        message: TransportMessage,
    },
    Poll {
        epoch: u64,
        job_id: JobId,
        report: SyncResult<StatusReport>,
    },
    ReconnectDue {
        epoch: u64,
        ticket: u64,
    },
    Lifecycle {
        epoch: u64,
        signal: EnvironmentSignal,
    },
    Shutdown,
}

/// Configures and spawns a [`TrackingSession`].
pub struct TrackingSessionBuilder {
    source: Arc<dyn JobSource>,
    transport: Option<Arc<dyn SubscriptionTransport>>,
    observer: Arc<dyn JobObserver>,
    environment: Option<Environment>,
    config: TrackerConfig,
}

impl TrackingSessionBuilder {
    /// Push transport. Without one the session tracks by polling only.
    pub fn transport(mut self, transport: Arc<dyn SubscriptionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Source of visibility and connectivity signals.
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and spawn the driver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> SyncResult<TrackingSession> {
        self.config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let store = StateStore::new(self.observer);
        let store_rx = store.watch();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());

        let driver = SessionDriver {
            tx: tx.clone(),
            shared_epoch: epoch.clone(),
            epoch: 0,
            active: None,
            mode: ConnectionMode::Idle,
            store,
            reader: ReconciliationReader::new(self.source.clone()),
            push: self.transport.map(PushChannel::new),
            channel: None,
            polling: PollingFallback::new(self.source, self.config.poll_interval()),
            supervisor: ReconnectSupervisor::new(&self.config),
            lifecycle: LifecycleMonitor::new(),
            environment: self.environment,
            status_tx,
        };
        tokio::spawn(driver.run(rx));

        Ok(TrackingSession {
            mailbox: tx,
            epoch,
            store_rx,
            status_rx,
        })
    }
}

/// Keeps the local view of one job in sync with the server.
///
/// At most one job is tracked at a time. Dropping the session releases every
/// subscription, timer and listener it owns.
pub struct TrackingSession {
    mailbox: mpsc::UnboundedSender<SessionMsg>,
    epoch: Arc<AtomicU64>,
    store_rx: watch::Receiver<StoreView>,
    status_rx: watch::Receiver<SessionStatus>,
}

impl TrackingSession {
    pub fn builder(source: Arc<dyn JobSource>) -> TrackingSessionBuilder {
        TrackingSessionBuilder {
            source,
            transport: None,
            observer: Arc::new(NoopObserver),
            environment: None,
            config: TrackerConfig::default(),
        }
    }

    /// Bind the UI-side mutation callbacks.
    pub fn initialize(&self, updaters: Arc<dyn StateUpdaters>) {
        let _ = self.mailbox.send(SessionMsg::Initialize(updaters));
    }

    /// Start tracking `job_id`, superseding any job tracked before.
    ///
    /// Returns once the initial reconciliation has run and the subscription
    /// has been requested; it does not wait for events.
    pub async fn start_tracking(
        &self,
        job_id: impl Into<JobId>,
        symbol: impl Into<String>,
    ) -> SyncResult<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (done, ack) = oneshot::channel();
        self.mailbox
            .send(SessionMsg::Start {
                epoch,
                job_id: job_id.into(),
                symbol: symbol.into(),
                done,
            })
            .map_err(|_| SyncError::SessionClosed)?;
        ack.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Stop tracking and release everything. Safe to call repeatedly.
    ///
    /// The session is inactive as soon as this returns; resources are
    /// released by the driver shortly after.
    pub fn cleanup(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.mailbox.send(SessionMsg::Cleanup);
    }

    /// Re-read the job from the authoritative store and apply it.
    ///
    /// Only affects the job currently held by the store; "no records yet"
    /// and store outages are logged, not returned.
    pub async fn sync_job_status_from_database(&self, job_id: impl Into<JobId>) -> SyncResult<()> {
        let (done, ack) = oneshot::channel();
        self.mailbox
            .send(SessionMsg::Resync {
                job_id: job_id.into(),
                done,
            })
            .map_err(|_| SyncError::SessionClosed)?;
        ack.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Current job and sub-jobs.
    pub fn store(&self) -> StoreView {
        self.store_rx.borrow().clone()
    }

    pub fn watch_store(&self) -> watch::Receiver<StoreView> {
        self.store_rx.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.mailbox.send(SessionMsg::Shutdown);
    }
}

struct ActiveJob {
    job_id: JobId,
    symbol: String,
}

struct SessionDriver {
    tx: mpsc::UnboundedSender<SessionMsg>,
    shared_epoch: Arc<AtomicU64>,
    /// Epoch the active job was started under.
    epoch: u64,
    active: Option<ActiveJob>,
    mode: ConnectionMode,
    store: StateStore,
    reader: ReconciliationReader,
    push: Option<PushChannel>,
    channel: Option<ChannelHandle>,
    polling: PollingFallback,
    supervisor: ReconnectSupervisor,
    lifecycle: LifecycleMonitor,
    environment: Option<Environment>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionDriver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMsg>) {
        while let Some(msg) = rx.recv().await {
            if matches!(msg, SessionMsg::Shutdown) {
                break;
            }
            self.handle(msg).await;
        }
        self.release().await;
        debug!("tracking session driver stopped");
    }

    async fn handle(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::Initialize(updaters) => self.store.set_updaters(updaters),
            SessionMsg::Start {
                epoch,
                job_id,
                symbol,
                done,
            } => {
                if epoch == self.shared_epoch.load(Ordering::SeqCst) {
                    self.start(epoch, job_id, symbol).await;
                } else {
                    debug!(%job_id, "start superseded before it ran");
                }
                let _ = done.send(());
            }
            SessionMsg::Cleanup => self.cleanup().await,
            SessionMsg::Resync { job_id, done } => {
                self.resync(&job_id).await;
                let _ = done.send(());
            }
            SessionMsg::Channel {
                epoch,
                channel,
                message,
            } => {
                if self.is_live(epoch) {
                    self.on_channel_message(channel, message).await;
                } else {
                    debug!(channel, "push message for an inactive job dropped");
                }
            }
            SessionMsg::Poll {
                epoch,
                job_id,
                report,
            } => {
                if self.is_live(epoch) && self.polling.job_id() == Some(&job_id) {
                    self.on_poll(job_id, report).await;
                } else {
                    debug!(%job_id, "poll result for an inactive job dropped");
                }
            }
            SessionMsg::ReconnectDue { epoch, ticket } => {
                if self.is_live(epoch) && self.supervisor.take_due(ticket) {
                    info!(
                        attempt = self.supervisor.attempts(),
                        "reconnecting push channel"
                    );
                    self.open_channel().await;
                } else {
                    debug!(ticket, "superseded reconnect timer ignored");
                }
            }
            SessionMsg::Lifecycle { epoch, signal } => {
                if self.is_live(epoch) {
                    self.on_lifecycle(signal).await;
                }
            }
            SessionMsg::Shutdown => {}
        }
    }

    /// Whether a message created under `epoch` may still act.
    fn is_live(&self, epoch: u64) -> bool {
        self.active.is_some()
            && epoch == self.epoch
            && epoch == self.shared_epoch.load(Ordering::SeqCst)
    }

    async fn start(&mut self, epoch: u64, job_id: JobId, symbol: String) {
        self.release().await;
        self.store.track(job_id.clone());
        self.epoch = epoch;
        self.active = Some(ActiveJob {
            job_id: job_id.clone(),
            symbol,
        });
        self.mode = ConnectionMode::Push;
        if let Some(updaters) = self.store.updaters() {
            updaters.set_is_running_research(true);
            updaters.set_is_reconnecting(false);
        }
        self.attach_lifecycle();
        self.publish_status();
        info!(%job_id, "tracking started");

        if !self.reconcile().await {
            return;
        }
        if self.push.is_none() {
            info!(%job_id, "push transport unavailable, tracking by polling");
            self.start_polling();
            return;
        }
        self.open_channel().await;
    }

    async fn cleanup(&mut self) {
        self.release().await;
        self.store.evict();
        if let Some(updaters) = self.store.updaters() {
            updaters.set_is_reconnecting(false);
        }
        if let Some(active) = self.active.take() {
            info!(job_id = %active.job_id, "tracking cleaned up");
        }
        self.mode = ConnectionMode::Idle;
        self.publish_status();
    }

    /// Stop every delivery path. The store is left as is.
    async fn release(&mut self) {
        self.supervisor.reset();
        self.polling.stop();
        self.lifecycle.detach();
        self.close_channel().await;
    }

    /// The job reached a terminal state. Stop tracking, keep the result.
    async fn finish(&mut self) {
        self.release().await;
        if let Some(updaters) = self.store.updaters() {
            updaters.set_is_reconnecting(false);
        }
        if let Some(active) = self.active.take() {
            info!(job_id = %active.job_id, "job reached a terminal state, tracking finished");
        }
        self.mode = ConnectionMode::Idle;
        self.publish_status();
    }

    async fn after_write(&mut self, outcome: StoreOutcome) {
        if let StoreOutcome::Failed(message) = &outcome {
            warn!("{}", SyncError::JobFailed(message.clone()));
        }
        if outcome.is_terminal() {
            self.finish().await;
        }
    }

    /// Seed or refresh the store from a snapshot.
    ///
    /// Returns whether the job is still being tracked afterwards.
    async fn reconcile(&mut self) -> bool {
        let Some(job_id) = self.active.as_ref().map(|a| a.job_id.clone()) else {
            return false;
        };
        let epoch = self.epoch;
        self.resync(&job_id).await;
        self.is_live(epoch)
    }

    async fn resync(&mut self, job_id: &JobId) {
        let snapshot = match self.reader.fetch_snapshot(job_id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => {
                debug!(%job_id, "nothing to sync yet");
                return;
            }
            Err(e) if e.is_transient() => {
                warn!(%job_id, "reconciliation deferred: {e}");
                return;
            }
            Err(e) => {
                warn!(%job_id, "reconciliation failed: {e}");
                return;
            }
        };
        let current = self.epoch == self.shared_epoch.load(Ordering::SeqCst);
        if !current || self.store.tracked() != Some(job_id) {
            debug!(%job_id, "snapshot for a job no longer held dropped");
            return;
        }
        self.apply_snapshot(snapshot).await;
    }

    async fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let accepted = self.store.set_sub_jobs(snapshot.sub_jobs);
        debug!(accepted, "sub-jobs reconciled");
        if let Some(job) = snapshot.job {
            let outcome = self.store.set_job(job);
            self.after_write(outcome).await;
        }
    }

    async fn open_channel(&mut self) {
        let Some(job_id) = self.active.as_ref().map(|a| a.job_id.clone()) else {
            return;
        };
        if self.push.is_none() {
            return;
        }
        // Push and polling never drive the same job at once.
        self.polling.stop();
        self.close_channel().await;

        let epoch = self.epoch;
        let tx = self.tx.clone();
        let forward = move |channel, message| {
            tx.send(SessionMsg::Channel {
                epoch,
                channel,
                message,
            })
            .is_ok()
        };
        let Some(push) = self.push.as_mut() else {
            return;
        };
        let opened = push.open(&job_id, forward).await;

        match opened {
            Ok(handle) if self.is_live(epoch) => {
                // A reconnect stays in `Reconnecting` until confirmed.
                if self.supervisor.attempts() == 0 {
                    self.mode = ConnectionMode::Push;
                }
                self.channel = Some(handle);
                self.publish_status();
            }
            Ok(handle) => {
                if let Some(push) = &self.push {
                    push.close(handle).await;
                }
            }
            Err(e) => {
                warn!(%job_id, "subscribe failed: {e}");
                if self.is_live(epoch) {
                    self.on_channel_problem().await;
                }
            }
        }
    }

    async fn close_channel(&mut self) {
        if let (Some(handle), Some(push)) = (self.channel.take(), &self.push) {
            push.close(handle).await;
        }
    }

    async fn on_channel_message(&mut self, channel: ChannelId, message: TransportMessage) {
        let Some(handle) = self.channel.as_mut().filter(|h| h.id() == channel) else {
            debug!(channel, "message from a replaced channel dropped");
            return;
        };
        let event = handle.ingest(message);

        match event {
            ChannelEvent::Update { kind, update } => {
                let outcome = match update {
                    JobUpdate::MainJob(job) => self.store.set_job(job),
                    JobUpdate::SubJob(sub_job) => self.store.upsert_sub_job(sub_job),
                };
                if !outcome.is_accepted() {
                    debug!(?kind, ?outcome, "push event dropped");
                }
                self.after_write(outcome).await;
            }
            ChannelEvent::Rejected(e) => warn!("unreadable push record: {e}"),
            ChannelEvent::Status(ConnectionStatus::Subscribed) => {
                info!(channel, "push subscription confirmed");
                self.supervisor.on_subscribed();
                self.mode = ConnectionMode::Push;
                if let Some(updaters) = self.store.updaters() {
                    updaters.set_is_reconnecting(false);
                }
                self.publish_status();
                // Events between job start and confirmation are only
                // recoverable by a read.
                self.reconcile().await;
            }
            ChannelEvent::Status(
                status @ (ConnectionStatus::ChannelError | ConnectionStatus::TimedOut),
            ) => {
                warn!(channel, ?status, "push channel problem");
                self.on_channel_problem().await;
            }
            // Only the current channel gets here; our own closes were
            // dropped by the id check above.
            ChannelEvent::Status(ConnectionStatus::Closed) => {
                warn!(channel, "push channel closed");
                self.on_channel_problem().await;
            }
        }
    }

    async fn on_channel_problem(&mut self) {
        let decision = self.supervisor.on_channel_problem();
        self.apply_decision(decision).await;
    }

    async fn apply_decision(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::Scheduled {
                attempt,
                delay,
                ticket,
            } => {
                info!(
                    attempt,
                    max_attempts = self.supervisor.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                let tx = self.tx.clone();
                let epoch = self.epoch;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(SessionMsg::ReconnectDue { epoch, ticket });
                });
                self.supervisor.arm(ticket, timer);
                self.mode = ConnectionMode::Reconnecting;
                if let Some(updaters) = self.store.updaters() {
                    updaters.set_is_reconnecting(true);
                }
                self.publish_status();
            }
            ReconnectDecision::AlreadyInFlight => {
                debug!("reconnect already in progress");
            }
            ReconnectDecision::Exhausted => {
                warn!("max reconnection attempts reached, falling back to polling");
                self.close_channel().await;
                if let Some(updaters) = self.store.updaters() {
                    updaters.set_is_reconnecting(false);
                }
                self.start_polling();
            }
        }
    }

    /// Callers close the push channel first.
    fn start_polling(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let epoch = self.epoch;
        let shared_epoch = self.shared_epoch.clone();
        let tx = self.tx.clone();
        self.polling.start(
            active.job_id.clone(),
            active.symbol.clone(),
            move |_| shared_epoch.load(Ordering::SeqCst) == epoch,
            move |job_id, report| {
                tx.send(SessionMsg::Poll {
                    epoch,
                    job_id: job_id.clone(),
                    report,
                })
                .is_ok()
            },
        );
        self.mode = ConnectionMode::Polling;
        self.publish_status();
    }

    async fn on_poll(&mut self, job_id: JobId, report: SyncResult<StatusReport>) {
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                warn!(%job_id, "status check failed: {e}");
                return;
            }
        };
        match report.into_job(&job_id, Utc::now()) {
            Ok(Some(job)) => {
                let outcome = self.store.set_job(job);
                self.after_write(outcome).await;
            }
            Ok(None) => debug!(%job_id, "status query has nothing for the job yet"),
            Err(e) => warn!(%job_id, "unreadable status report: {e}"),
        }
    }

    fn attach_lifecycle(&mut self) {
        let Some(environment) = &self.environment else {
            return;
        };
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.lifecycle.attach(environment, move |signal| {
            tx.send(SessionMsg::Lifecycle { epoch, signal }).is_ok()
        });
    }

    async fn on_lifecycle(&mut self, signal: EnvironmentSignal) {
        let subscribed = self
            .channel
            .as_ref()
            .is_some_and(ChannelHandle::is_subscribed);
        match LifecycleMonitor::decide(signal, self.active.is_some(), subscribed) {
            LifecycleAction::Resubscribe if self.push.is_some() => {
                info!(?signal, mode = ?self.mode, "environment recovered, resubscribing");
                self.supervisor.reset();
                self.open_channel().await;
            }
            LifecycleAction::Resubscribe => {
                debug!(?signal, "no push transport to recover");
            }
            LifecycleAction::Ignore => match signal {
                EnvironmentSignal::Offline => info!("network connection lost"),
                _ => debug!(?signal, "environment signal ignored"),
            },
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(SessionStatus {
            active_job_id: self.active.as_ref().map(|a| a.job_id.clone()),
            connection_mode: self.mode,
            reconnect_attempts: self.supervisor.attempts(),
        });
    }
}
