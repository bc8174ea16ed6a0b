//! Tracking session tests against in-memory transports.
//!
//! All tests run on paused time, so reconnect and poll timing is observed
//! exactly as scheduled.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use job_sync::{
    ConnectionMode, ConnectionStatus, Environment, EventKind, Job, JobId, JobObserver, JobRecord,
    JobSource, JobStatus, StateUpdaters, StatusReport, SubJob, Subscription, SubscriptionId,
    SubscriptionTransport, SyncError, SyncResult, TrackerConfig, TrackingSession,
    TransportMessage,
};

// ============================================================================
// Fixtures
// ============================================================================

/// One `subscribe` call, with a handle to feed its stream.
struct Attempt {
    at: Instant,
    job_id: JobId,
    id: SubscriptionId,
    inject: mpsc::Sender<TransportMessage>,
}

impl Attempt {
    /// Delivery to a channel the session already closed is silently lost.
    async fn send(&self, message: TransportMessage) {
        let _ = self.inject.send(message).await;
    }

    async fn status(&self, status: ConnectionStatus) {
        self.send(TransportMessage::Status(status)).await;
    }

    async fn event(&self, kind: EventKind, record: Value) {
        let record: JobRecord = serde_json::from_value(record).unwrap();
        self.send(TransportMessage::Event { kind, record }).await;
    }
}

struct MockTransport {
    attempts: mpsc::UnboundedSender<Attempt>,
    next_id: AtomicU64,
    unsubscribed: Mutex<Vec<SubscriptionId>>,
    /// Number of upcoming `subscribe` calls to refuse.
    refuse: AtomicUsize,
    refused: Mutex<Vec<Instant>>,
}

#[async_trait]
impl SubscriptionTransport for MockTransport {
    async fn subscribe(&self, job_id: &JobId) -> SyncResult<Subscription> {
        let refusing = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refusing {
            self.refused.lock().unwrap().push(Instant::now());
            return Err(SyncError::Transport("handshake rejected".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let _ = self.attempts.send(Attempt {
            at: Instant::now(),
            job_id: job_id.clone(),
            id,
            inject: tx,
        });
        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.unsubscribed.lock().unwrap().push(id);
    }
}

#[derive(Default)]
struct MockSource {
    records: Mutex<Vec<JobRecord>>,
    status: Mutex<StatusReport>,
    polls: Mutex<Vec<Instant>>,
    record_reads: AtomicUsize,
    store_down: AtomicBool,
    status_down: AtomicBool,
}

impl MockSource {
    fn set_records(&self, records: Vec<Value>) {
        *self.records.lock().unwrap() = records
            .into_iter()
            .map(|r| serde_json::from_value(r).unwrap())
            .collect();
    }

    fn set_status(&self, report: Value) {
        *self.status.lock().unwrap() = serde_json::from_value(report).unwrap();
    }

    fn poll_count(&self) -> usize {
        self.polls.lock().unwrap().len()
    }
}

#[async_trait]
impl JobSource for MockSource {
    async fn fetch_records(&self, job_id: &JobId) -> SyncResult<Vec<JobRecord>> {
        self.record_reads.fetch_add(1, Ordering::SeqCst);
        if self.store_down.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable("connection refused".into()));
        }
        let records = self.records.lock().unwrap().clone();
        if records.is_empty() {
            return Err(SyncError::NotFound(job_id.to_string()));
        }
        Ok(records)
    }

    async fn fetch_status(&self, _job_id: &JobId, _symbol: &str) -> SyncResult<StatusReport> {
        self.polls.lock().unwrap().push(Instant::now());
        if self.status_down.load(Ordering::SeqCst) {
            return Err(SyncError::Timeout("status query".into()));
        }
        Ok(self.status.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct Recorder {
    jobs: Mutex<Vec<Job>>,
    sub_jobs: Mutex<Vec<SubJob>>,
    completes: Mutex<Vec<Option<Value>>>,
    errors: Mutex<Vec<String>>,
}

impl JobObserver for Recorder {
    fn on_job_update(&self, job: &Job) {
        self.jobs.lock().unwrap().push(job.clone());
    }

    fn on_sub_job_update(&self, sub_job: &SubJob) {
        self.sub_jobs.lock().unwrap().push(sub_job.clone());
    }

    fn on_complete(&self, result: Option<&Value>) {
        self.completes.lock().unwrap().push(result.cloned());
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

#[derive(Default)]
struct Updaters {
    running: Mutex<Vec<bool>>,
    reconnecting: Mutex<Vec<bool>>,
    results: Mutex<Vec<Option<Value>>>,
}

impl StateUpdaters for Updaters {
    fn set_job_status(&self, _job: Option<&Job>) {}

    fn set_sub_jobs(&self, _sub_jobs: &[SubJob]) {}

    fn set_workflow_result(&self, result: Option<&Value>) {
        self.results.lock().unwrap().push(result.cloned());
    }

    fn set_is_running_research(&self, running: bool) {
        self.running.lock().unwrap().push(running);
    }

    fn set_is_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.lock().unwrap().push(reconnecting);
    }
}

struct Harness {
    session: TrackingSession,
    source: Arc<MockSource>,
    transport: Arc<MockTransport>,
    attempts: mpsc::UnboundedReceiver<Attempt>,
    observer: Arc<Recorder>,
    updaters: Arc<Updaters>,
    environment: Environment,
    start: Instant,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    fn with_config(config: TrackerConfig) -> Self {
        let source = Arc::new(MockSource::default());
        let (tx, attempts) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            attempts: tx,
            next_id: AtomicU64::new(0),
            unsubscribed: Mutex::new(Vec::new()),
            refuse: AtomicUsize::new(0),
            refused: Mutex::new(Vec::new()),
        });
        let observer = Arc::new(Recorder::default());
        let updaters = Arc::new(Updaters::default());
        let environment = Environment::new();

        let session = TrackingSession::builder(source.clone())
            .transport(transport.clone())
            .observer(observer.clone())
            .environment(environment.clone())
            .config(config)
            .build()
            .unwrap();
        session.initialize(updaters.clone());

        Self {
            session,
            source,
            transport,
            attempts,
            observer,
            updaters,
            environment,
            start: Instant::now(),
        }
    }

    async fn next_attempt(&mut self) -> Attempt {
        self.attempts.recv().await.expect("subscribe attempt")
    }

    fn no_pending_attempt(&mut self) -> bool {
        self.attempts.try_recv().is_err()
    }

    fn offset_ms(&self, at: Instant) -> u64 {
        at.duration_since(self.start).as_millis() as u64
    }

    fn unsubscribed(&self) -> Vec<SubscriptionId> {
        self.transport.unsubscribed.lock().unwrap().clone()
    }

    fn mode(&self) -> ConnectionMode {
        self.session.status().connection_mode
    }
}

/// Let every spawned task drain its queue.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn assert_near(actual_ms: u64, expected_ms: u64) {
    assert!(
        actual_ms.abs_diff(expected_ms) <= 50,
        "expected ~{expected_ms}ms, got {actual_ms}ms"
    );
}

fn at(seconds: i64) -> String {
    (Utc.timestamp_opt(1_700_000_000, 0).unwrap() + chrono::Duration::seconds(seconds)).to_rfc3339()
}

fn main_record(job_id: &str, status: &str, seconds: i64, result: Option<Value>) -> Value {
    json!({
        "main_job_id": job_id,
        "job_name": "main_flow",
        "symbol": "AAPL",
        "status": status,
        "metadata": { "result": result },
        "created_at": at(0),
        "updated_at": at(seconds),
    })
}

fn sub_job_record(job_id: &str, sub_job_id: &str, name: &str, status: &str, seconds: i64) -> Value {
    json!({
        "main_job_id": job_id,
        "sub_job_id": sub_job_id,
        "job_name": name,
        "status": status,
        "metadata": {},
        "created_at": at(0),
        "updated_at": at(seconds),
    })
}

/// Fail every subscription until the session falls back to polling.
async fn exhaust_push(h: &mut Harness) -> Vec<Attempt> {
    let mut held = Vec::new();
    loop {
        let attempt = h.next_attempt().await;
        attempt.status(ConnectionStatus::ChannelError).await;
        held.push(attempt);
        settle().await;
        if h.mode() == ConnectionMode::Polling {
            return held;
        }
    }
}

// ============================================================================
// Push path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_sub_job_event_after_empty_reconcile() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();

    let attempt = h.next_attempt().await;
    assert_eq!(attempt.job_id, JobId::new("job-1"));
    attempt.status(ConnectionStatus::Subscribed).await;
    attempt
        .event(
            EventKind::Insert,
            sub_job_record("job-1", "sub-1", "quantitative_agent", "running", 1),
        )
        .await;
    settle().await;

    let seen = h.observer.sub_jobs.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, "quantitative_agent");
    assert_eq!(seen[0].status, JobStatus::Running);
    assert_eq!(h.session.store().sub_jobs.len(), 1);
    assert_eq!(h.mode(), ConnectionMode::Push);
    // Once at start, once after the subscription was confirmed.
    assert_eq!(h.source.record_reads.load(Ordering::SeqCst), 2);
    assert_eq!(*h.updaters.running.lock().unwrap(), vec![true]);
}

#[tokio::test(start_paused = true)]
async fn test_completion_fires_once() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let attempt = h.next_attempt().await;
    attempt.status(ConnectionStatus::Subscribed).await;

    let result = json!({ "recommendation": "hold", "confidence": 0.72 });
    let completed = main_record("job-1", "completed", 5, Some(result.clone()));
    attempt.event(EventKind::Update, completed.clone()).await;
    settle().await;
    attempt.event(EventKind::Update, completed.clone()).await;
    settle().await;

    assert_eq!(*h.observer.completes.lock().unwrap(), vec![Some(result.clone())]);
    let status = h.session.status();
    assert_eq!(status.active_job_id, None);
    assert_eq!(status.connection_mode, ConnectionMode::Idle);
    assert_eq!(h.unsubscribed(), vec![attempt.id]);

    let view = h.session.store();
    let job = view.job.expect("result kept after completion");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(result.clone()));
    assert_eq!(h.updaters.results.lock().unwrap().last(), Some(&Some(result)));

    // Re-reading and re-tracking the finished job stays silent.
    h.source.set_records(vec![completed]);
    h.session.sync_job_status_from_database("job-1").await.unwrap();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    settle().await;
    assert_eq!(h.observer.completes.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_job_failure_surfaces_once() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let attempt = h.next_attempt().await;
    attempt.status(ConnectionStatus::Subscribed).await;

    let mut failed = main_record("job-1", "failed", 3, None);
    failed["error"] = json!("upstream quota exceeded");
    attempt.event(EventKind::Update, failed.clone()).await;
    settle().await;

    let mut late = main_record("job-1", "completed", 9, Some(json!({})));
    late["error"] = Value::Null;
    attempt.event(EventKind::Update, late).await;
    settle().await;

    assert_eq!(
        *h.observer.errors.lock().unwrap(),
        vec!["upstream quota exceeded".to_string()]
    );
    assert!(h.observer.completes.lock().unwrap().is_empty());
    assert_eq!(h.session.store().job.unwrap().status, JobStatus::Failed);
    assert_eq!(h.mode(), ConnectionMode::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stale_event_is_dropped() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let attempt = h.next_attempt().await;
    attempt.status(ConnectionStatus::Subscribed).await;

    attempt
        .event(EventKind::Update, main_record("job-1", "running", 10, None))
        .await;
    attempt
        .event(EventKind::Update, main_record("job-1", "pending", 4, None))
        .await;
    settle().await;

    assert_eq!(h.session.store().job.unwrap().status, JobStatus::Running);
    assert_eq!(h.observer.jobs.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_reconciles_existing_records() {
    let mut h = Harness::new();
    h.source.set_records(vec![
        main_record("job-1", "running", 2, None),
        sub_job_record("job-1", "sub-1", "news_agent", "completed", 1),
        sub_job_record("job-1", "sub-2", "quantitative_agent", "running", 2),
    ]);
    h.session.start_tracking("job-1", "AAPL").await.unwrap();

    let view = h.session.store();
    assert_eq!(view.job.unwrap().status, JobStatus::Running);
    assert_eq!(view.sub_jobs.len(), 2);
    let _attempt = h.next_attempt().await;
}

#[tokio::test(start_paused = true)]
async fn test_terminal_snapshot_skips_subscription() {
    let mut h = Harness::new();
    h.source
        .set_records(vec![main_record("job-1", "completed", 2, Some(json!([1, 2])))]);
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    settle().await;

    assert!(h.no_pending_attempt());
    assert_eq!(*h.observer.completes.lock().unwrap(), vec![Some(json!([1, 2]))]);
    assert_eq!(h.mode(), ConnectionMode::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_job_stops_receiving() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let first = h.next_attempt().await;
    first.status(ConnectionStatus::Subscribed).await;
    settle().await;

    h.session.start_tracking("job-2", "MSFT").await.unwrap();
    let second = h.next_attempt().await;
    assert_eq!(second.job_id, JobId::new("job-2"));
    assert_eq!(h.unsubscribed(), vec![first.id]);

    first
        .event(EventKind::Update, main_record("job-1", "completed", 9, None))
        .await;
    settle().await;

    assert!(h.session.store().job.is_none());
    assert!(h.observer.completes.lock().unwrap().is_empty());
    assert_eq!(h.session.status().active_job_id, Some(JobId::new("job-2")));
}

#[tokio::test(start_paused = true)]
async fn test_resync_ignores_other_jobs() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let _attempt = h.next_attempt().await;

    h.source.set_records(vec![main_record("job-9", "running", 2, None)]);
    h.session.sync_job_status_from_database("job-9").await.unwrap();
    assert!(h.session.store().job.is_none());

    h.source.set_records(vec![main_record("job-1", "running", 2, None)]);
    h.session.sync_job_status_from_database("job-1").await.unwrap();
    assert_eq!(h.session.store().job.unwrap().status, JobStatus::Running);
}

// ============================================================================
// Reconnect and fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_backoff_schedule() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();

    let first = h.next_attempt().await;
    assert_near(h.offset_ms(first.at), 0);
    // Repeats while a reconnect is pending do not add attempts.
    for _ in 0..3 {
        first.status(ConnectionStatus::ChannelError).await;
    }
    settle().await;
    assert_eq!(h.session.status().reconnect_attempts, 1);
    assert_eq!(h.mode(), ConnectionMode::Reconnecting);
    assert_eq!(h.updaters.reconnecting.lock().unwrap().last(), Some(&true));

    let mut held = vec![first];
    let mut offsets = Vec::new();
    for _ in 0..3 {
        let attempt = h.next_attempt().await;
        offsets.push(h.offset_ms(attempt.at));
        attempt.status(ConnectionStatus::ChannelError).await;
        held.push(attempt);
    }
    for (actual, expected) in offsets.into_iter().zip([1000, 3000, 7000]) {
        assert_near(actual, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscribed_restores_budget() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let first = h.next_attempt().await;
    first.status(ConnectionStatus::TimedOut).await;

    let second = h.next_attempt().await;
    second.status(ConnectionStatus::Subscribed).await;
    settle().await;
    let status = h.session.status();
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.connection_mode, ConnectionMode::Push);
    assert_eq!(h.updaters.reconnecting.lock().unwrap().last(), Some(&false));

    // Unexpected close restarts the schedule at the base delay.
    let closed_at = Instant::now();
    second.status(ConnectionStatus::Closed).await;
    let third = h.next_attempt().await;
    assert_near(third.at.duration_since(closed_at).as_millis() as u64, 1000);
}

#[tokio::test(start_paused = true)]
async fn test_recovered_channel_cancels_pending_reconnect() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let attempt = h.next_attempt().await;

    attempt.status(ConnectionStatus::ChannelError).await;
    attempt.status(ConnectionStatus::Subscribed).await;
    settle().await;
    let status = h.session.status();
    assert_eq!(status.connection_mode, ConnectionMode::Push);
    assert_eq!(status.reconnect_attempts, 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.no_pending_attempt());
    assert!(h.unsubscribed().is_empty());
    assert_eq!(h.updaters.reconnecting.lock().unwrap().last(), Some(&false));

    // The surviving channel still delivers.
    attempt
        .event(EventKind::Update, main_record("job-1", "running", 3, None))
        .await;
    settle().await;
    assert_eq!(h.session.store().job.unwrap().status, JobStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_refused_subscribe_backs_off() {
    let mut h = Harness::new();
    h.transport.refuse.store(2, Ordering::SeqCst);
    h.session.start_tracking("job-1", "AAPL").await.unwrap();

    let status = h.session.status();
    assert_eq!(status.connection_mode, ConnectionMode::Reconnecting);
    assert_eq!(status.reconnect_attempts, 1);

    let accepted = h.next_attempt().await;
    let refused: Vec<_> = h
        .transport
        .refused
        .lock()
        .unwrap()
        .iter()
        .map(|t| h.offset_ms(*t))
        .collect();
    assert_eq!(refused.len(), 2);
    assert_near(refused[0], 0);
    assert_near(refused[1], 1000);
    assert_near(h.offset_ms(accepted.at), 3000);

    accepted.status(ConnectionStatus::Subscribed).await;
    settle().await;
    assert_eq!(h.mode(), ConnectionMode::Push);
    assert_eq!(h.session.status().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_at_start_still_subscribes() {
    let mut h = Harness::new();
    h.source.store_down.store(true, Ordering::SeqCst);
    h.session.start_tracking("job-1", "AAPL").await.unwrap();

    let attempt = h.next_attempt().await;
    assert_eq!(h.mode(), ConnectionMode::Push);
    assert!(h.session.store().job.is_none());

    h.source.store_down.store(false, Ordering::SeqCst);
    h.source.set_records(vec![
        main_record("job-1", "running", 2, None),
        sub_job_record("job-1", "sub-1", "news_agent", "running", 2),
    ]);
    attempt.status(ConnectionStatus::Subscribed).await;
    settle().await;

    let view = h.session.store();
    assert_eq!(view.job.unwrap().status, JobStatus::Running);
    assert_eq!(view.sub_jobs.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replaced_channel_close_is_not_a_problem() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let first = h.next_attempt().await;
    first.status(ConnectionStatus::Subscribed).await;
    settle().await;

    h.environment.went_online();
    let second = h.next_attempt().await;
    second.status(ConnectionStatus::Subscribed).await;
    first.status(ConnectionStatus::Closed).await;
    drop(first);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(h.no_pending_attempt());
    let status = h.session.status();
    assert_eq!(status.connection_mode, ConnectionMode::Push);
    assert_eq!(status.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_falls_back_to_polling() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();

    let held = exhaust_push(&mut h).await;
    let offsets: Vec<_> = held.iter().map(|a| h.offset_ms(a.at)).collect();
    for (actual, expected) in offsets.iter().zip([0, 1000, 3000, 7000, 15000, 31000]) {
        assert_near(*actual, expected);
    }
    assert_eq!(held.len(), 6);
    // No subscription stays open once polling drives the job.
    assert_eq!(h.unsubscribed().len(), held.len());
    assert_eq!(h.updaters.reconnecting.lock().unwrap().last(), Some(&false));

    tokio::time::sleep_until(h.start + Duration::from_millis(37_500)).await;
    let polls: Vec<_> = h
        .source
        .polls
        .lock()
        .unwrap()
        .iter()
        .map(|t| h.offset_ms(*t))
        .collect();
    assert_eq!(polls.len(), 2);
    assert_near(polls[0], 34_000);
    assert_near(polls[1], 37_000);

    h.source.set_status(json!({
        "job_id": "job-1",
        "status": "completed",
        "completed": true,
        "result": { "recommendation": "buy" },
        "updated_at": at(60),
    }));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        *h.observer.completes.lock().unwrap(),
        vec![Some(json!({ "recommendation": "buy" }))]
    );
    assert_eq!(h.mode(), ConnectionMode::Idle);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.source.poll_count(), 3);
    assert!(h.no_pending_attempt());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_cancels_pending_reconnect() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let attempt = h.next_attempt().await;
    attempt.status(ConnectionStatus::ChannelError).await;
    settle().await;
    assert_eq!(h.mode(), ConnectionMode::Reconnecting);

    let reads = h.source.record_reads.load(Ordering::SeqCst);
    h.session.cleanup();
    h.session.cleanup();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(h.no_pending_attempt());
    assert_eq!(h.source.record_reads.load(Ordering::SeqCst), reads);
    let view = h.session.store();
    assert!(view.job.is_none());
    assert!(view.sub_jobs.is_empty());
    let status = h.session.status();
    assert_eq!(status.active_job_id, None);
    assert_eq!(status.connection_mode, ConnectionMode::Idle);
    assert_eq!(status.reconnect_attempts, 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_visibility_recovers_from_polling() {
    let config = TrackerConfig {
        max_reconnect_attempts: 1,
        ..TrackerConfig::default()
    };
    let mut h = Harness::with_config(config);
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let _held = exhaust_push(&mut h).await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(h.source.poll_count(), 1);

    assert_eq!(h.environment.became_visible(), 1);
    let recovered = h.next_attempt().await;
    recovered.status(ConnectionStatus::Subscribed).await;
    settle().await;

    assert_eq!(h.mode(), ConnectionMode::Push);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.source.poll_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_visibility_while_subscribed_is_ignored() {
    let mut h = Harness::new();
    h.session.start_tracking("job-1", "AAPL").await.unwrap();
    let attempt = h.next_attempt().await;
    attempt.status(ConnectionStatus::Subscribed).await;
    settle().await;

    h.environment.became_hidden();
    h.environment.became_visible();
    h.environment.went_offline();
    settle().await;
    assert!(h.no_pending_attempt());

    h.environment.went_online();
    let resubscribed = h.next_attempt().await;
    assert_eq!(resubscribed.job_id, JobId::new("job-1"));
    assert_eq!(h.unsubscribed(), vec![attempt.id]);
}

// ============================================================================
// Polling only
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_missing_transport_polls_directly() {
    let source = Arc::new(MockSource::default());
    let observer = Arc::new(Recorder::default());
    let session = TrackingSession::builder(source.clone())
        .observer(observer.clone())
        .build()
        .unwrap();
    let start = Instant::now();

    source.set_status(json!({
        "status": "running",
        "steps": [{ "step": "fetch_prices", "timestamp": at(1), "status": "done" }],
        "updated_at": at(1),
    }));
    session.start_tracking("job-7", "TSLA").await.unwrap();
    assert_eq!(session.status().connection_mode, ConnectionMode::Polling);

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let job = session.store().job.expect("job from first poll");
    assert_eq!(job.job_id, JobId::new("job-7"));
    assert_eq!(job.steps.len(), 1);

    source.set_status(json!({
        "status": "failed",
        "error": "symbol delisted",
        "updated_at": at(2),
    }));
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(*observer.errors.lock().unwrap(), vec!["symbol delisted".to_string()]);
    let polls = source.polls.lock().unwrap().clone();
    assert_eq!(polls.len(), 2);
    assert_near(polls[1].duration_since(start).as_millis() as u64, 6_000);
}

fn polling_session(source: &Arc<MockSource>, observer: &Arc<Recorder>) -> TrackingSession {
    TrackingSession::builder(source.clone())
        .observer(observer.clone())
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_failed_status_query_keeps_polling() {
    let source = Arc::new(MockSource::default());
    let observer = Arc::new(Recorder::default());
    let session = polling_session(&source, &observer);

    source.status_down.store(true, Ordering::SeqCst);
    source.set_status(json!({ "status": "running", "updated_at": at(1) }));
    session.start_tracking("job-7", "TSLA").await.unwrap();

    tokio::time::sleep(Duration::from_millis(6_500)).await;
    assert_eq!(source.poll_count(), 2);
    assert!(session.store().job.is_none());
    assert_eq!(session.status().connection_mode, ConnectionMode::Polling);

    source.status_down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(source.poll_count(), 3);
    assert_eq!(session.store().job.unwrap().status, JobStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_reports_without_updated_at_keep_applying() {
    let source = Arc::new(MockSource::default());
    let observer = Arc::new(Recorder::default());
    let session = polling_session(&source, &observer);

    source.set_status(json!({ "status": "pending", "created_at": at(0) }));
    session.start_tracking("job-7", "TSLA").await.unwrap();
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(session.store().job.unwrap().status, JobStatus::Pending);

    source.set_status(json!({ "status": "running", "created_at": at(0) }));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(session.store().job.unwrap().status, JobStatus::Running);

    source.set_status(json!({
        "status": "completed",
        "completed": true,
        "result": { "target": 310 },
        "created_at": at(0),
    }));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
        *observer.completes.lock().unwrap(),
        vec![Some(json!({ "target": 310 }))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_is_rejected() {
    let config = TrackerConfig {
        poll_interval_ms: 0,
        ..TrackerConfig::default()
    };
    let result = TrackingSession::builder(Arc::new(MockSource::default()))
        .config(config)
        .build();
    assert!(matches!(result, Err(SyncError::Configuration(_))));
}
