//! Track a simulated job end to end.
//!
//! The in-memory backend below plays both server roles: it answers reads
//! like the authoritative store and pushes row changes like the realtime
//! service. Halfway through, it drops the push connection so the session's
//! reconnect path shows up in the logs (`RUST_LOG=job_sync=debug`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use job_sync::{
    ConnectionMode, ConnectionStatus, EventKind, Job, JobId, JobObserver, JobRecord, JobSource,
    StatusReport, SubJob, Subscription, SubscriptionId, SubscriptionTransport, SyncError,
    SyncResult, TrackerConfig, TrackingSession, TransportMessage,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const JOB_ID: &str = "job-2041";
const SYMBOL: &str = "NVDA";

/// In-memory job table with push fan-out.
#[derive(Default)]
struct MockBackend {
    rows: Mutex<Vec<JobRecord>>,
    subscribers: Mutex<Vec<mpsc::Sender<TransportMessage>>>,
    next_id: AtomicU64,
}

impl MockBackend {
    /// Write a row and push it to every subscriber.
    fn write(&self, kind: EventKind, record: JobRecord) {
        {
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|r| r.sub_job_id != record.sub_job_id);
            rows.push(record.clone());
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| {
            tx.try_send(TransportMessage::Event {
                kind,
                record: record.clone(),
            })
            .is_ok()
        });
    }

    /// Simulate the realtime service dropping every connection.
    fn drop_connections(&self) {
        for tx in self.subscribers.lock().unwrap().drain(..) {
            let _ = tx.try_send(TransportMessage::Status(ConnectionStatus::ChannelError));
        }
    }

    fn row(&self, sub_job: Option<&str>, name: &str, status: &str) -> JobRecord {
        let result = (status == "completed" && sub_job.is_none())
            .then(|| json!({ "recommendation": "buy", "confidence": 0.81 }));
        JobRecord {
            id: None,
            main_job_id: Some(JOB_ID.to_string()),
            sub_job_id: sub_job.map(str::to_string),
            job_name: Some(name.to_string()),
            symbol: Some(SYMBOL.to_string()),
            status: status.to_string(),
            error: None,
            result: None,
            metadata: json!({ "result": result }),
            created_at: Some(Utc::now()),
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl JobSource for MockBackend {
    async fn fetch_records(&self, job_id: &JobId) -> SyncResult<Vec<JobRecord>> {
        let rows = self.rows.lock().unwrap().clone();
        if rows.is_empty() {
            return Err(SyncError::NotFound(job_id.to_string()));
        }
        Ok(rows)
    }

    async fn fetch_status(&self, job_id: &JobId, symbol: &str) -> SyncResult<StatusReport> {
        let rows = self.rows.lock().unwrap();
        let Some(main) = rows.iter().find(|r| r.sub_job_id.is_none()) else {
            return Ok(StatusReport {
                message: Some(format!("no job found for {symbol}")),
                ..StatusReport::default()
            });
        };
        Ok(StatusReport {
            job_id: Some(job_id.to_string()),
            symbol: Some(symbol.to_string()),
            status: Some(main.status.clone()),
            completed: main.status == "completed",
            result: main.metadata.get("result").cloned(),
            updated_at: Some(main.updated_at),
            ..StatusReport::default()
        })
    }
}

#[async_trait]
impl SubscriptionTransport for MockBackend {
    async fn subscribe(&self, _job_id: &JobId) -> SyncResult<Subscription> {
        let (tx, rx) = mpsc::channel(32);
        let _ = tx.try_send(TransportMessage::Status(ConnectionStatus::Subscribed));
        self.subscribers.lock().unwrap().push(tx);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        Ok(Subscription::new(id, rx))
    }

    async fn unsubscribe(&self, _id: SubscriptionId) {}
}

struct PrintingObserver;

impl JobObserver for PrintingObserver {
    fn on_job_update(&self, job: &Job) {
        println!("job     {} -> {}", job.job_id, job.status);
    }

    fn on_sub_job_update(&self, sub_job: &SubJob) {
        println!("stage   {:<20} {}", sub_job.name, sub_job.status);
    }

    fn on_complete(&self, result: Option<&serde_json::Value>) {
        println!("done    {}", result.map(|r| r.to_string()).unwrap_or_default());
    }

    fn on_error(&self, message: &str) {
        println!("failed  {message}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("job_sync=info")),
        )
        .init();

    let backend = Arc::new(MockBackend::default());
    let session = TrackingSession::builder(backend.clone())
        .transport(backend.clone())
        .observer(Arc::new(PrintingObserver))
        .config(TrackerConfig::from_env()?)
        .build()?;

    session.start_tracking(JOB_ID, SYMBOL).await?;
    let pause = || tokio::time::sleep(Duration::from_millis(200));

    backend.write(EventKind::Insert, backend.row(None, "main_flow", "running"));
    pause().await;
    for (id, name) in [("s1", "news_agent"), ("s2", "quantitative_agent")] {
        backend.write(EventKind::Insert, backend.row(Some(id), name, "running"));
        pause().await;
    }

    backend.drop_connections();
    // The stage finishes while nobody is subscribed; reconciliation on
    // resubscribe picks it up.
    pause().await;
    backend.write(EventKind::Update, backend.row(Some("s1"), "news_agent", "completed"));

    let mut status = session.watch_status();
    status
        .wait_for(|s| s.connection_mode == ConnectionMode::Push && s.reconnect_attempts == 0)
        .await?;
    println!("push    recovered");

    backend.write(
        EventKind::Update,
        backend.row(Some("s2"), "quantitative_agent", "completed"),
    );
    pause().await;
    backend.write(EventKind::Update, backend.row(None, "main_flow", "completed"));

    status
        .wait_for(|s| s.connection_mode == ConnectionMode::Idle)
        .await?;

    let view = session.store();
    println!();
    println!("Final:");
    if let Some(job) = &view.job {
        println!("  {} {} ({} stages)", job.job_id, job.status, view.sub_jobs.len());
    }
    for sub_job in &view.sub_jobs {
        println!("  - {:<20} {}", sub_job.name, sub_job.status);
    }

    Ok(())
}
