//! Fixed-interval polling fallback.
//!
//! Runs only when push is unavailable or its retry budget is spent. The
//! session guarantees a poll loop and a push subscription never drive the
//! same job at once; this type only guarantees at most one poll loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::job::JobId;
use crate::record::StatusReport;
use crate::source::JobSource;

struct ActivePoll {
    job_id: JobId,
    task: JoinHandle<()>,
}

/// Owns the poll loop for one session.
pub struct PollingFallback {
    source: Arc<dyn JobSource>,
    period: Duration,
    active: Option<ActivePoll>,
}

impl PollingFallback {
    pub fn new(source: Arc<dyn JobSource>, period: Duration) -> Self {
        Self {
            source,
            period,
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.task.is_finished())
    }

    /// The job being polled, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        self.active.as_ref().map(|a| &a.job_id)
    }

    /// Start polling `job_id`, replacing any running loop.
    ///
    /// The first query happens one period after the call. Before each query
    /// the loop exits if `still_active` no longer accepts the job; after each
    /// query it exits if `deliver` returns `false`.
    pub fn start<A, D>(&mut self, job_id: JobId, symbol: String, still_active: A, deliver: D)
    where
        A: Fn(&JobId) -> bool + Send + 'static,
        D: Fn(&JobId, SyncResult<StatusReport>) -> bool + Send + 'static,
    {
        self.stop();
        info!(%job_id, period_ms = self.period.as_millis() as u64, "polling started");

        let source = self.source.clone();
        let period = self.period;
        let poll_job = job_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !still_active(&poll_job) {
                    debug!(job_id = %poll_job, "poll loop outlived its job");
                    return;
                }
                let report = source.fetch_status(&poll_job, &symbol).await;
                if !deliver(&poll_job, report) {
                    return;
                }
            }
        });
        self.active = Some(ActivePoll { job_id, task });
    }

    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
            debug!(job_id = %active.job_id, "polling stopped");
        }
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::record::JobRecord;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingSource {
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl JobSource for CountingSource {
        async fn fetch_records(&self, job_id: &JobId) -> SyncResult<Vec<JobRecord>> {
            Err(SyncError::NotFound(job_id.to_string()))
        }

        async fn fetch_status(&self, _job_id: &JobId, symbol: &str) -> SyncResult<StatusReport> {
            self.calls.lock().unwrap().push(Instant::now());
            Ok(StatusReport {
                symbol: Some(symbol.to_string()),
                ..StatusReport::default()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_fixed_interval() {
        let source = Arc::new(CountingSource::default());
        let mut polling = PollingFallback::new(source.clone(), Duration::from_secs(3));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let started = Instant::now();
        polling.start(
            "job-1".into(),
            "AAPL".into(),
            |_| true,
            move |_, report| tx.send(report).is_ok(),
        );
        assert!(polling.is_running());

        for _ in 0..3 {
            let report = rx.recv().await.unwrap().unwrap();
            assert_eq!(report.symbol.as_deref(), Some("AAPL"));
        }
        polling.stop();
        assert!(!polling.is_running());

        let offsets: Vec<_> = source
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(started).as_millis())
            .collect();
        assert_eq!(offsets, vec![3000, 6000, 9000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_job_no_longer_active() {
        let source = Arc::new(CountingSource::default());
        let mut polling = PollingFallback::new(source.clone(), Duration::from_secs(3));
        let active = Arc::new(AtomicBool::new(true));

        let flag = active.clone();
        polling.start(
            "job-1".into(),
            "AAPL".into(),
            move |_| flag.load(Ordering::SeqCst),
            |_, _| true,
        );
        tokio::time::sleep(Duration::from_millis(3500)).await;
        active.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(source.calls.lock().unwrap().len(), 1);
        assert!(!polling.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_loop() {
        let source = Arc::new(CountingSource::default());
        let mut polling = PollingFallback::new(source.clone(), Duration::from_secs(3));
        polling.start("job-1".into(), "AAPL".into(), |_| true, |_, _| true);
        polling.start("job-2".into(), "MSFT".into(), |_| true, |_, _| true);
        assert_eq!(polling.job_id(), Some(&JobId::new("job-2")));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(source.calls.lock().unwrap().len(), 1);
    }
}
