//! The synchronized view of one tracked job.
//!
//! [`StateStore`] is the only place job state is written. Every write from the
//! push path, a poll tick, or a reconciliation read goes through
//! [`StateStore::set_job`] or [`StateStore::upsert_sub_job`], which enforce two
//! rules before anything changes:
//!
//! - **Terminal immutability**: once the job is `Completed` or `Failed`, no
//!   further write touches it.
//! - **Freshness**: a write whose `updated_at` is not strictly newer than the
//!   stored value is dropped.
//!
//! Rejected writes are not errors; superseded writes are expected when push
//! and reconciliation race. Each accepted write notifies at most one
//! [`JobObserver`] callback, and the terminal callback fires at most once per
//! job id for the lifetime of the store.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;

use crate::job::{Job, JobId, JobStatus, SubJob};

/// Mutation callbacks bound by the owning UI layer.
pub trait StateUpdaters: Send + Sync {
    fn set_job_status(&self, job: Option<&Job>);
    fn set_sub_jobs(&self, sub_jobs: &[SubJob]);
    fn set_workflow_result(&self, result: Option<&serde_json::Value>);
    fn set_is_running_research(&self, running: bool);

    /// Observability flag raised while a reconnect is pending.
    fn set_is_reconnecting(&self, _reconnecting: bool) {}
}

/// Optional observer callbacks. Every method defaults to a no-op.
pub trait JobObserver: Send + Sync {
    fn on_job_update(&self, _job: &Job) {}
    fn on_sub_job_update(&self, _sub_job: &SubJob) {}
    fn on_complete(&self, _result: Option<&serde_json::Value>) {}
    fn on_error(&self, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl JobObserver for NoopObserver {}

/// Snapshot of the store, published after every accepted write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreView {
    pub job: Option<Job>,
    pub sub_jobs: Vec<SubJob>,
}

/// What a write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Non-terminal change applied.
    Updated,
    /// The job reached `Completed`.
    Completed,
    /// The job reached `Failed` with this message.
    Failed(String),
    /// `updated_at` was not newer than the stored value.
    Stale,
    /// The stored job is already terminal.
    TerminalLocked,
    /// The status would move backwards.
    Regressed,
    /// The write is for a job this store is not tracking.
    Foreign,
}

impl StoreOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            StoreOutcome::Updated | StoreOutcome::Completed | StoreOutcome::Failed(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreOutcome::Completed | StoreOutcome::Failed(_))
    }
}

/// Holds the job and its ordered sub-jobs.
pub struct StateStore {
    tracked: Option<JobId>,
    job: Option<Job>,
    sub_jobs: Vec<SubJob>,
    positions: FxHashMap<String, usize>,
    settled: FxHashSet<JobId>,
    observer: Arc<dyn JobObserver>,
    updaters: Option<Arc<dyn StateUpdaters>>,
    view_tx: watch::Sender<StoreView>,
}

impl StateStore {
    pub fn new(observer: Arc<dyn JobObserver>) -> Self {
        let (view_tx, _) = watch::channel(StoreView::default());
        Self {
            tracked: None,
            job: None,
            sub_jobs: Vec::new(),
            positions: FxHashMap::default(),
            settled: FxHashSet::default(),
            observer,
            updaters: None,
            view_tx,
        }
    }

    pub fn set_updaters(&mut self, updaters: Arc<dyn StateUpdaters>) {
        self.updaters = Some(updaters);
    }

    pub fn updaters(&self) -> Option<&Arc<dyn StateUpdaters>> {
        self.updaters.as_ref()
    }

    /// Subscribe to published views.
    pub fn watch(&self) -> watch::Receiver<StoreView> {
        self.view_tx.subscribe()
    }

    pub fn tracked(&self) -> Option<&JobId> {
        self.tracked.as_ref()
    }

    /// Evict whatever was stored and start accepting writes for `job_id`.
    pub fn track(&mut self, job_id: JobId) {
        self.evict();
        self.tracked = Some(job_id);
    }

    /// Drop the stored job and sub-jobs.
    ///
    /// The set of jobs whose terminal callback already fired survives.
    pub fn evict(&mut self) {
        self.tracked = None;
        self.job = None;
        self.sub_jobs.clear();
        self.positions.clear();
        self.publish();
    }

    pub fn get(&self) -> StoreView {
        StoreView {
            job: self.job.clone(),
            sub_jobs: self.sub_jobs.clone(),
        }
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.job.as_ref().is_some_and(|j| j.status.is_terminal())
    }

    /// Replace the main job projection.
    pub fn set_job(&mut self, job: Job) -> StoreOutcome {
        if self.tracked.as_ref() != Some(&job.job_id) {
            return StoreOutcome::Foreign;
        }
        if let Some(current) = &self.job {
            if current.status.is_terminal() {
                return StoreOutcome::TerminalLocked;
            }
            if job.updated_at <= current.updated_at {
                return StoreOutcome::Stale;
            }
            if job.status.rank() < current.status.rank() {
                return StoreOutcome::Regressed;
            }
        }

        let job = self.job.insert(job).clone();
        self.publish();
        if let Some(updaters) = &self.updaters {
            updaters.set_job_status(Some(&job));
        }

        match job.status {
            JobStatus::Completed => {
                if let Some(updaters) = &self.updaters {
                    updaters.set_workflow_result(job.result.as_ref());
                    updaters.set_is_running_research(false);
                }
                if self.settled.insert(job.job_id.clone()) {
                    self.observer.on_complete(job.result.as_ref());
                }
                StoreOutcome::Completed
            }
            JobStatus::Failed => {
                let message = job.failure_message();
                if let Some(updaters) = &self.updaters {
                    updaters.set_is_running_research(false);
                }
                if self.settled.insert(job.job_id.clone()) {
                    self.observer.on_error(&message);
                }
                StoreOutcome::Failed(message)
            }
            JobStatus::Pending | JobStatus::Running => {
                self.observer.on_job_update(&job);
                StoreOutcome::Updated
            }
        }
    }

    /// Insert or replace one sub-job, keeping first-seen order.
    pub fn upsert_sub_job(&mut self, sub_job: SubJob) -> StoreOutcome {
        let outcome = self.apply_sub_job(sub_job);
        if outcome.is_accepted() {
            self.sub_jobs_changed();
        }
        outcome
    }

    /// Apply a batch of sub-jobs, returning how many were accepted.
    pub fn set_sub_jobs(&mut self, sub_jobs: Vec<SubJob>) -> usize {
        let accepted = sub_jobs
            .into_iter()
            .map(|sub_job| self.apply_sub_job(sub_job))
            .filter(StoreOutcome::is_accepted)
            .count();
        if accepted > 0 {
            self.sub_jobs_changed();
        }
        accepted
    }

    fn apply_sub_job(&mut self, sub_job: SubJob) -> StoreOutcome {
        if self.tracked.is_none() {
            return StoreOutcome::Foreign;
        }
        let existing = self.positions.get(&sub_job.sub_job_id).copied();
        match existing {
            Some(pos) => {
                let current = &self.sub_jobs[pos];
                if current.status.is_terminal() {
                    return StoreOutcome::TerminalLocked;
                }
                if sub_job.updated_at <= current.updated_at {
                    return StoreOutcome::Stale;
                }
                if sub_job.status.rank() < current.status.rank() {
                    return StoreOutcome::Regressed;
                }
                self.observer.on_sub_job_update(&sub_job);
                self.sub_jobs[pos] = sub_job;
            }
            None => {
                self.observer.on_sub_job_update(&sub_job);
                self.positions
                    .insert(sub_job.sub_job_id.clone(), self.sub_jobs.len());
                self.sub_jobs.push(sub_job);
            }
        }
        StoreOutcome::Updated
    }

    fn sub_jobs_changed(&self) {
        self.publish();
        if let Some(updaters) = &self.updaters {
            updaters.set_sub_jobs(&self.sub_jobs);
        }
    }

    fn publish(&self) {
        // No receivers is fine.
        self.view_tx.send_replace(self.get());
    }
}
