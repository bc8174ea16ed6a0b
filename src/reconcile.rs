//! Full-snapshot reads from the authoritative store.
//!
//! A subscription only guarantees events emitted after it is confirmed, so
//! anything that happened between job start and confirmation is recovered
//! here. The session reads a snapshot once when tracking starts and again
//! after every confirmed (re)subscription.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::job::{Job, JobId, SubJob};
use crate::record::{JobRecord, JobUpdate};
use crate::source::JobSource;

/// A consistent view of one job as of the read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// `None` when only sub-job records exist so far.
    pub job: Option<Job>,
    pub sub_jobs: Vec<SubJob>,
}

/// Reads snapshots through a [`JobSource`].
#[derive(Clone)]
pub struct ReconciliationReader {
    source: Arc<dyn JobSource>,
}

impl ReconciliationReader {
    pub fn new(source: Arc<dyn JobSource>) -> Self {
        Self { source }
    }

    /// Fetch and classify every record for `job_id`.
    ///
    /// Fails with `StoreUnavailable` or `NotFound` as reported by the source.
    /// A source that answers with an empty list is also `NotFound`.
    /// Records that cannot be interpreted are skipped.
    pub async fn fetch_snapshot(&self, job_id: &JobId) -> SyncResult<Snapshot> {
        let records = self.source.fetch_records(job_id).await?;
        if records.is_empty() {
            return Err(SyncError::NotFound(job_id.to_string()));
        }
        debug!(%job_id, records = records.len(), "reconciliation read");
        Ok(assemble(records, job_id))
    }
}

fn assemble(mut records: Vec<JobRecord>, job_id: &JobId) -> Snapshot {
    // Records without a creation time sort first.
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let mut snapshot = Snapshot::default();
    for record in records {
        match JobUpdate::classify(record, job_id) {
            Ok(JobUpdate::SubJob(sub_job)) => snapshot.sub_jobs.push(sub_job),
            Ok(JobUpdate::MainJob(job)) => {
                // Duplicated main rows: keep the freshest.
                if snapshot
                    .job
                    .as_ref()
                    .is_none_or(|current| job.updated_at > current.updated_at)
                {
                    snapshot.job = Some(job);
                }
            }
            Err(e) => warn!(%job_id, "skipping unreadable record: {e}"),
        }
    }
    snapshot
}
