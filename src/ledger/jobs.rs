use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::scanner::{
    ChannelScanReport, CommunityScanReport, ReconciliationScanner, ScanControl, ScanMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanTarget {
    Channel { community_id: i64, channel_id: i64 },
    Community { community_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ScanReport {
    Channel(ChannelScanReport),
    Community(CommunityScanReport),
}

impl ScanReport {
    fn cancelled(&self) -> bool {
        match self {
            ScanReport::Channel(report) => report.cancelled,
            ScanReport::Community(report) => report.cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub target: ScanTarget,
    pub mode: ScanMode,
    pub status: ScanStatus,
    pub cutoff: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub report: Option<ScanReport>,
    pub error: Option<String>,
}

struct JobEntry {
    job: ScanJob,
    control: ScanControl,
}

const FINISHED_JOB_RETENTION: usize = 64;

/// Background scans started from the operator API. Finished jobs beyond the
/// retention limit are evicted oldest first whenever a new job starts.
pub struct ScanRegistry {
    jobs: RwLock<HashMap<Uuid, JobEntry>>,
    retention: usize,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::with_retention(FINISHED_JOB_RETENTION)
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn start(
        self: &Arc<Self>,
        scanner: Arc<ReconciliationScanner>,
        target: ScanTarget,
        mode: ScanMode,
    ) -> ScanJob {
        let now = Utc::now();
        let control = ScanControl::new();
        let job = ScanJob {
            id: Uuid::new_v4(),
            target,
            mode,
            status: ScanStatus::Running,
            cutoff: now,
            started_at: now,
            finished_at: None,
            report: None,
            error: None,
        };

        {
            let mut jobs = self.jobs.write();
            evict_finished(&mut jobs, self.retention);
            jobs.insert(
                job.id,
                JobEntry {
                    job: job.clone(),
                    control: control.clone(),
                },
            );
        }
        info!("scan job started job_id={} target={:?} mode={:?}", job.id, target, mode);

        let registry = self.clone();
        let job_id = job.id;
        let cutoff = job.cutoff;
        tokio::spawn(async move {
            let result = match target {
                ScanTarget::Channel {
                    community_id,
                    channel_id,
                } => scanner
                    .scan_channel(community_id, channel_id, mode, cutoff, &control)
                    .await
                    .map(ScanReport::Channel),
                ScanTarget::Community { community_id } => scanner
                    .scan_community_until(community_id, mode, cutoff, &control)
                    .await
                    .map(ScanReport::Community),
            };

            let mut jobs = registry.jobs.write();
            let Some(entry) = jobs.get_mut(&job_id) else {
                return;
            };
            entry.job.finished_at = Some(Utc::now());
            match result {
                Ok(report) => {
                    entry.job.status = if report.cancelled() {
                        ScanStatus::Cancelled
                    } else {
                        ScanStatus::Completed
                    };
                    entry.job.report = Some(report);
                    info!("scan job finished job_id={} status={:?}", job_id, entry.job.status);
                }
                Err(err) => {
                    error!("scan job failed job_id={}: {}", job_id, err);
                    entry.job.status = ScanStatus::Failed;
                    entry.job.error = Some(err.to_string());
                }
            }
        });

        job
    }

    pub fn get(&self, id: &Uuid) -> Option<ScanJob> {
        self.jobs.read().get(id).map(|entry| entry.job.clone())
    }

    pub fn list(&self) -> Vec<ScanJob> {
        let mut jobs: Vec<ScanJob> = self
            .jobs
            .read()
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    /// Requests cancellation. Returns false for unknown or already finished jobs.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let jobs = self.jobs.read();
        match jobs.get(id) {
            Some(entry) if entry.job.status == ScanStatus::Running => {
                entry.control.cancel();
                true
            }
            _ => false,
        }
    }
}

impl Default for ScanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_finished(jobs: &mut HashMap<Uuid, JobEntry>, retention: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter_map(|entry| entry.job.finished_at.map(|at| (at, entry.job.id)))
        .collect();
    if finished.len() <= retention {
        return;
    }
    finished.sort();
    let excess = finished.len() - retention;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
    debug!("evicted finished scan jobs count={}", excess);
}
