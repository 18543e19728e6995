//! Bookkeeping for long-running passes.
//!
//! One job runs at a time. Progress and phase are published through a
//! mutex-guarded [`JobStatus`] that readers can poll while the job holds
//! the state lock. Cancellation is cooperative: [`Jobs::stop`] raises a flag
//! that the running job checks at its batch boundaries.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::engine::ClusterReport;
use crate::error::{IdentityError, IdentityResult};
use crate::recluster::ReclusterStats;
use crate::scan::ScanReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Cluster,
    Recluster,
    Scan,
}

/// How the last job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobOutcome {
    Clustered(ClusterReport),
    Reclustered(ReclusterStats),
    Scanned(ScanReport),
    Cancelled,
    Failed { message: String },
}

/// Snapshot of the current or last job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub kind: Option<JobKind>,
    pub running: bool,
    /// Fraction done, in `[0, 1]`.
    pub progress: f32,
    pub phase: String,
    pub processed: usize,
    pub total: usize,
    /// Set once the job ends.
    pub outcome: Option<JobOutcome>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            kind: None,
            running: false,
            progress: 0.0,
            phase: "idle".to_string(),
            processed: 0,
            total: 0,
            outcome: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Jobs {
    status: Mutex<JobStatus>,
    stop: AtomicBool,
}

impl Jobs {
    pub fn snapshot(&self) -> JobStatus {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.lock().running
    }

    /// Claims the job slot. Fails if another job is running.
    pub fn begin(&self, kind: JobKind) -> IdentityResult<()> {
        let mut status = self.status.lock();
        if status.running {
            let current = status.kind.map(|k| format!("{k:?}")).unwrap_or_default();
            return Err(IdentityError::InvalidState(format!(
                "a {} job is already running",
                current.to_lowercase()
            )));
        }
        *status = JobStatus {
            kind: Some(kind),
            running: true,
            phase: "starting".to_string(),
            ..Default::default()
        };
        self.stop.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Takes ownership of a slot claimed with [`Jobs::begin`]. Dropping the
    /// guard without finishing marks the job failed.
    pub fn adopt(&self) -> JobGuard<'_> {
        JobGuard {
            jobs: self,
            finished: false,
        }
    }

    /// Asks the running job to stop. Returns false if nothing is running.
    pub fn stop(&self) -> bool {
        let running = self.is_running();
        if running {
            self.stop.store(true, Ordering::SeqCst);
        }
        running
    }

    fn end(&self, outcome: JobOutcome) {
        let mut status = self.status.lock();
        let phase = match &outcome {
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Scanned(report) if report.cancelled => "cancelled",
            _ => "done",
        };
        if phase == "done" {
            status.progress = 1.0;
        }
        status.running = false;
        status.phase = phase.to_string();
        status.outcome = Some(outcome);
        self.stop.store(false, Ordering::SeqCst);
    }
}

/// Handle held by the code running a job.
pub(crate) struct JobGuard<'a> {
    jobs: &'a Jobs,
    finished: bool,
}

impl JobGuard<'_> {
    pub fn phase(&self, phase: &str) {
        let mut status = self.jobs.status.lock();
        status.phase = phase.to_string();
        status.progress = 0.0;
        status.processed = 0;
        status.total = 0;
    }

    pub fn report(&self, progress: f32, processed: usize, total: usize) {
        let mut status = self.jobs.status.lock();
        status.progress = progress.clamp(0.0, 1.0);
        status.processed = processed;
        status.total = total;
    }

    /// Reports `processed` out of `total` as linear progress.
    pub fn count(&self, processed: usize, total: usize) {
        let progress = if total == 0 {
            1.0
        } else {
            processed as f32 / total as f32
        };
        self.report(progress, processed, total);
    }

    pub fn stop_requested(&self) -> bool {
        self.jobs.stop.load(Ordering::SeqCst)
    }

    pub fn finish(mut self, outcome: JobOutcome) {
        self.finished = true;
        self.jobs.end(outcome);
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.jobs.end(JobOutcome::Failed {
                message: "job ended without a result".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_job_at_a_time() {
        let jobs = Jobs::default();
        jobs.begin(JobKind::Cluster).unwrap();
        let err = jobs.begin(JobKind::Scan).unwrap_err();
        assert!(err.to_string().contains("cluster job is already running"));

        jobs.adopt().finish(JobOutcome::Cancelled);
        jobs.begin(JobKind::Scan).unwrap();
    }

    #[test]
    fn stop_only_when_running() {
        let jobs = Jobs::default();
        assert!(!jobs.stop());

        jobs.begin(JobKind::Recluster).unwrap();
        let guard = jobs.adopt();
        assert!(!guard.stop_requested());
        assert!(jobs.stop());
        assert!(guard.stop_requested());

        guard.finish(JobOutcome::Cancelled);
        let status = jobs.snapshot();
        assert!(!status.running);
        assert_eq!(status.phase, "cancelled");
        assert!(!jobs.stop.load(Ordering::SeqCst));
    }

    #[test]
    fn progress_and_phase_are_published() {
        let jobs = Jobs::default();
        jobs.begin(JobKind::Scan).unwrap();
        let guard = jobs.adopt();
        guard.phase("extracting");
        guard.count(3, 4);
        let status = jobs.snapshot();
        assert_eq!(status.phase, "extracting");
        assert_eq!(status.processed, 3);
        assert!((status.progress - 0.75).abs() < 1e-6);

        guard.finish(JobOutcome::Scanned(ScanReport::default()));
        let status = jobs.snapshot();
        assert_eq!(status.progress, 1.0);
        assert_eq!(status.phase, "done");
    }

    #[test]
    fn dropped_guard_marks_failure() {
        let jobs = Jobs::default();
        jobs.begin(JobKind::Cluster).unwrap();
        drop(jobs.adopt());
        let status = jobs.snapshot();
        assert!(!status.running);
        assert!(matches!(status.outcome, Some(JobOutcome::Failed { .. })));
    }
}
