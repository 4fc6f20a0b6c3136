// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fetch job state machine.
//!
//! A job moves `pending → running → {succeeded | partial | failed | cancelled}`.
//! Terminal states have no outgoing transitions.

use crate::error::{ErrorKind, SyncError};
use crate::models::{DateWindow, Metric, ProfileId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Partial | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of one metric task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    Pending,
    Running,
    Succeeded {
        /// Records upserted into the metric store
        records: usize,
        /// Date windows requested
        windows: usize,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
    /// Not attempted (job cancelled or aborted before reaching this task).
    Skipped {
        reason: String,
    },
}

impl TaskOutcome {
    pub fn failed(err: &SyncError) -> Self {
        TaskOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, TaskOutcome::Pending | TaskOutcome::Running)
    }
}

/// Per-metric breakdown of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub metric: Metric,
    /// Window actually requested (after incremental resolution)
    pub window: Option<DateWindow>,
    pub outcome: TaskOutcome,
}

/// One synchronization attempt for one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchJob {
    pub id: JobId,
    pub profile_id: ProfileId,
    pub status: JobStatus,
    /// Explicit range requested, `None` for incremental
    pub date_range: Option<DateWindow>,
    pub tasks: Vec<TaskReport>,
    /// Job-level failure (auth), if any
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FetchJob {
    pub fn new(profile_id: ProfileId, metrics: &[Metric], date_range: Option<DateWindow>) -> Self {
        let ordered: Vec<Metric> = Metric::ALL
            .into_iter()
            .filter(|m| metrics.contains(m))
            .collect();

        Self {
            id: JobId::new(),
            profile_id,
            status: JobStatus::Pending,
            date_range,
            tasks: ordered
                .into_iter()
                .map(|metric| TaskReport {
                    metric,
                    window: None,
                    outcome: TaskOutcome::Pending,
                })
                .collect(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// `pending → running`. Returns false if the job already left `pending`.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn task_mut(&mut self, metric: Metric) -> Option<&mut TaskReport> {
        self.tasks.iter_mut().find(|t| t.metric == metric)
    }

    /// Move to the terminal state implied by the task outcomes.
    ///
    /// Unresolved tasks become `skipped`. A job-fatal error yields `failed`,
    /// a cancellation `cancelled`; otherwise the worst task outcome decides.
    /// Returns false if the job was already terminal.
    pub fn conclude(&mut self, cancelled: bool, fatal: Option<&SyncError>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        let skip_reason = match (fatal, cancelled) {
            (Some(err), _) => format!("aborted: {err}"),
            (None, true) => "cancelled".to_string(),
            (None, false) => "not run".to_string(),
        };
        for task in &mut self.tasks {
            if !task.outcome.is_resolved() {
                task.outcome = TaskOutcome::Skipped {
                    reason: skip_reason.clone(),
                };
            }
        }

        let succeeded = self
            .tasks
            .iter()
            .filter(|t| matches!(t.outcome, TaskOutcome::Succeeded { .. }))
            .count();
        let failed = self
            .tasks
            .iter()
            .filter(|t| matches!(t.outcome, TaskOutcome::Failed { .. }))
            .count();

        self.status = if let Some(err) = fatal {
            self.error = Some(err.to_string());
            JobStatus::Failed
        } else if cancelled {
            JobStatus::Cancelled
        } else if failed == 0 {
            JobStatus::Succeeded
        } else if succeeded == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        };
        self.finished_at = Some(Utc::now());
        true
    }

    /// Metrics whose task failed, for targeted re-runs.
    pub fn failed_metrics(&self) -> Vec<Metric> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.outcome, TaskOutcome::Failed { .. }))
            .map(|t| t.metric)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> FetchJob {
        FetchJob::new(ProfileId::parse("alice").unwrap(), &Metric::ALL, None)
    }

    fn succeed(job: &mut FetchJob, metric: Metric) {
        job.task_mut(metric).unwrap().outcome = TaskOutcome::Succeeded {
            records: 1,
            windows: 1,
        };
    }

    #[test]
    fn test_tasks_follow_fixed_order() {
        let job = FetchJob::new(
            ProfileId::parse("alice").unwrap(),
            &[Metric::Sleep, Metric::Steps, Metric::Sleep],
            None,
        );
        let metrics: Vec<Metric> = job.tasks.iter().map(|t| t.metric).collect();
        assert_eq!(metrics, vec![Metric::Steps, Metric::Sleep]);
    }

    #[test]
    fn test_all_succeeded() {
        let mut job = job();
        assert!(job.start());
        for metric in Metric::ALL {
            succeed(&mut job, metric);
        }
        assert!(job.conclude(false, None));
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[test]
    fn test_mixed_outcomes_are_partial() {
        let mut job = job();
        job.start();
        succeed(&mut job, Metric::Steps);
        succeed(&mut job, Metric::RestingHeartRate);
        succeed(&mut job, Metric::Sleep);
        job.task_mut(Metric::Hrv).unwrap().outcome =
            TaskOutcome::failed(&SyncError::HttpPermanentFailure {
                status: 403,
                body: "insufficient_scope".to_string(),
            });

        job.conclude(false, None);
        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.failed_metrics(), vec![Metric::Hrv]);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = job();
        job.start();
        job.conclude(true, None);
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job
            .tasks
            .iter()
            .all(|t| matches!(t.outcome, TaskOutcome::Skipped { .. })));

        assert!(!job.conclude(false, None));
        assert!(!job.start());
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_fatal_error_fails_job() {
        let mut job = job();
        job.start();
        succeed(&mut job, Metric::Steps);
        let err = SyncError::ReauthorizationRequired("invalid_grant".to_string());
        job.conclude(false, Some(&err));
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("invalid_grant"));
    }
}
