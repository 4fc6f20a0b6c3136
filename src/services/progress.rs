// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Progress events and the observers that render them.

use crate::models::{DateWindow, JobId, JobStatus, Metric, ProfileId, TaskOutcome};
use crate::services::wait::Countdown;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;

/// Lines kept per job by [`ProgressBoard`].
pub const BOARD_HISTORY: usize = 50;

/// Minimum spacing between console lines for one ongoing wait.
const CONSOLE_WAIT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    TaskStarted {
        metric: Metric,
        /// 1-based position within the job
        index: usize,
        total: usize,
        window: Option<DateWindow>,
    },
    TaskProgress {
        metric: Metric,
        window: DateWindow,
        records: usize,
    },
    TaskCompleted {
        metric: Metric,
        outcome: TaskOutcome,
    },
    Waiting(Countdown),
    JobTerminal {
        status: JobStatus,
    },
}

impl ProgressEvent {
    /// One human-readable line.
    pub fn describe(&self) -> String {
        match self {
            ProgressEvent::TaskStarted {
                metric,
                index,
                total,
                window,
            } => match window {
                Some(window) => format!("[{index}/{total}] Starting {metric} fetch from {window}"),
                None => format!("[{index}/{total}] {metric} is up to date"),
            },
            ProgressEvent::TaskProgress {
                metric,
                window,
                records,
            } => format!("{metric}: {records} records for {window}"),
            ProgressEvent::TaskCompleted { metric, outcome } => match outcome {
                TaskOutcome::Succeeded { records, .. } => {
                    format!("{metric}: done, {records} records saved")
                }
                TaskOutcome::Failed { message, .. } => format!("{metric}: FAILED: {message}"),
                TaskOutcome::Skipped { reason } => format!("{metric}: skipped ({reason})"),
                TaskOutcome::Pending | TaskOutcome::Running => format!("{metric}: {outcome:?}"),
            },
            ProgressEvent::Waiting(countdown) => countdown.display.clone(),
            ProgressEvent::JobTerminal { status } => format!("Job finished: {status}"),
        }
    }
}

/// Receives progress from running jobs. Called inline on the job's task, so
/// implementations must not block.
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, profile: &ProfileId, job: JobId, event: &ProgressEvent);

    /// The orchestrator no longer tracks `job`; drop any state kept for it.
    fn on_job_evicted(&self, _job: JobId) {}
}

/// Prints progress lines for the CLI.
#[derive(Default)]
pub struct ConsoleObserver {
    /// Remaining seconds last printed for each job's current wait
    last_wait: DashMap<JobId, u64>,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn should_print_wait(&self, job: JobId, remaining: u64) -> bool {
        let mut last = self.last_wait.entry(job).or_insert(u64::MAX);
        // A larger value than last time means a new wait started.
        let print = *last == u64::MAX
            || remaining > *last
            || last.saturating_sub(remaining) >= CONSOLE_WAIT_INTERVAL_SECS;
        if print {
            *last = remaining;
        }
        print
    }
}

impl SyncObserver for ConsoleObserver {
    fn on_event(&self, profile: &ProfileId, job: JobId, event: &ProgressEvent) {
        if let ProgressEvent::Waiting(countdown) = event {
            if !self.should_print_wait(job, countdown.remaining_seconds) {
                return;
            }
        } else {
            self.last_wait.remove(&job);
        }
        println!("[{profile}] {}", event.describe());
    }

    fn on_job_evicted(&self, job: JobId) {
        self.last_wait.remove(&job);
    }
}

#[derive(Debug, Default)]
struct BoardEntry {
    lines: VecDeque<String>,
    countdown: Option<Countdown>,
}

/// Keeps recent progress lines and the live countdown per job, for polling
/// from the web layer.
#[derive(Default)]
pub struct ProgressBoard {
    entries: DashMap<JobId, BoardEntry>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self, job: JobId) -> Vec<String> {
        self.entries
            .get(&job)
            .map(|e| e.lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn countdown(&self, job: JobId) -> Option<Countdown> {
        self.entries.get(&job).and_then(|e| e.countdown.clone())
    }

    fn push_line(entry: &mut BoardEntry, line: String) {
        if entry.lines.len() == BOARD_HISTORY {
            entry.lines.pop_front();
        }
        entry.lines.push_back(line);
    }
}

impl SyncObserver for ProgressBoard {
    fn on_event(&self, _profile: &ProfileId, job: JobId, event: &ProgressEvent) {
        let mut entry = self.entries.entry(job).or_default();
        match event {
            ProgressEvent::Waiting(countdown) => {
                // Only the first tick of a wait becomes a line.
                let is_new = entry.countdown.as_ref().map_or(true, |c| {
                    c.reason != countdown.reason
                        || countdown.remaining_seconds > c.remaining_seconds
                });
                if is_new {
                    Self::push_line(&mut entry, event.describe());
                }
                entry.countdown = Some(countdown.clone());
            }
            _ => {
                entry.countdown = None;
                Self::push_line(&mut entry, event.describe());
            }
        }
    }

    fn on_job_evicted(&self, job: JobId) {
        self.entries.remove(&job);
    }
}
