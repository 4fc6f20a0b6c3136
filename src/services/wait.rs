// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Cancellable timed waits with a countdown view.

use crate::error::SyncError;
use crate::time_utils::{format_deadline, format_mmss};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often an active wait reports its countdown.
const TICK: Duration = Duration::from_secs(1);

/// Upper bound on any single wait.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// Quota nearly used up, waiting for the reset reported in headers
    QuotaLow,
    /// 429 with a reset header
    RateLimitReset,
    /// 429 without a reset header: wait for the next hour boundary
    HourBoundary,
    /// Backoff after a transient request failure
    RetryBackoff,
    /// Backoff between token refresh attempts
    RefreshBackoff,
}

impl WaitReason {
    /// Quota waits are shown as a wall-clock deadline, retries as a countdown.
    pub fn is_quota_wait(&self) -> bool {
        matches!(
            self,
            WaitReason::QuotaLow | WaitReason::RateLimitReset | WaitReason::HourBoundary
        )
    }
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaitReason::QuotaLow => "rate limit nearly exhausted",
            WaitReason::RateLimitReset => "rate limited",
            WaitReason::HourBoundary => "rate limited until the hour resets",
            WaitReason::RetryBackoff => "retrying after a transient error",
            WaitReason::RefreshBackoff => "retrying token refresh",
        };
        f.write_str(s)
    }
}

/// A wait instruction: how long, and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitInstruction {
    pub duration: Duration,
    pub reason: WaitReason,
}

/// Read-only snapshot of an in-progress wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Countdown {
    pub remaining_seconds: u64,
    pub reason: WaitReason,
    /// Human-readable line, e.g. `Retrying in 01:05`
    pub display: String,
}

impl Countdown {
    pub fn new(remaining: Duration, reason: WaitReason, now: DateTime<Utc>) -> Self {
        // Round up so a wait never shows 00:00 while still pending.
        let remaining_seconds = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        let display = if reason.is_quota_wait() {
            format!(
                "Waiting until {} ({reason})",
                format_deadline(now, Duration::from_secs(remaining_seconds))
            )
        } else {
            format!("Retrying in {}", format_mmss(remaining_seconds))
        };
        Self {
            remaining_seconds,
            reason,
            display,
        }
    }
}

pub type CountdownCallback = Arc<dyn Fn(&Countdown) + Send + Sync>;

/// Everything a suspension needs: the job's cancellation token and an
/// optional countdown listener.
#[derive(Clone, Default)]
pub struct WaitContext {
    cancel: CancellationToken,
    on_tick: Option<CountdownCallback>,
}

impl WaitContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            on_tick: None,
        }
    }

    pub fn with_listener(mut self, on_tick: CountdownCallback) -> Self {
        self.on_tick = Some(on_tick);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast with `Cancelled` once the job has been cancelled.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `instruction.duration`, reporting the countdown every second.
    /// Returns `Err(Cancelled)` as soon as the token fires.
    pub async fn sleep(&self, instruction: WaitInstruction) -> Result<(), SyncError> {
        self.check()?;
        let deadline = Instant::now() + instruction.duration.min(MAX_WAIT);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            if let Some(on_tick) = &self.on_tick {
                on_tick(&Countdown::new(remaining, instruction.reason, Utc::now()));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(remaining.min(TICK)) => {}
            }
        }
    }
}
