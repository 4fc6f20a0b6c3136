// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-profile quota tracking driven by `Fitbit-Rate-Limit-*` headers.
//!
//! Every outbound call asks [`RateGovernor::before_request`] first and reports
//! the response headers to [`RateGovernor::after_response`]. State is
//! in-memory only; a fresh process treats its first call as discovery.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::ProfileId;
use crate::services::backoff::header_delay;
use crate::services::wait::{Countdown, WaitContext, WaitInstruction, WaitReason, MAX_WAIT};
use crate::time_utils::until_next_hour;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::Instant;

pub const HEADER_LIMIT: &str = "fitbit-rate-limit-limit";
pub const HEADER_REMAINING: &str = "fitbit-rate-limit-remaining";
pub const HEADER_RESET: &str = "fitbit-rate-limit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Last observed quota for one profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitState {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Seconds until reset, relative to `observed_at`
    pub reset_after: Option<Duration>,
    pub observed_at: Instant,
    /// Wall clock at `observed_at`, for the hourly window boundary
    pub observed_utc: DateTime<Utc>,
}

impl RateLimitState {
    /// `None` when the response carries no rate-limit headers at all.
    pub fn from_headers(
        headers: &HeaderMap,
        observed_at: Instant,
        observed_utc: DateTime<Utc>,
    ) -> Option<Self> {
        let limit = header_u32(headers, HEADER_LIMIT);
        let remaining = header_u32(headers, HEADER_REMAINING);
        let reset_after = header_secs(headers, HEADER_RESET);
        if limit.is_none() && remaining.is_none() && reset_after.is_none() {
            return None;
        }
        Some(Self {
            limit,
            remaining,
            reset_after,
            observed_at,
            observed_utc,
        })
    }

    /// Time left until the quota resets, recomputed against `now`.
    pub fn reset_in(&self, now: Instant) -> Option<Duration> {
        self.reset_after
            .map(|reset| reset.saturating_sub(now.saturating_duration_since(self.observed_at)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Wait(WaitInstruction),
}

#[derive(Debug, Clone, Copy)]
struct ActiveWait {
    deadline: Instant,
    reason: WaitReason,
}

/// Owns `RateLimitState` for every profile.
pub struct RateGovernor {
    policy: SyncConfig,
    states: DashMap<ProfileId, RateLimitState>,
    waits: DashMap<ProfileId, ActiveWait>,
}

impl RateGovernor {
    pub fn new(policy: SyncConfig) -> Self {
        Self {
            policy,
            states: DashMap::new(),
            waits: DashMap::new(),
        }
    }

    pub fn state(&self, profile: &ProfileId) -> Option<RateLimitState> {
        self.states.get(profile).map(|s| *s)
    }

    pub fn before_request(&self, profile: &ProfileId) -> Decision {
        self.before_request_at(profile, Instant::now())
    }

    /// Throttle when the quota is spent, or nearly spent with the reset close.
    pub fn before_request_at(&self, profile: &ProfileId, now: Instant) -> Decision {
        let Some(state) = self.state(profile) else {
            return Decision::Proceed;
        };
        let Some(remaining) = state.remaining else {
            return Decision::Proceed;
        };
        let Some(reset_in) = state.reset_in(now) else {
            return self.exhausted_until_hour(profile, &state, now);
        };
        if reset_in.is_zero() {
            return Decision::Proceed;
        }

        let exhausted = remaining == 0;
        let nearly = remaining <= self.policy.preemptive_remaining_threshold
            && reset_in <= self.policy.preemptive_window;
        if exhausted || nearly {
            tracing::info!(
                profile_id = %profile,
                remaining,
                wait_secs = reset_in.as_secs(),
                "Throttling before request"
            );
            return Decision::Wait(WaitInstruction {
                duration: reset_in + self.policy.reset_buffer,
                reason: WaitReason::QuotaLow,
            });
        }
        Decision::Proceed
    }

    /// Quota spent but no reset reported: hold off until the hour that was
    /// current at observation time has rolled over.
    fn exhausted_until_hour(
        &self,
        profile: &ProfileId,
        state: &RateLimitState,
        now: Instant,
    ) -> Decision {
        if state.remaining != Some(0) {
            return Decision::Proceed;
        }
        let rollover = state.observed_at + until_next_hour(&state.observed_utc);
        let wait = rollover.saturating_duration_since(now);
        if wait.is_zero() {
            return Decision::Proceed;
        }
        tracing::info!(
            profile_id = %profile,
            wait_secs = wait.as_secs(),
            "Quota exhausted without reset, waiting for the hour"
        );
        Decision::Wait(WaitInstruction {
            duration: wait + self.policy.hour_boundary_buffer,
            reason: WaitReason::HourBoundary,
        })
    }

    /// Record the rate-limit headers of any response, success or failure.
    pub fn after_response(&self, profile: &ProfileId, headers: &HeaderMap) {
        self.after_response_at(profile, headers, Instant::now(), Utc::now());
    }

    pub fn after_response_at(
        &self,
        profile: &ProfileId,
        headers: &HeaderMap,
        now: Instant,
        now_utc: DateTime<Utc>,
    ) {
        if let Some(state) = RateLimitState::from_headers(headers, now, now_utc) {
            tracing::debug!(
                profile_id = %profile,
                limit = ?state.limit,
                remaining = ?state.remaining,
                reset_secs = ?state.reset_after.map(|d| d.as_secs()),
                "Rate limit observed"
            );
            self.states.insert(profile.clone(), state);
        }
    }

    pub fn on_429(&self, profile: &ProfileId, headers: &HeaderMap) -> WaitInstruction {
        self.on_429_at(profile, headers, Utc::now())
    }

    /// Wait for a 429: the header reset (plus buffer) if present, else
    /// `Retry-After`, else the next top of the hour (plus buffer).
    pub fn on_429_at(
        &self,
        profile: &ProfileId,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> WaitInstruction {
        let (until_reset, instruction) = if let Some(reset) = header_secs(headers, HEADER_RESET) {
            (reset, WaitInstruction {
                duration: reset + self.policy.reset_buffer,
                reason: WaitReason::RateLimitReset,
            })
        } else if let Some(retry_after) = header_secs(headers, HEADER_RETRY_AFTER) {
            (retry_after, WaitInstruction {
                duration: retry_after + self.policy.reset_buffer,
                reason: WaitReason::RateLimitReset,
            })
        } else {
            let until_hour = until_next_hour(&now);
            (until_hour, WaitInstruction {
                duration: until_hour + self.policy.hour_boundary_buffer,
                reason: WaitReason::HourBoundary,
            })
        };

        // Remember the exhaustion so other calls for this profile hold off too.
        self.states.insert(profile.clone(), RateLimitState {
            limit: header_u32(headers, HEADER_LIMIT),
            remaining: Some(0),
            reset_after: Some(until_reset),
            observed_at: Instant::now(),
            observed_utc: now,
        });

        tracing::warn!(
            profile_id = %profile,
            wait_secs = instruction.duration.as_secs(),
            reason = %instruction.reason,
            "Rate limited (429)"
        );
        instruction
    }

    /// Suspend for `instruction`, publishing the countdown for `profile`
    /// while the wait is active.
    pub async fn wait(
        &self,
        profile: &ProfileId,
        instruction: WaitInstruction,
        ctx: &WaitContext,
    ) -> Result<(), SyncError> {
        self.waits.insert(profile.clone(), ActiveWait {
            deadline: Instant::now() + instruction.duration.min(MAX_WAIT),
            reason: instruction.reason,
        });
        let result = ctx.sleep(instruction).await;
        self.waits.remove(profile);
        result
    }

    /// Countdown of the profile's active wait, if any.
    pub fn countdown(&self, profile: &ProfileId) -> Option<Countdown> {
        let wait = *self.waits.get(profile)?;
        let remaining = wait.deadline.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then(|| Countdown::new(remaining, wait.reason, Utc::now()))
    }

    /// Drop everything known about a profile.
    pub fn forget(&self, profile: &ProfileId) {
        self.states.remove(profile);
        self.waits.remove(profile);
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    let raw = header_str(headers, name)?;
    raw.parse::<u32>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u32))
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<Duration> {
    header_delay(header_str(headers, name)?)
}
