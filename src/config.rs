// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Every scheduling constant used by the sync engine lives in [`SyncConfig`]
//! so deployments can tune throttling and backoff without a rebuild.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Scopes requested during authorization.
pub const FITBIT_SCOPES: &str = "activity heartrate sleep profile";

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory holding `profiles/<id>/...`
    pub data_dir: PathBuf,
    /// Server port
    pub port: u16,
    /// Fitbit Web API base URL (no trailing slash)
    pub api_base_url: String,
    /// OAuth token endpoint
    pub token_url: String,
    /// OAuth consent page
    pub authorize_url: String,
    /// Redirect URI registered with the Fitbit application
    pub redirect_uri: String,
    /// Timeout applied to every outbound HTTP call
    pub http_timeout: Duration,
    /// How many profiles may sync at the same time
    pub max_concurrent_profiles: usize,
    /// How long finished jobs stay visible to status polling
    pub job_retention: Duration,
    /// Scheduling and recovery knobs
    pub sync: SyncConfig,
}

/// Throttling, retry and refresh policy for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Refresh the access token when less than this much validity remains.
    pub token_refresh_margin: Duration,
    /// Total attempts for one token refresh (initial try included).
    pub refresh_attempts: u32,
    /// First backoff interval between refresh attempts.
    pub refresh_backoff_base: Duration,
    /// Total attempts for one data request on transient failures.
    pub request_attempts: u32,
    /// First backoff interval between data request attempts.
    pub request_backoff_base: Duration,
    /// Upper bound for any computed backoff interval.
    pub backoff_cap: Duration,
    /// Extra random delay, as a fraction of the computed backoff.
    pub jitter_ratio: f64,
    /// Throttle preemptively once `remaining` drops to this value...
    pub preemptive_remaining_threshold: u32,
    /// ...and the quota resets within this window.
    pub preemptive_window: Duration,
    /// Added to header-provided reset times.
    pub reset_buffer: Duration,
    /// Added to top-of-hour waits when no reset header is present.
    pub hour_boundary_buffer: Duration,
    /// 429 waits tolerated for a single request before giving up.
    pub max_rate_limit_waits: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            token_refresh_margin: Duration::from_secs(5 * 60),
            refresh_attempts: 4,
            refresh_backoff_base: Duration::from_secs(2),
            request_attempts: 3,
            request_backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            jitter_ratio: 0.25,
            preemptive_remaining_threshold: 1,
            preemptive_window: Duration::from_secs(60),
            reset_buffer: Duration::from_secs(1),
            hour_boundary_buffer: Duration::from_secs(5),
            max_rate_limit_waits: 3,
        }
    }
}

impl SyncConfig {
    /// Fast, deterministic policy for tests: millisecond backoffs, no jitter,
    /// no buffers.
    pub fn test_default() -> Self {
        Self {
            token_refresh_margin: Duration::from_secs(5 * 60),
            refresh_attempts: 3,
            refresh_backoff_base: Duration::from_millis(50),
            request_attempts: 3,
            request_backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(200),
            jitter_ratio: 0.0,
            preemptive_remaining_threshold: 1,
            preemptive_window: Duration::from_secs(60),
            reset_buffer: Duration::ZERO,
            hour_boundary_buffer: Duration::ZERO,
            max_rate_limit_waits: 3,
        }
    }

    fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            token_refresh_margin: secs_var(
                "SYNC_TOKEN_REFRESH_MARGIN_SECS",
                d.token_refresh_margin,
            )?,
            refresh_attempts: parse_var("SYNC_REFRESH_ATTEMPTS", d.refresh_attempts)?.max(1),
            refresh_backoff_base: secs_var("SYNC_REFRESH_BACKOFF_SECS", d.refresh_backoff_base)?,
            request_attempts: parse_var("SYNC_REQUEST_ATTEMPTS", d.request_attempts)?.max(1),
            request_backoff_base: secs_var("SYNC_REQUEST_BACKOFF_SECS", d.request_backoff_base)?,
            backoff_cap: secs_var("SYNC_BACKOFF_CAP_SECS", d.backoff_cap)?,
            jitter_ratio: ratio_var("SYNC_JITTER_RATIO", d.jitter_ratio)?,
            preemptive_remaining_threshold: parse_var(
                "SYNC_PREEMPTIVE_REMAINING",
                d.preemptive_remaining_threshold,
            )?,
            preemptive_window: secs_var("SYNC_PREEMPTIVE_WINDOW_SECS", d.preemptive_window)?,
            reset_buffer: secs_var("SYNC_RESET_BUFFER_SECS", d.reset_buffer)?,
            hour_boundary_buffer: secs_var("SYNC_HOUR_BUFFER_SECS", d.hour_boundary_buffer)?,
            max_rate_limit_waits: parse_var("SYNC_MAX_RATE_LIMIT_WAITS", d.max_rate_limit_waits)?,
        })
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Self {
            data_dir: env::var("FITBAUS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            port: parse_var("PORT", 5000)?,
            api_base_url: url_var("FITBIT_API_BASE_URL", "https://api.fitbit.com"),
            token_url: url_var("FITBIT_TOKEN_URL", "https://api.fitbit.com/oauth2/token"),
            authorize_url: url_var(
                "FITBIT_AUTHORIZE_URL",
                "https://www.fitbit.com/oauth2/authorize",
            ),
            // Sent verbatim: it must match the registered value exactly.
            redirect_uri: string_var("FITBIT_REDIRECT_URI", "http://localhost:8080/"),
            http_timeout: secs_var("HTTP_TIMEOUT_SECS", Duration::from_secs(30))?,
            max_concurrent_profiles: parse_var("MAX_CONCURRENT_PROFILES", 4usize)?.max(1),
            job_retention: secs_var("JOB_RETENTION_SECS", Duration::from_secs(10 * 60))?,
            sync: SyncConfig::from_env()?,
        })
    }

    /// Config pointing at a local data dir and mock API, for tests.
    pub fn test_default(data_dir: impl Into<PathBuf>, api_base_url: &str) -> Self {
        let base = api_base_url.trim_end_matches('/').to_string();
        Self {
            data_dir: data_dir.into(),
            port: 0,
            token_url: format!("{}/oauth2/token", base),
            authorize_url: format!("{}/oauth2/authorize", base),
            api_base_url: base,
            redirect_uri: "http://localhost:8080/".to_string(),
            http_timeout: Duration::from_secs(5),
            max_concurrent_profiles: 4,
            job_retention: Duration::from_secs(60),
            sync: SyncConfig::test_default(),
        }
    }

    /// Directory that holds one sub-directory per profile.
    pub fn profiles_dir(&self) -> PathBuf {
        self.data_dir.join("profiles")
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Endpoint URL without a trailing slash, so paths can be appended.
fn url_var(name: &str, default: &str) -> String {
    string_var(name, default).trim_end_matches('/').to_string()
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        _ => Ok(default),
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| *v >= 0.0)
            .and_then(|v| Duration::try_from_secs_f64(v).ok())
            .ok_or(ConfigError::Invalid(name, raw)),
        _ => Ok(default),
    }
}

/// A fraction in `[0, 1]`. Out-of-range values are clamped; NaN is rejected.
fn ratio_var(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let value: f64 = parse_var(name, default)?;
    if value.is_nan() {
        return Err(ConfigError::Invalid(name, value.to_string()));
    }
    Ok(value.clamp(0.0, 1.0))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
