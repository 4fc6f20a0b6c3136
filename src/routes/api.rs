// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! API routes for the dashboard: profiles, fetch jobs and authorization.

use crate::error::{AppError, Result};
use crate::models::{DateWindow, FetchJob, JobId, Metric, ProfileId, ProfileStatus};
use crate::services::{extract_code, CancelError, Countdown, SubmitError};
use crate::time_utils::{parse_date, yesterday};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use validator::Validate;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/profiles", get(list_profiles))
        .route("/api/delete-profile", post(delete_profile))
        .route("/api/fetch-data", post(fetch_data))
        .route("/api/fetch-jobs", get(list_jobs))
        .route("/api/fetch-status/{job_id}", get(fetch_status))
        .route("/api/cancel-fetch/{job_id}", post(cancel_fetch))
        .route("/api/authorize-exchange", post(authorize_exchange))
        .route("/api/authorize-url/{profile}", get(authorize_url))
}

fn parse_profile(raw: &str) -> Result<ProfileId> {
    ProfileId::parse(raw).map_err(|e| AppError::BadRequest(format!("{raw:?}: {e}")))
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid job id {raw:?}")))
}

fn validate<T: Validate>(body: &T) -> Result<()> {
    body.validate()
        .map_err(|e| AppError::BadRequest(e.to_string().replace('\n', "; ")))
}

// ─── Profiles ────────────────────────────────────────────────

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct ProfileSummary {
    pub name: String,
    pub credentialed: bool,
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ProfileSummary>>> {
    let profiles = state.orchestrator.registry().list().await?;
    Ok(Json(
        profiles
            .into_iter()
            .map(|(id, status)| ProfileSummary {
                name: id.to_string(),
                credentialed: status == ProfileStatus::Credentialed,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct DeleteProfileRequest {
    #[validate(length(min = 1, max = 64))]
    pub profile: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteProfileResponse {
    pub profile: String,
    pub cancelled_jobs: Vec<JobId>,
    pub status: &'static str,
}

/// Stop the profile's jobs, then remove its credentials and data.
async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteProfileRequest>,
) -> Result<Json<DeleteProfileResponse>> {
    validate(&body)?;
    let profile = parse_profile(body.profile.trim())?;
    let cancelled_jobs = state.orchestrator.delete_profile(&profile).await?;

    Ok(Json(DeleteProfileResponse {
        profile: profile.to_string(),
        cancelled_jobs,
        status: "deleted",
    }))
}

// ─── Fetch Jobs ──────────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
pub struct FetchDataRequest {
    #[validate(length(min = 1, max = 64))]
    pub profile: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub profiles: Option<Vec<String>>,
    #[serde(default)]
    pub all_profiles: bool,
    /// `YYYY-MM-DD`; omitted for an incremental sync
    pub start: Option<String>,
    pub end: Option<String>,
    #[validate(length(min = 1, max = 4))]
    pub metrics: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct FetchDataResponse {
    pub job_ids: Vec<JobId>,
    pub status: &'static str,
}

impl FetchDataRequest {
    fn date_range(&self) -> Result<Option<DateWindow>> {
        let parse = |raw: &str| {
            parse_date(raw).ok_or_else(|| AppError::BadRequest(format!("invalid date {raw:?}")))
        };
        match (self.start.as_deref(), self.end.as_deref()) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(AppError::BadRequest("end requires start".to_string())),
            (Some(start), end) => {
                let start = parse(start)?;
                let end = end.map(parse).transpose()?.unwrap_or_else(yesterday);
                DateWindow::new(start, end)
                    .map(Some)
                    .ok_or_else(|| AppError::BadRequest("start is after end".to_string()))
            }
        }
    }

    fn metrics(&self) -> Result<Vec<Metric>> {
        match &self.metrics {
            None => Ok(Metric::ALL.to_vec()),
            Some(names) => names
                .iter()
                .map(|name| name.parse::<Metric>().map_err(AppError::BadRequest))
                .collect(),
        }
    }
}

/// Queue one background job per selected profile.
async fn fetch_data(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FetchDataRequest>,
) -> Result<(StatusCode, Json<FetchDataResponse>)> {
    validate(&body)?;
    let date_range = body.date_range()?;
    let metrics = body.metrics()?;
    let registry = state.orchestrator.registry();

    let profiles: Vec<ProfileId> = if body.all_profiles {
        registry.credentialed().await?
    } else {
        let mut names: BTreeSet<&str> = BTreeSet::new();
        names.extend(body.profile.as_deref());
        names.extend(body.profiles.iter().flatten().map(String::as_str));
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let id = parse_profile(name)?;
            if !registry.exists(&id).await {
                return Err(AppError::NotFound(format!("profile {id}")));
            }
            ids.push(id);
        }
        ids
    };
    if profiles.is_empty() {
        return Err(AppError::BadRequest("no profiles selected".to_string()));
    }

    let mut job_ids = Vec::with_capacity(profiles.len());
    for profile in profiles {
        match state.orchestrator.submit(profile, &metrics, date_range) {
            Ok(id) => job_ids.push(id),
            Err(e @ SubmitError::ProfileBusy(..)) => {
                // Queued but not started yet, so cancelling concludes them.
                for id in job_ids {
                    let _ = state.orchestrator.cancel(id).await;
                }
                return Err(AppError::Conflict(e.to_string()));
            }
        }
    }
    for &id in &job_ids {
        state.orchestrator.spawn(id);
    }
    tracing::info!(jobs = job_ids.len(), "Fetch jobs queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(FetchDataResponse {
            job_ids,
            status: "queued",
        }),
    ))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<FetchJob>> {
    Json(state.orchestrator.jobs().await)
}

#[derive(Debug, Serialize)]
pub struct FetchStatusResponse {
    #[serde(flatten)]
    pub job: FetchJob,
    pub countdown: Option<Countdown>,
    pub progress: Vec<String>,
}

async fn fetch_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<FetchStatusResponse>> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .orchestrator
        .job(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;

    Ok(Json(FetchStatusResponse {
        countdown: state.orchestrator.countdown(id).await,
        progress: state.board.lines(id),
        job,
    }))
}

async fn cancel_fetch(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let id = parse_job_id(&job_id)?;
    match state.orchestrator.cancel(id).await {
        Ok(()) => Ok(Json(serde_json::json!({ "job_id": id, "status": "cancelling" }))),
        Err(e @ CancelError::NotFound(_)) => Err(AppError::NotFound(e.to_string())),
        Err(e @ CancelError::AlreadyTerminal(..)) => Err(AppError::Conflict(e.to_string())),
    }
}

// ─── Authorization ───────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
pub struct AuthorizeExchangeRequest {
    #[validate(length(min = 1, max = 64))]
    pub profile: String,
    #[validate(length(min = 1, max = 256))]
    pub client_id: String,
    #[validate(length(min = 1, max = 256))]
    pub client_secret: String,
    /// Bare authorization code
    pub code: Option<String>,
    /// Full redirect URL pasted from the browser
    pub redirect_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeExchangeResponse {
    pub profile: String,
    pub scopes: BTreeSet<String>,
}

async fn authorize_exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AuthorizeExchangeRequest>,
) -> Result<Json<AuthorizeExchangeResponse>> {
    validate(&body)?;
    let profile = parse_profile(&body.profile)?;
    let code = body
        .code
        .as_deref()
        .or(body.redirect_url.as_deref())
        .and_then(extract_code)
        .ok_or_else(|| AppError::BadRequest("missing authorization code".to_string()))?;

    state.orchestrator.registry().create(&profile).await?;
    let credentials = state
        .orchestrator
        .tokens()
        .exchange_code(
            &profile,
            body.client_id.trim(),
            body.client_secret.trim(),
            &code,
            &state.config.redirect_uri,
        )
        .await?;

    Ok(Json(AuthorizeExchangeResponse {
        profile: profile.to_string(),
        scopes: credentials.scopes,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeUrlQuery {
    pub client_id: String,
}

async fn authorize_url(
    State(state): State<Arc<AppState>>,
    Path(profile): Path<String>,
    Query(query): Query<AuthorizeUrlQuery>,
) -> Result<Json<serde_json::Value>> {
    let profile = parse_profile(&profile)?;
    if query.client_id.trim().is_empty() {
        return Err(AppError::BadRequest("client_id is required".to_string()));
    }
    let url = state
        .orchestrator
        .tokens()
        .authorization_url(query.client_id.trim(), &state.config.redirect_uri);
    Ok(Json(serde_json::json!({ "profile": profile, "url": url })))
}
