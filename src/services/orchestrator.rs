// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fetch job execution.
//!
//! One job per profile. Within a job the metric tasks run sequentially in
//! [`Metric::ALL`] order against the profile's own quota; across profiles
//! jobs run concurrently, bounded by `max_concurrent_profiles`.

use crate::config::{Config, SyncConfig};
use crate::db::{CredentialStore, MetricStore, ProfileLayout, ProfileRegistry};
use crate::error::{StoreError, SyncError};
use crate::models::{DateWindow, FetchJob, JobId, JobStatus, Metric, ProfileId, TaskOutcome};
use crate::services::backoff::{backoff_delay, retry_after};
use crate::services::fitbit::{merge_by_date, parse_member_since, Series, PROFILE_PATH};
use crate::services::progress::{ProgressEvent, SyncObserver};
use crate::services::rate_governor::{Decision, RateGovernor};
use crate::services::token_manager::TokenManager;
use crate::services::transport::{ApiRequest, HttpTransport};
use crate::services::wait::{Countdown, WaitContext, WaitInstruction, WaitReason};
use crate::time_utils::yesterday;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Why a cancel request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} already {1}")]
    AlreadyTerminal(JobId, JobStatus),
}

/// Why a job could not be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("profile {0} already has active job {1}")]
    ProfileBusy(ProfileId, JobId),
}

#[derive(Clone)]
struct JobHandle {
    cancel: CancellationToken,
    /// Fired once the job is terminal
    done: CancellationToken,
    job: Arc<RwLock<FetchJob>>,
}

impl JobHandle {
    /// Terminal and finished at or before `cutoff`. A job whose lock is held
    /// is still being updated and does not qualify.
    fn finished_before(&self, cutoff: chrono::DateTime<Utc>) -> Option<ProfileId> {
        let job = self.job.try_read().ok()?;
        let finished = job.finished_at?;
        (job.status.is_terminal() && finished <= cutoff).then(|| job.profile_id.clone())
    }

    fn is_active(&self) -> bool {
        self.job
            .try_read()
            .map_or(true, |job| !job.status.is_terminal())
    }
}

type Observers = Arc<Vec<Arc<dyn SyncObserver>>>;

struct Inner {
    api_base_url: String,
    policy: SyncConfig,
    max_concurrent_profiles: usize,
    job_retention: Duration,
    /// Bound on waiting for a cancelled job to stop
    drain_timeout: Duration,
    transport: Arc<dyn HttpTransport>,
    tokens: TokenManager,
    governor: Arc<RateGovernor>,
    store: Arc<dyn MetricStore>,
    registry: ProfileRegistry,
    observers: Observers,
    jobs: DashMap<JobId, JobHandle>,
    /// Latest job queued through [`JobOrchestrator::submit`], per profile
    active: DashMap<ProfileId, JobId>,
}

/// Runs and tracks fetch jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

/// Per-job request context.
struct Session<'a> {
    profile: &'a ProfileId,
    job_id: JobId,
    token: String,
    ctx: WaitContext,
    /// Fetched lazily, at most once per job
    member_since: Option<Option<NaiveDate>>,
}

impl JobOrchestrator {
    pub fn new(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn MetricStore>,
        observers: Vec<Arc<dyn SyncObserver>>,
    ) -> Self {
        let layout = ProfileLayout::new(config.profiles_dir());
        let governor = Arc::new(RateGovernor::new(config.sync.clone()));
        let tokens = TokenManager::new(
            config,
            transport.clone(),
            CredentialStore::new(layout.clone()),
            governor.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                api_base_url: config.api_base_url.clone(),
                policy: config.sync.clone(),
                max_concurrent_profiles: config.max_concurrent_profiles.max(1),
                job_retention: config.job_retention,
                drain_timeout: config.http_timeout.saturating_mul(2),
                transport,
                tokens,
                governor,
                store,
                registry: ProfileRegistry::new(layout),
                observers: Arc::new(observers),
                jobs: DashMap::new(),
                active: DashMap::new(),
            }),
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.inner.registry
    }

    // ─── Job Lifecycle ───────────────────────────────────────────────────────

    /// Register a pending job without running it. At most one submitted job
    /// per profile may be pending or running at a time.
    pub fn submit(
        &self,
        profile: ProfileId,
        metrics: &[Metric],
        date_range: Option<DateWindow>,
    ) -> Result<JobId, SubmitError> {
        self.prune_finished();
        match self.inner.active.entry(profile.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = *entry.get();
                if self.handle(existing).is_some_and(|h| h.is_active()) {
                    return Err(SubmitError::ProfileBusy(profile, existing));
                }
                let (id, _) = self.register(profile, metrics, date_range);
                entry.insert(id);
                Ok(id)
            }
            Entry::Vacant(entry) => {
                let (id, _) = self.register(profile, metrics, date_range);
                entry.insert(id);
                Ok(id)
            }
        }
    }

    fn register(
        &self,
        profile: ProfileId,
        metrics: &[Metric],
        date_range: Option<DateWindow>,
    ) -> (JobId, JobHandle) {
        let job = FetchJob::new(profile, metrics, date_range);
        let id = job.id;
        let handle = JobHandle {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            job: Arc::new(RwLock::new(job)),
        };
        self.inner.jobs.insert(id, handle.clone());
        (id, handle)
    }

    /// Forget jobs that finished longer than `job_retention` ago. Returns
    /// how many were dropped.
    pub fn prune_finished(&self) -> usize {
        let Some(cutoff) = ChronoDuration::from_std(self.inner.job_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let expired: Vec<(JobId, ProfileId)> = self
            .inner
            .jobs
            .iter()
            .filter_map(|e| e.value().finished_before(cutoff).map(|p| (*e.key(), p)))
            .collect();

        for (id, profile) in &expired {
            self.inner.jobs.remove(id);
            self.inner.active.remove_if(profile, |_, active| active == id);
            for observer in self.inner.observers.iter() {
                observer.on_job_evicted(*id);
            }
        }
        if !expired.is_empty() {
            tracing::debug!(jobs = expired.len(), "Evicted finished jobs");
        }
        expired.len()
    }

    /// Run one profile's job to completion.
    pub async fn run(
        &self,
        profile: ProfileId,
        metrics: &[Metric],
        date_range: Option<DateWindow>,
    ) -> FetchJob {
        self.prune_finished();
        let (id, handle) = self.register(profile, metrics, date_range);
        self.execute(id, handle).await
    }

    /// Run a submitted job in the background. False if the id is unknown.
    pub fn spawn(&self, id: JobId) -> bool {
        let Some(handle) = self.handle(id) else {
            return false;
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(id, handle).await;
        });
        true
    }

    /// Run one job per profile, concurrently. Results follow input order.
    pub async fn run_many(
        &self,
        profiles: Vec<ProfileId>,
        metrics: &[Metric],
        date_range: Option<DateWindow>,
    ) -> Vec<FetchJob> {
        self.prune_finished();
        let registered: Vec<(JobId, JobHandle)> = profiles
            .into_iter()
            .map(|profile| self.register(profile, metrics, date_range))
            .collect();

        let mut results: Vec<(usize, FetchJob)> = stream::iter(registered.into_iter().enumerate())
            .map(|(index, (id, handle))| async move { (index, self.execute(id, handle).await) })
            .buffer_unordered(self.inner.max_concurrent_profiles)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, job)| job).collect()
    }

    /// Request cooperative cancellation. In-flight HTTP calls finish; no
    /// further calls are issued and any active wait is interrupted.
    pub async fn cancel(&self, id: JobId) -> Result<(), CancelError> {
        let handle = self.handle(id).ok_or(CancelError::NotFound(id))?;
        let mut job = handle.job.write().await;
        if job.status.is_terminal() {
            return Err(CancelError::AlreadyTerminal(id, job.status));
        }

        handle.cancel.cancel();
        // Not started yet: nothing will run it to a terminal state.
        if job.status == JobStatus::Pending {
            job.conclude(true, None);
            handle.done.cancel();
        }
        tracing::info!(job_id = %id, profile_id = %job.profile_id, "Job cancellation requested");
        Ok(())
    }

    /// Cancel every job that has not finished yet.
    pub async fn cancel_all(&self) {
        let ids: Vec<JobId> = self.inner.jobs.iter().map(|e| *e.key()).collect();
        for id in ids {
            // Already-terminal jobs are expected here.
            let _ = self.cancel(id).await;
        }
    }

    /// Cancel every unfinished job of `profile` and wait for each to stop.
    pub async fn cancel_profile(&self, profile: &ProfileId) -> Vec<JobId> {
        let handles: Vec<(JobId, JobHandle)> = self
            .inner
            .jobs
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut cancelled = Vec::new();
        for (id, handle) in handles {
            if handle.job.read().await.profile_id != *profile {
                continue;
            }
            if self.cancel(id).await.is_ok() {
                cancelled.push((id, handle));
            }
        }

        for (id, handle) in &cancelled {
            let stopped = tokio::time::timeout(self.inner.drain_timeout, handle.done.cancelled());
            if stopped.await.is_err() {
                tracing::warn!(
                    job_id = %id,
                    profile_id = %profile,
                    "Job still running after cancel"
                );
            }
        }
        cancelled.into_iter().map(|(id, _)| id).collect()
    }

    /// Cancel the profile's jobs, then delete its credentials and data and
    /// drop its cached token and quota state.
    pub async fn delete_profile(&self, profile: &ProfileId) -> Result<Vec<JobId>, StoreError> {
        if !self.inner.registry.exists(profile).await {
            return Err(StoreError::NotFound(format!("profile {profile}")));
        }
        let cancelled = self.cancel_profile(profile).await;
        self.inner.registry.reset_profile(profile).await?;
        self.inner.tokens.forget(profile);
        self.inner.governor.forget(profile);
        tracing::info!(profile_id = %profile, cancelled = cancelled.len(), "Profile deleted");
        Ok(cancelled)
    }

    pub async fn job(&self, id: JobId) -> Option<FetchJob> {
        let handle = self.handle(id)?;
        let job = handle.job.read().await;
        Some(job.clone())
    }

    /// Snapshots of all known jobs, oldest first.
    pub async fn jobs(&self) -> Vec<FetchJob> {
        let handles: Vec<JobHandle> = self.inner.jobs.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.job.read().await.clone());
        }
        out.sort_by_key(|job| job.created_at);
        out
    }

    /// Live countdown of the job's current wait, if it is waiting.
    pub async fn countdown(&self, id: JobId) -> Option<Countdown> {
        let job = self.job(id).await?;
        if job.status != JobStatus::Running {
            return None;
        }
        self.inner.governor.countdown(&job.profile_id)
    }

    fn handle(&self, id: JobId) -> Option<JobHandle> {
        self.inner.jobs.get(&id).map(|h| h.value().clone())
    }

    // ─── Execution ───────────────────────────────────────────────────────────

    /// Drive a submitted job to a terminal state and return its final snapshot.
    async fn execute(&self, id: JobId, handle: JobHandle) -> FetchJob {
        let (profile, metrics, date_range) = {
            let mut job = handle.job.write().await;
            if !job.start() {
                return job.clone();
            }
            let metrics: Vec<Metric> = job.tasks.iter().map(|t| t.metric).collect();
            (job.profile_id.clone(), metrics, job.date_range)
        };
        tracing::info!(job_id = %id, profile_id = %profile, metrics = ?metrics, "Job started");

        let ctx = {
            let observers = self.inner.observers.clone();
            let profile = profile.clone();
            WaitContext::new(handle.cancel.clone()).with_listener(Arc::new(move |c: &Countdown| {
                let event = ProgressEvent::Waiting(c.clone());
                for observer in observers.iter() {
                    observer.on_event(&profile, id, &event);
                }
            }))
        };

        let fatal = self
            .run_tasks(&handle, &profile, id, &metrics, date_range, ctx)
            .await;

        let snapshot = {
            let mut job = handle.job.write().await;
            let interrupted = handle.cancel.is_cancelled()
                && job.tasks.iter().any(|t| !t.outcome.is_resolved());
            job.conclude(interrupted, fatal.as_ref());
            job.clone()
        };

        self.emit(&profile, id, ProgressEvent::JobTerminal {
            status: snapshot.status,
        });
        handle.done.cancel();
        tracing::info!(
            job_id = %id,
            profile_id = %profile,
            status = %snapshot.status,
            failed = ?snapshot.failed_metrics(),
            "Job finished"
        );
        snapshot
    }

    /// Run every task in order. Returns the job-fatal error, if any.
    async fn run_tasks(
        &self,
        handle: &JobHandle,
        profile: &ProfileId,
        job_id: JobId,
        metrics: &[Metric],
        date_range: Option<DateWindow>,
        ctx: WaitContext,
    ) -> Option<SyncError> {
        let token = match self.inner.tokens.get_valid_token(profile, &ctx).await {
            Ok(token) => token,
            Err(SyncError::Cancelled) => return None,
            Err(e) => {
                tracing::error!(
                    job_id = %job_id,
                    profile_id = %profile,
                    error = %e,
                    "No usable token"
                );
                return Some(e);
            }
        };
        let mut session = Session {
            profile,
            job_id,
            token,
            ctx,
            member_since: None,
        };

        let total = metrics.len();
        for (index, &metric) in metrics.iter().enumerate() {
            if session.ctx.is_cancelled() {
                return None;
            }

            let window = match date_range {
                Some(range) => Ok(Some(range)),
                None => self.incremental_window(&mut session, metric).await,
            };
            let window = match window {
                Ok(window) => window,
                Err(SyncError::Cancelled) => return None,
                Err(e) if e.is_job_fatal() => return Some(e),
                Err(e) => {
                    self.finish_task(handle, profile, job_id, metric, TaskOutcome::failed(&e))
                        .await;
                    continue;
                }
            };

            if let Some(task) = handle.job.write().await.task_mut(metric) {
                task.window = window;
                task.outcome = TaskOutcome::Running;
            }
            self.emit(profile, job_id, ProgressEvent::TaskStarted {
                metric,
                index: index + 1,
                total,
                window,
            });

            let result = match window {
                None => Ok((0, 0)),
                Some(window) => self.run_task(&mut session, metric, window).await,
            };

            let outcome = match result {
                Ok((records, windows)) => TaskOutcome::Succeeded { records, windows },
                Err(SyncError::Cancelled) => return None,
                Err(e) => {
                    tracing::warn!(
                        job_id = %job_id,
                        profile_id = %profile,
                        metric = %metric,
                        error = %e,
                        "Task failed"
                    );
                    let fatal = e.is_job_fatal();
                    self.finish_task(handle, profile, job_id, metric, TaskOutcome::failed(&e))
                        .await;
                    if fatal {
                        return Some(e);
                    }
                    continue;
                }
            };
            self.finish_task(handle, profile, job_id, metric, outcome).await;
        }
        None
    }

    async fn finish_task(
        &self,
        handle: &JobHandle,
        profile: &ProfileId,
        job_id: JobId,
        metric: Metric,
        outcome: TaskOutcome,
    ) {
        if let Some(task) = handle.job.write().await.task_mut(metric) {
            task.outcome = outcome.clone();
        }
        self.emit(profile, job_id, ProgressEvent::TaskCompleted { metric, outcome });
    }

    /// Fetch `window` for one metric in API-sized chunks, upserting each chunk.
    /// Returns `(records written, chunks requested)`.
    async fn run_task(
        &self,
        session: &mut Session<'_>,
        metric: Metric,
        window: DateWindow,
    ) -> Result<(usize, usize), SyncError> {
        let chunks = window.chunks(metric.max_window_days());
        let mut written = 0;

        for chunk in &chunks {
            let mut fetched = Vec::new();
            for series in Series::for_metric(metric) {
                let body = self.call(session, &series.path(chunk)).await?;
                let records = series.parse(&body).map_err(|e| SyncError::HttpPermanentFailure {
                    status: 200,
                    body: format!("unexpected payload: {e}"),
                })?;
                fetched.extend(records);
            }

            let records = merge_by_date(fetched);
            let summary = self
                .inner
                .store
                .upsert(session.profile, metric, &records)
                .await?;
            written += summary.written();

            self.emit(session.profile, session.job_id, ProgressEvent::TaskProgress {
                metric,
                window: *chunk,
                records: records.len(),
            });
        }
        Ok((written, chunks.len()))
    }

    /// Window for an incremental sync: the day after the last stored date,
    /// else `memberSince`, else the metric's fallback, up to yesterday.
    async fn incremental_window(
        &self,
        session: &mut Session<'_>,
        metric: Metric,
    ) -> Result<Option<DateWindow>, SyncError> {
        let start = match self.inner.store.last_date(session.profile, metric).await? {
            Some(last) => last + ChronoDuration::days(1),
            None => match self.member_since(session).await? {
                Some(since) => since,
                None => metric.fallback_start(),
            },
        };
        Ok(DateWindow::new(start, yesterday()))
    }

    async fn member_since(
        &self,
        session: &mut Session<'_>,
    ) -> Result<Option<NaiveDate>, SyncError> {
        if let Some(cached) = session.member_since {
            return Ok(cached);
        }
        let since = match self.call(session, PROFILE_PATH).await {
            Ok(body) => parse_member_since(&body),
            Err(e) if matches!(e, SyncError::Cancelled) || e.is_job_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    profile_id = %session.profile,
                    error = %e,
                    "memberSince unavailable"
                );
                None
            }
        };
        session.member_since = Some(since);
        Ok(since)
    }

    /// One API GET under the full request discipline: governor before and
    /// after, bounded retries on transient errors, waits on 429, and a
    /// single token refresh on 401.
    async fn call(&self, session: &mut Session<'_>, path: &str) -> Result<Value, SyncError> {
        let url = format!("{}{}", self.inner.api_base_url, path);
        let policy = &self.inner.policy;
        let governor = &self.inner.governor;
        let profile = session.profile;

        let mut transient_failures = 0u32;
        let mut rate_limit_waits = 0u32;
        let mut refreshed = false;

        loop {
            session.ctx.check()?;
            if let Decision::Wait(wait) = governor.before_request(profile) {
                governor.wait(profile, wait, &session.ctx).await?;
            }

            let (last_error, server_delay) =
                match self.inner.transport.send(ApiRequest::get(&url, &session.token)).await {
                    Err(e) => (e.to_string(), None),
                    Ok(response) => {
                        governor.after_response(profile, &response.headers);
                        match response.status {
                            200..=299 => {
                                return response.json::<Value>().map_err(|e| {
                                    SyncError::HttpPermanentFailure {
                                        status: response.status,
                                        body: format!("invalid JSON: {e}"),
                                    }
                                });
                            }
                            401 if !refreshed => {
                                refreshed = true;
                                session.token = self
                                    .inner
                                    .tokens
                                    .force_refresh(profile, &session.token, &session.ctx)
                                    .await?;
                                continue;
                            }
                            429 => {
                                rate_limit_waits += 1;
                                if rate_limit_waits > policy.max_rate_limit_waits {
                                    return Err(SyncError::RateLimited {
                                        waits: rate_limit_waits - 1,
                                    });
                                }
                                let wait = governor.on_429(profile, &response.headers);
                                governor.wait(profile, wait, &session.ctx).await?;
                                continue;
                            }
                            500..=599 => (
                                format!("HTTP {}: {}", response.status, response.snippet()),
                                retry_after(response.header("retry-after")),
                            ),
                            status => {
                                return Err(SyncError::HttpPermanentFailure {
                                    status,
                                    body: response.snippet(),
                                });
                            }
                        }
                    }
                };

            transient_failures += 1;
            tracing::warn!(
                profile_id = %profile,
                url = %url,
                attempt = transient_failures,
                error = %last_error,
                "Transient request failure"
            );
            if transient_failures >= policy.request_attempts.max(1) {
                return Err(SyncError::HttpTransientFailure {
                    attempts: transient_failures,
                    last_error,
                });
            }
            let duration = server_delay.unwrap_or_else(|| {
                backoff_delay(
                    policy.request_backoff_base,
                    transient_failures,
                    policy.backoff_cap,
                    policy.jitter_ratio,
                )
            });
            let wait = WaitInstruction {
                duration,
                reason: WaitReason::RetryBackoff,
            };
            governor.wait(profile, wait, &session.ctx).await?;
        }
    }

    fn emit(&self, profile: &ProfileId, job: JobId, event: ProgressEvent) {
        for observer in self.inner.observers.iter() {
            observer.on_event(profile, job, &event);
        }
    }
}
