// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Access token lifecycle for every profile.
//!
//! Handles:
//! - Proactive refresh when the token is about to expire
//! - Reactive refresh after a 401
//! - Retry with backoff on transient refresh failures
//! - Atomic persistence of the rotated token pair
//! - Authorization-code exchange for new profiles

use crate::config::{Config, SyncConfig, FITBIT_SCOPES};
use crate::db::CredentialStore;
use crate::error::{StoreError, SyncError};
use crate::models::{CredentialSet, ProfileId, TokenGrant};
use crate::services::backoff::{backoff_delay, retry_after};
use crate::services::rate_governor::{Decision, RateGovernor};
use crate::services::transport::{ApiRequest, HttpTransport, RequestAuth};
use crate::services::wait::{WaitContext, WaitInstruction, WaitReason};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cached access token with expiry information.
#[derive(Clone)]
pub struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Shared token cache.
pub type TokenCache = Arc<DashMap<ProfileId, CachedToken>>;

/// Per-profile refresh locks.
pub type RefreshLocks = Arc<DashMap<ProfileId, Arc<Mutex<()>>>>;

/// How a failed token-endpoint response should be handled.
#[derive(Debug, PartialEq, Eq)]
enum GrantFailure {
    /// Worth retrying (5xx, 429)
    Transient,
    /// The grant itself was rejected (revoked or expired refresh token)
    InvalidGrant,
    /// Anything else the server refused
    Rejected,
}

fn classify_grant_failure(status: u16, body: &str) -> GrantFailure {
    match status {
        429 | 500..=599 => GrantFailure::Transient,
        400 | 401 if body.contains("invalid_grant") || body.contains("invalid_token") => {
            GrantFailure::InvalidGrant
        }
        401 => GrantFailure::InvalidGrant,
        _ => GrantFailure::Rejected,
    }
}

/// Owns all `CredentialSet` mutation.
#[derive(Clone)]
pub struct TokenManager {
    transport: Arc<dyn HttpTransport>,
    store: CredentialStore,
    governor: Arc<RateGovernor>,
    policy: SyncConfig,
    token_url: String,
    authorize_url: String,
    /// In-memory cache of access tokens (shared across jobs).
    token_cache: TokenCache,
    /// Per-profile mutex to serialize refreshes.
    refresh_locks: RefreshLocks,
}

impl TokenManager {
    pub fn new(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        store: CredentialStore,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            transport,
            store,
            governor,
            policy: config.sync.clone(),
            token_url: config.token_url.clone(),
            authorize_url: config.authorize_url.clone(),
            token_cache: Arc::new(DashMap::new()),
            refresh_locks: Arc::new(DashMap::new()),
        }
    }

    // ─── Token Management ────────────────────────────────────────────────────

    /// Get an access token valid for at least the refresh margin.
    ///
    /// 1. Check the in-memory cache (no I/O)
    /// 2. Take the per-profile refresh lock
    /// 3. Re-check the cache (another job may have refreshed)
    /// 4. Load credentials from disk; use them if still fresh
    /// 5. Otherwise refresh, persist and cache
    pub async fn get_valid_token(
        &self,
        profile: &ProfileId,
        ctx: &WaitContext,
    ) -> Result<String, SyncError> {
        if let Some(token) = self.cached_fresh(profile) {
            return Ok(token);
        }

        let lock = self.lock_for(profile);
        let _guard = lock.lock().await;

        if let Some(token) = self.cached_fresh(profile) {
            return Ok(token);
        }

        let credentials = self.load(profile).await?;
        if credentials.is_fresh(Utc::now(), self.policy.token_refresh_margin) {
            self.cache(profile, &credentials);
            return Ok(credentials.access_token);
        }

        tracing::info!(profile_id = %profile, "Access token expiring, refreshing");
        let refreshed = self.refresh(profile, &credentials, ctx).await?;
        Ok(refreshed.access_token)
    }

    /// Refresh after the API rejected `rejected_token` with a 401.
    ///
    /// If another task already replaced that token, the newer one is returned
    /// without another round trip.
    pub async fn force_refresh(
        &self,
        profile: &ProfileId,
        rejected_token: &str,
        ctx: &WaitContext,
    ) -> Result<String, SyncError> {
        let lock = self.lock_for(profile);
        let _guard = lock.lock().await;

        let credentials = self.load(profile).await?;
        if credentials.access_token != rejected_token
            && credentials.is_fresh(Utc::now(), self.policy.token_refresh_margin)
        {
            self.cache(profile, &credentials);
            return Ok(credentials.access_token);
        }

        tracing::info!(profile_id = %profile, "Access token rejected, refreshing");
        self.token_cache.remove(profile);
        let refreshed = self.refresh(profile, &credentials, ctx).await?;
        Ok(refreshed.access_token)
    }

    /// Run the refresh grant, persist the new pair and cache it.
    /// Caller must hold the profile's refresh lock.
    async fn refresh(
        &self,
        profile: &ProfileId,
        credentials: &CredentialSet,
        ctx: &WaitContext,
    ) -> Result<CredentialSet, SyncError> {
        let grant = self
            .request_grant(
                profile,
                credentials,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", credentials.refresh_token.as_str()),
                ],
                ctx,
            )
            .await
            .map_err(|failure| match failure {
                GrantError::InvalidGrant(body) => SyncError::ReauthorizationRequired(body),
                GrantError::Sync(e) => e,
            })?;

        let refreshed = credentials.with_tokens(grant, Utc::now());
        self.store.save(profile, &refreshed).await?;
        self.cache(profile, &refreshed);

        tracing::info!(
            profile_id = %profile,
            expires_at = %refreshed.expires_at,
            "Token refreshed and saved"
        );
        Ok(refreshed)
    }

    /// POST to the token endpoint, retrying transient failures with backoff.
    async fn request_grant(
        &self,
        profile: &ProfileId,
        client: &CredentialSet,
        form: &[(&str, &str)],
        ctx: &WaitContext,
    ) -> Result<TokenGrant, GrantError> {
        let attempts = self.policy.refresh_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            ctx.check()?;
            if let Decision::Wait(wait) = self.governor.before_request(profile) {
                self.governor.wait(profile, wait, ctx).await?;
            }

            let request = ApiRequest::post_form(
                self.token_url.clone(),
                RequestAuth::Basic {
                    client_id: client.client_id.clone(),
                    client_secret: client.client_secret.clone(),
                },
                form,
            );

            let mut delay = None;
            match self.transport.send(request).await {
                Ok(response) => {
                    self.governor.after_response(profile, &response.headers);
                    if response.is_success() {
                        return response.json::<TokenGrant>().map_err(|e| {
                            GrantError::Sync(SyncError::AuthFailure(format!(
                                "malformed token response: {e}"
                            )))
                        });
                    }

                    let body = response.snippet();
                    match classify_grant_failure(response.status, &response.body) {
                        GrantFailure::InvalidGrant => {
                            tracing::warn!(
                                profile_id = %profile,
                                status = response.status,
                                "Token grant rejected, reauthorization required"
                            );
                            return Err(GrantError::InvalidGrant(body));
                        }
                        GrantFailure::Rejected => {
                            return Err(GrantError::Sync(SyncError::AuthFailure(format!(
                                "token endpoint returned HTTP {}: {body}",
                                response.status
                            ))));
                        }
                        GrantFailure::Transient => {
                            last_error = format!("HTTP {}: {body}", response.status);
                            delay = retry_after(response.header("retry-after"));
                        }
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            tracing::warn!(
                profile_id = %profile,
                attempt,
                attempts,
                error = %last_error,
                "Token request failed"
            );
            if attempt < attempts {
                let duration = delay.unwrap_or_else(|| {
                    backoff_delay(
                        self.policy.refresh_backoff_base,
                        attempt,
                        self.policy.backoff_cap,
                        self.policy.jitter_ratio,
                    )
                });
                let wait = WaitInstruction {
                    duration,
                    reason: WaitReason::RefreshBackoff,
                };
                self.governor.wait(profile, wait, ctx).await?;
            }
        }

        Err(GrantError::Sync(SyncError::RefreshTransientFailure {
            attempts,
            last_error,
        }))
    }

    // ─── Authorization ───────────────────────────────────────────────────────

    /// Consent page URL for a new authorization.
    pub fn authorization_url(&self, client_id: &str, redirect_uri: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}",
            self.authorize_url,
            urlencoding::encode(client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(FITBIT_SCOPES),
        )
    }

    /// Exchange an authorization code for the profile's first credentials.
    pub async fn exchange_code(
        &self,
        profile: &ProfileId,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<CredentialSet, SyncError> {
        let now = Utc::now();
        let blank = CredentialSet {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            access_token: String::new(),
            refresh_token: String::new(),
            expires_at: now,
            scopes: BTreeSet::new(),
            user_id: None,
            created_at: now,
        };

        let lock = self.lock_for(profile);
        let _guard = lock.lock().await;

        let grant = self
            .request_grant(
                profile,
                &blank,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("client_id", client_id),
                    ("redirect_uri", redirect_uri),
                ],
                &WaitContext::default(),
            )
            .await
            .map_err(|failure| match failure {
                GrantError::InvalidGrant(body) => {
                    SyncError::AuthFailure(format!("authorization code rejected: {body}"))
                }
                GrantError::Sync(e) => e,
            })?;

        let credentials = blank.with_tokens(grant, Utc::now());
        self.store.save(profile, &credentials).await?;
        self.cache(profile, &credentials);

        tracing::info!(profile_id = %profile, scopes = ?credentials.scopes, "Profile authorized");
        Ok(credentials)
    }

    /// Drop cached state for a profile (after a reset).
    pub fn forget(&self, profile: &ProfileId) {
        self.token_cache.remove(profile);
        self.refresh_locks.remove(profile);
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    async fn load(&self, profile: &ProfileId) -> Result<CredentialSet, SyncError> {
        self.store.load(profile).await.map_err(|e| match e {
            StoreError::NotFound(_) => {
                SyncError::AuthFailure(format!("profile {profile} has no credentials"))
            }
            other => SyncError::AuthFailure(format!("credentials unusable: {other}")),
        })
    }

    fn cached_fresh(&self, profile: &ProfileId) -> Option<String> {
        let cached = self.token_cache.get(profile)?;
        let margin = chrono::Duration::from_std(self.policy.token_refresh_margin)
            .unwrap_or_else(|_| chrono::Duration::zero());
        (Utc::now() + margin < cached.expires_at).then(|| cached.access_token.clone())
    }

    fn cache(&self, profile: &ProfileId, credentials: &CredentialSet) {
        self.token_cache.insert(
            profile.clone(),
            CachedToken {
                access_token: credentials.access_token.clone(),
                expires_at: credentials.expires_at,
            },
        );
    }

    fn lock_for(&self, profile: &ProfileId) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(profile.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

enum GrantError {
    InvalidGrant(String),
    Sync(SyncError),
}

impl From<SyncError> for GrantError {
    fn from(err: SyncError) -> Self {
        GrantError::Sync(err)
    }
}

/// Pull the `code` parameter out of a pasted redirect URL, or accept a bare
/// code as-is.
pub fn extract_code(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let Some((_, query)) = input.split_once('?') else {
        return (!input.contains(['/', '&', '=', ' '])).then(|| input.to_string());
    };
    let query = query.split('#').next().unwrap_or_default();
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "code")
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_grant_failure() {
        assert_eq!(classify_grant_failure(503, ""), GrantFailure::Transient);
        assert_eq!(classify_grant_failure(429, ""), GrantFailure::Transient);
        assert_eq!(
            classify_grant_failure(400, r#"{"errors":[{"errorType":"invalid_grant"}]}"#),
            GrantFailure::InvalidGrant
        );
        assert_eq!(classify_grant_failure(401, "{}"), GrantFailure::InvalidGrant);
        assert_eq!(
            classify_grant_failure(400, r#"{"errors":[{"errorType":"invalid_request"}]}"#),
            GrantFailure::Rejected
        );
    }

    #[test]
    fn test_extract_code() {
        assert_eq!(
            extract_code("http://localhost:8080/?code=abc123&state=x#_=_").as_deref(),
            Some("abc123")
        );
        assert_eq!(extract_code("  abc123 ").as_deref(), Some("abc123"));
        assert_eq!(extract_code("http://localhost:8080/?state=x"), None);
        assert_eq!(extract_code("http://localhost:8080/"), None);
        assert_eq!(extract_code(""), None);
    }
}
