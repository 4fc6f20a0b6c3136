// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! OAuth credentials owned by one profile.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Client registration plus the current token pair for a profile.
///
/// `access_token` and `expires_at` are only ever replaced together, through
/// [`CredentialSet::with_tokens`].
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: String,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
    /// Granted OAuth scopes
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    /// Fitbit's encoded user id, when the token endpoint reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// When the profile was first authorized
    pub created_at: DateTime<Utc>,
}

/// Upper bound applied to a server-reported `expires_in`.
const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

impl CredentialSet {
    /// Copy of `self` holding a freshly issued token pair.
    pub fn with_tokens(&self, tokens: TokenGrant, now: DateTime<Utc>) -> Self {
        let lifetime = tokens.expires_in.clamp(0, MAX_TOKEN_LIFETIME_SECS);
        Self {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: now + Duration::seconds(lifetime),
            scopes: tokens
                .scope
                .map(|s| parse_scopes(&s))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.scopes.clone()),
            user_id: tokens.user_id.or_else(|| self.user_id.clone()),
            created_at: self.created_at,
        }
    }

    /// True if the access token is still valid for at least `margin`.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: std::time::Duration) -> bool {
        let margin = Duration::from_std(margin).unwrap_or_else(|_| Duration::zero());
        now + margin < self.expires_at
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("client_id", &self.client_id)
            .field("client_secret", &mask(&self.client_secret))
            .field("access_token", &mask(&self.access_token))
            .field("refresh_token", &mask(&self.refresh_token))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Token endpoint response (authorization-code and refresh grants).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Split a space-separated OAuth scope string.
pub fn parse_scopes(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Show only the edges of a secret, e.g. `abc…xyz`.
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}…{tail}")
}
