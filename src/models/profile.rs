// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Profile identity.

use serde::{Deserialize, Serialize};
use std::fmt;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

const MAX_PROFILE_ID_LEN: usize = 64;

/// A filesystem-safe profile identifier.
///
/// Allowed: ASCII letters, digits, `-` and `_`, not starting with `-`.
/// This keeps ids usable as a single directory name on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileIdError {
    #[error("profile id is empty")]
    Empty,
    #[error("profile id is longer than {MAX_PROFILE_ID_LEN} characters")]
    TooLong,
    #[error("profile id contains invalid character {0:?}")]
    InvalidChar(char),
}

impl ProfileId {
    pub fn parse(raw: &str) -> Result<Self, ProfileIdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProfileIdError::Empty);
        }
        if raw.len() > MAX_PROFILE_ID_LEN {
            return Err(ProfileIdError::TooLong);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ProfileIdError::InvalidChar(c));
        }
        if raw.starts_with('-') {
            return Err(ProfileIdError::InvalidChar('-'));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProfileId {
    type Error = ProfileIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProfileId> for String {
    fn from(id: ProfileId) -> Self {
        id.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a profile has stored credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub enum ProfileStatus {
    Credentialed,
    Uncredentialed,
}
