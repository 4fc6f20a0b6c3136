// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-profile credential persistence.
//!
//! Saves are atomic (temp file + rename + fsync) and keep the previous file
//! as a `.bak` copy. Loads never observe a half-written record.

use crate::db::{write_atomic, ProfileLayout};
use crate::error::StoreError;
use crate::models::{CredentialSet, ProfileId};

#[derive(Debug, Clone)]
pub struct CredentialStore {
    layout: ProfileLayout,
}

impl CredentialStore {
    pub fn new(layout: ProfileLayout) -> Self {
        Self { layout }
    }

    /// Load the profile's credentials. `StoreError::NotFound` if none exist.
    pub async fn load(&self, id: &ProfileId) -> Result<CredentialSet, StoreError> {
        let path = self.layout.credentials_file(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("credentials for profile {id}")));
            }
            Err(e) => return Err(e.into()),
        };
        parse_credentials(&path, &raw)
    }

    /// Atomically replace the profile's credentials.
    pub async fn save(
        &self,
        id: &ProfileId,
        credentials: &CredentialSet,
    ) -> Result<(), StoreError> {
        let path = self.layout.credentials_file(id);
        let backup = self.layout.credentials_backup(id);
        let body = serde_json::to_vec_pretty(credentials)?;

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            if path.exists() {
                if let Err(e) = std::fs::copy(&path, &backup) {
                    tracing::warn!(error = %e, "Failed to back up credentials, continuing");
                }
            }
            write_atomic(&path, &body)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        tracing::debug!(profile_id = %id, "Credentials saved");
        Ok(())
    }
}

fn parse_credentials(path: &std::path::Path, raw: &str) -> Result<CredentialSet, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    if raw.trim().is_empty() {
        return Err(corrupt("file is empty"));
    }
    let credentials: CredentialSet =
        serde_json::from_str(raw).map_err(|e| corrupt(&format!("invalid JSON: {e}")))?;
    if credentials.refresh_token.trim().is_empty() {
        return Err(corrupt("empty refresh_token"));
    }
    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::credentials::parse_scopes;
    use chrono::{TimeZone, Utc};

    fn creds(access: &str) -> CredentialSet {
        CredentialSet {
            client_id: "23ABCD".to_string(),
            client_secret: "secret".to_string(),
            access_token: access.to_string(),
            refresh_token: format!("refresh-{access}"),
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            scopes: parse_scopes("activity heartrate"),
            user_id: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(ProfileLayout::new(dir.path()));
        let id = ProfileId::parse("nobody").unwrap();

        assert!(matches!(store.load(&id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_then_load_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProfileLayout::new(dir.path());
        let store = CredentialStore::new(layout.clone());
        let id = ProfileId::parse("alice").unwrap();

        store.save(&id, &creds("first")).await.unwrap();
        store.save(&id, &creds("second")).await.unwrap();

        assert_eq!(store.load(&id).await.unwrap(), creds("second"));
        let backup = std::fs::read_to_string(layout.credentials_backup(&id)).unwrap();
        assert!(backup.contains("\"first\""));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ProfileLayout::new(dir.path());
        let store = CredentialStore::new(layout.clone());
        let id = ProfileId::parse("alice").unwrap();
        let path = layout.credentials_file(&id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        std::fs::write(&path, "").unwrap();
        assert!(matches!(store.load(&id).await, Err(StoreError::Corrupt { .. })));

        std::fs::write(&path, "{\"access_token\": \"x\"").unwrap();
        assert!(matches!(store.load(&id).await, Err(StoreError::Corrupt { .. })));
    }
}
