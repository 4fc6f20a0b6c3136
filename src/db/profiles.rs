// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Profile discovery and lifecycle.

use crate::db::{CredentialStore, ProfileLayout};
use crate::error::StoreError;
use crate::models::{ProfileId, ProfileStatus};

#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    layout: ProfileLayout,
    credentials: CredentialStore,
}

impl ProfileRegistry {
    pub fn new(layout: ProfileLayout) -> Self {
        Self {
            credentials: CredentialStore::new(layout.clone()),
            layout,
        }
    }

    /// Profiles present on disk, sorted. Directories whose names are not
    /// valid profile ids are ignored.
    pub async fn discover(&self) -> Result<Vec<ProfileId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(self.layout.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(ProfileId::parse) {
                Some(Ok(id)) => found.push(id),
                _ => tracing::debug!(entry = ?name, "Ignoring non-profile directory"),
            }
        }
        found.sort();
        Ok(found)
    }

    pub async fn exists(&self, id: &ProfileId) -> bool {
        tokio::fs::metadata(self.layout.profile_dir(id))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Whether the profile holds a loadable credential set.
    ///
    /// A corrupt credentials file counts as uncredentialed; it is logged
    /// rather than surfaced so listing profiles never fails on one bad entry.
    pub async fn validate(&self, id: &ProfileId) -> ProfileStatus {
        match self.credentials.load(id).await {
            Ok(_) => ProfileStatus::Credentialed,
            Err(StoreError::NotFound(_)) => ProfileStatus::Uncredentialed,
            Err(e) => {
                tracing::warn!(profile_id = %id, error = %e, "Unreadable credentials");
                ProfileStatus::Uncredentialed
            }
        }
    }

    /// Every profile with its credential status.
    pub async fn list(&self) -> Result<Vec<(ProfileId, ProfileStatus)>, StoreError> {
        let mut out = Vec::new();
        for id in self.discover().await? {
            let status = self.validate(&id).await;
            out.push((id, status));
        }
        Ok(out)
    }

    /// Profiles eligible for a sync run.
    pub async fn credentialed(&self) -> Result<Vec<ProfileId>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|(_, status)| *status == ProfileStatus::Credentialed)
            .map(|(id, _)| id)
            .collect())
    }

    /// Create the profile directory if missing.
    pub async fn create(&self, id: &ProfileId) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.layout.profile_dir(id)).await?;
        Ok(())
    }

    /// Delete the profile's credentials and data.
    pub async fn reset_profile(&self, id: &ProfileId) -> Result<(), StoreError> {
        let dir = self.layout.profile_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(profile_id = %id, "Profile reset");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("profile {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}
