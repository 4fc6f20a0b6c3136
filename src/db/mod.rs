// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Storage layer: per-profile flat files under `<data_dir>/profiles/<id>/`.
//!
//! ```text
//! profiles/
//! └── alice/
//!     ├── auth/credentials.json      # CredentialSet (+ .bak of the previous one)
//!     └── csv/fitbit_activity.csv    # one CSV per metric
//! ```

pub mod credential_store;
pub mod metric_store;
pub mod profiles;

pub use credential_store::CredentialStore;
pub use metric_store::{CsvMetricStore, MetricStore, UpsertSummary};
pub use profiles::ProfileRegistry;

use crate::models::{Metric, ProfileId};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File and directory names inside a profile.
pub mod files {
    pub const AUTH_DIR: &str = "auth";
    pub const CSV_DIR: &str = "csv";
    pub const CREDENTIALS: &str = "credentials.json";
    pub const CREDENTIALS_BACKUP: &str = "credentials.json.bak";
}

/// Resolves on-disk paths for profiles.
#[derive(Debug, Clone)]
pub struct ProfileLayout {
    root: PathBuf,
}

impl ProfileLayout {
    /// `root` is the directory containing one folder per profile.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile_dir(&self, id: &ProfileId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn credentials_file(&self, id: &ProfileId) -> PathBuf {
        self.profile_dir(id).join(files::AUTH_DIR).join(files::CREDENTIALS)
    }

    pub fn credentials_backup(&self, id: &ProfileId) -> PathBuf {
        self.profile_dir(id)
            .join(files::AUTH_DIR)
            .join(files::CREDENTIALS_BACKUP)
    }

    pub fn metric_file(&self, id: &ProfileId, metric: Metric) -> PathBuf {
        self.profile_dir(id).join(files::CSV_DIR).join(metric.file_name())
    }
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial one. Blocking; call from `spawn_blocking`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
