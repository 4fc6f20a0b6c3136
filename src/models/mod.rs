// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod credentials;
pub mod job;
pub mod metric;
pub mod profile;

pub use credentials::{CredentialSet, TokenGrant};
pub use job::{FetchJob, JobId, JobStatus, TaskOutcome, TaskReport};
pub use metric::{DateWindow, Metric, MetricRecord};
pub use profile::{ProfileId, ProfileStatus};
