// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! fitbaus-sync: keep per-profile Fitbit metrics in sync.
//!
//! This crate provides the synchronization engine (credentials, token
//! refresh, rate limiting, job orchestration) plus the HTTP API and CLI
//! that drive it.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::{CsvMetricStore, ProfileLayout};
use services::{HttpTransport, JobOrchestrator, ProgressBoard, SyncObserver};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: JobOrchestrator,
    /// Recent progress lines per job, for the status endpoint
    pub board: Arc<ProgressBoard>,
}

impl AppState {
    /// Wire the engine against CSV storage under `config.data_dir`.
    pub fn new(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        mut observers: Vec<Arc<dyn SyncObserver>>,
    ) -> Self {
        let board = Arc::new(ProgressBoard::new());
        observers.push(board.clone());

        let store = Arc::new(CsvMetricStore::new(ProfileLayout::new(config.profiles_dir())));
        let orchestrator = JobOrchestrator::new(&config, transport, store, observers);

        Self {
            config,
            orchestrator,
            board,
        }
    }
}
