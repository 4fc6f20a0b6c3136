// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use chrono::{Duration, NaiveDate, Utc};
use fitbaus_sync::config::Config;
use fitbaus_sync::db::{CredentialStore, CsvMetricStore, ProfileLayout};
use fitbaus_sync::models::{CredentialSet, JobId, ProfileId};
use fitbaus_sync::routes::create_router;
use fitbaus_sync::services::{JobOrchestrator, ProgressEvent, ReqwestTransport, SyncObserver};
use fitbaus_sync::AppState;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

/// A temp data dir plus a mock Fitbit API. Dropping it removes both.
pub struct TestEnv {
    pub dir: TempDir,
    pub server: MockServer,
    pub config: Config,
}

#[allow(dead_code)]
impl TestEnv {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let server = MockServer::start().await;
        let config = Config::test_default(dir.path(), &server.uri());
        Self {
            dir,
            server,
            config,
        }
    }

    pub fn layout(&self) -> ProfileLayout {
        ProfileLayout::new(self.config.profiles_dir())
    }

    pub fn store(&self) -> CsvMetricStore {
        CsvMetricStore::new(self.layout())
    }

    /// Create a profile whose access token expires `expires_in` from now.
    pub async fn seed_profile(
        &self,
        name: &str,
        access_token: &str,
        expires_in: Duration,
    ) -> ProfileId {
        let id = ProfileId::parse(name).expect("valid profile id");
        let now = Utc::now();
        let credentials = CredentialSet {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            access_token: access_token.to_string(),
            refresh_token: format!("refresh-{name}"),
            expires_at: now + expires_in,
            scopes: BTreeSet::from(["activity".to_string(), "sleep".to_string()]),
            user_id: None,
            created_at: now,
        };
        CredentialStore::new(self.layout())
            .save(&id, &credentials)
            .await
            .expect("seed credentials");
        id
    }

    /// Profile with a token valid for the next hour.
    pub async fn fresh_profile(&self, name: &str, access_token: &str) -> ProfileId {
        self.seed_profile(name, access_token, Duration::hours(1)).await
    }

    pub async fn load_credentials(&self, id: &ProfileId) -> CredentialSet {
        CredentialStore::new(self.layout())
            .load(id)
            .await
            .expect("credentials on disk")
    }

    pub fn orchestrator(&self, observers: Vec<Arc<dyn SyncObserver>>) -> JobOrchestrator {
        let transport = Arc::new(ReqwestTransport::new(self.config.http_timeout).expect("client"));
        JobOrchestrator::new(&self.config, transport, Arc::new(self.store()), observers)
    }

    /// Router and state backed by this environment.
    pub fn app(&self) -> (axum::Router, Arc<AppState>) {
        let transport = Arc::new(ReqwestTransport::new(self.config.http_timeout).expect("client"));
        let state = Arc::new(AppState::new(self.config.clone(), transport, Vec::new()));
        (create_router(state.clone()), state)
    }

    /// Token endpoint answering every refresh with `access_token`.
    pub async fn mock_token_endpoint(&self, access_token: &str) {
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(access_token)))
            .mount(&self.server)
            .await;
    }
}

#[allow(dead_code)]
pub fn token_body(access_token: &str) -> serde_json::Value {
    json!({
        "access_token": access_token,
        "refresh_token": format!("rotated-{access_token}"),
        "expires_in": 28800,
        "scope": "activity heartrate sleep profile",
        "token_type": "Bearer",
        "user_id": "ABC123"
    })
}

#[allow(dead_code)]
pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

#[allow(dead_code)]
pub fn steps_body(days: &[(NaiveDate, u32)]) -> serde_json::Value {
    let entries: Vec<_> = days
        .iter()
        .map(|(d, v)| json!({ "dateTime": d.to_string(), "value": v.to_string() }))
        .collect();
    json!({ "activities-steps": entries })
}

#[allow(dead_code)]
pub fn sedentary_body(days: &[(NaiveDate, u32)]) -> serde_json::Value {
    let entries: Vec<_> = days
        .iter()
        .map(|(d, v)| json!({ "dateTime": d.to_string(), "value": v.to_string() }))
        .collect();
    json!({ "activities-minutesSedentary": entries })
}

#[allow(dead_code)]
pub fn heart_body(days: &[(NaiveDate, u32)]) -> serde_json::Value {
    let entries: Vec<_> = days
        .iter()
        .map(|(d, v)| json!({ "dateTime": d.to_string(), "value": { "restingHeartRate": v } }))
        .collect();
    json!({ "activities-heart": entries })
}

#[allow(dead_code)]
pub fn hrv_body(days: &[(NaiveDate, f64)]) -> serde_json::Value {
    let entries: Vec<_> = days
        .iter()
        .map(|(d, v)| {
            json!({ "dateTime": d.to_string(), "value": { "dailyRmssd": v, "deepRmssd": v } })
        })
        .collect();
    json!({ "hrv": entries })
}

#[allow(dead_code)]
pub fn sleep_body(days: &[(NaiveDate, u32)]) -> serde_json::Value {
    let entries: Vec<_> = days
        .iter()
        .enumerate()
        .map(|(i, (d, asleep))| {
            json!({
                "logId": 1000 + i,
                "dateOfSleep": d.to_string(),
                "isMainSleep": true,
                "minutesAsleep": asleep,
                "timeInBed": asleep + 30,
                "levels": { "summary": { "deep": { "minutes": 60 } } }
            })
        })
        .collect();
    json!({ "sleep": entries })
}

/// Observer that records every event, for assertions.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(ProfileId, JobId, ProgressEvent)>>,
}

#[allow(dead_code)]
impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(ProfileId, JobId, ProgressEvent)> {
        self.events.lock().unwrap().clone()
    }

    /// Profiles in the order their jobs reached a terminal state.
    pub fn terminal_order(&self) -> Vec<ProfileId> {
        self.events()
            .into_iter()
            .filter(|(_, _, e)| matches!(e, ProgressEvent::JobTerminal { .. }))
            .map(|(p, _, _)| p)
            .collect()
    }
}

impl SyncObserver for RecordingObserver {
    fn on_event(&self, profile: &ProfileId, job: JobId, event: &ProgressEvent) {
        self.events
            .lock()
            .unwrap()
            .push((profile.clone(), job, event.clone()));
    }
}
