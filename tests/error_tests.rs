// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::http::StatusCode;
use axum::response::IntoResponse;
use fitbaus_sync::error::{AppError, ErrorKind, StoreError, SyncError};

fn status_of(err: AppError) -> StatusCode {
    err.into_response().status()
}

#[test]
fn test_only_auth_failures_are_job_fatal() {
    assert!(SyncError::AuthFailure("no file".into()).is_job_fatal());
    assert!(SyncError::ReauthorizationRequired("invalid_grant".into()).is_job_fatal());

    let non_fatal = [
        SyncError::RefreshTransientFailure {
            attempts: 4,
            last_error: "HTTP 503".into(),
        },
        SyncError::RateLimited { waits: 3 },
        SyncError::HttpTransientFailure {
            attempts: 3,
            last_error: "timeout".into(),
        },
        SyncError::HttpPermanentFailure {
            status: 404,
            body: String::new(),
        },
        SyncError::StorageFailure("disk full".into()),
        SyncError::Cancelled,
    ];
    for err in non_fatal {
        assert!(!err.is_job_fatal(), "{err:?}");
    }
}

#[test]
fn test_error_kind_serializes_snake_case() {
    let kind = SyncError::HttpPermanentFailure {
        status: 403,
        body: "forbidden".into(),
    }
    .kind();
    assert_eq!(kind, ErrorKind::HttpPermanentFailure);
    assert_eq!(
        serde_json::to_value(kind).unwrap(),
        serde_json::json!("http_permanent_failure")
    );
}

#[test]
fn test_app_error_status_codes() {
    assert_eq!(status_of(AppError::NotFound("job".into())), StatusCode::NOT_FOUND);
    assert_eq!(status_of(AppError::BadRequest("date".into())), StatusCode::BAD_REQUEST);
    assert_eq!(status_of(AppError::Conflict("done".into())), StatusCode::CONFLICT);
    assert_eq!(
        status_of(SyncError::ReauthorizationRequired("x".into()).into()),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        status_of(SyncError::RateLimited { waits: 3 }.into()),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        status_of(StoreError::NotFound("alice".into()).into()),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        status_of(
            StoreError::Corrupt {
                path: "x.csv".into(),
                reason: "bad header".into()
            }
            .into()
        ),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_store_error_becomes_storage_failure() {
    let err: SyncError = StoreError::NotFound("credentials".into()).into();
    assert_eq!(err.kind(), ErrorKind::StorageFailure);
}
