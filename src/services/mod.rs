// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - sync engine.

pub mod backoff;
pub mod fitbit;
pub mod orchestrator;
pub mod progress;
pub mod rate_governor;
pub mod token_manager;
pub mod transport;
pub mod wait;

pub use orchestrator::{CancelError, JobOrchestrator, SubmitError};
pub use progress::{ConsoleObserver, ProgressBoard, ProgressEvent, SyncObserver};
pub use rate_governor::{Decision, RateGovernor, RateLimitState};
pub use token_manager::{extract_code, TokenManager};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, TransportError};
pub use wait::{Countdown, WaitContext, WaitInstruction, WaitReason};
