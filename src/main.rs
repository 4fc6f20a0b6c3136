// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! fitbaus-sync server and batch CLI
//!
//! Keeps per-profile Fitbit metrics (steps, resting heart rate, HRV, sleep)
//! in local CSV files, either from the command line or behind the dashboard
//! API.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fitbaus_sync::{
    config::Config,
    models::{DateWindow, FetchJob, JobStatus, Metric, ProfileId, ProfileStatus, TaskOutcome},
    services::{ConsoleObserver, HttpTransport, ReqwestTransport, SyncObserver},
    time_utils::{parse_date, yesterday},
    AppState,
};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fitbaus-sync")]
#[command(about = "Synchronize Fitbit metrics for local profiles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dashboard API server
    Serve,

    /// Fetch metrics for one or more profiles
    Sync {
        /// Single profile to sync
        #[arg(long, conflicts_with_all = ["profiles", "all_profiles"])]
        profile: Option<String>,

        /// Several profiles to sync
        #[arg(long, num_args = 1.., conflicts_with = "all_profiles")]
        profiles: Vec<String>,

        /// Every profile with stored credentials
        #[arg(long)]
        all_profiles: bool,

        /// First day to fetch (YYYY-MM-DD); incremental when omitted
        #[arg(long)]
        start: Option<String>,

        /// Last day to fetch (YYYY-MM-DD); defaults to yesterday
        #[arg(long, requires = "start")]
        end: Option<String>,

        /// Metrics to fetch: steps, rhr, hrv, sleep (default: all)
        #[arg(long = "metric", num_args = 1..)]
        metrics: Vec<String>,
    },

    /// List known profiles
    Profiles,

    /// Delete a profile's credentials and data
    Reset {
        #[arg(long)]
        profile: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(matches!(cli.command, Commands::Serve));

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let transport: Arc<dyn HttpTransport> = Arc::new(
        ReqwestTransport::new(config.http_timeout).context("Failed to build HTTP client")?,
    );

    match cli.command {
        Commands::Serve => {
            let state = Arc::new(AppState::new(config, transport, Vec::new()));
            serve(state).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync {
            profile,
            profiles,
            all_profiles,
            start,
            end,
            metrics,
        } => {
            let observers: Vec<Arc<dyn SyncObserver>> = vec![Arc::new(ConsoleObserver::new())];
            let state = AppState::new(config, transport, observers);
            let range = date_range(start.as_deref(), end.as_deref())?;
            let metrics = parse_metrics(&metrics)?;
            sync(&state, profile, profiles, all_profiles, range, &metrics).await
        }
        Commands::Profiles => {
            let state = AppState::new(config, transport, Vec::new());
            let profiles = state.orchestrator.registry().list().await?;
            if profiles.is_empty() {
                println!("No profiles under {}", state.config.profiles_dir().display());
            }
            for (id, status) in profiles {
                let label = match status {
                    ProfileStatus::Credentialed => "credentialed",
                    ProfileStatus::Uncredentialed => "no credentials",
                };
                println!("{id:<24} {label}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset { profile } => {
            let state = AppState::new(config, transport, Vec::new());
            let id = ProfileId::parse(&profile).with_context(|| format!("{profile:?}"))?;
            state.orchestrator.delete_profile(&id).await?;
            println!("Profile {id} reset");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!(
        port = state.config.port,
        data_dir = %state.config.data_dir.display(),
        "Starting fitbaus-sync API"
    );

    let orchestrator = state.orchestrator.clone();
    let app = fitbaus_sync::routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Without a signal handler there is nothing to wait for.
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down, cancelling running jobs");
                orchestrator.cancel_all().await;
            }
        })
        .await?;
    Ok(())
}

async fn sync(
    state: &AppState,
    profile: Option<String>,
    profiles: Vec<String>,
    all_profiles: bool,
    range: Option<DateWindow>,
    metrics: &[Metric],
) -> Result<ExitCode> {
    let registry = state.orchestrator.registry();
    let targets: Vec<ProfileId> = if all_profiles {
        registry.credentialed().await?
    } else {
        let mut ids = Vec::new();
        for raw in profile.iter().chain(profiles.iter()) {
            let id = ProfileId::parse(raw).with_context(|| format!("{raw:?}"))?;
            if !registry.exists(&id).await {
                bail!("Profile {id} not found");
            }
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    };
    if targets.is_empty() {
        bail!("No profiles selected (use --profile, --profiles or --all-profiles)");
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let orchestrator = state.orchestrator.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
                eprintln!("Interrupted, cancelling...");
                orchestrator.cancel_all().await;
            }
        });
    }

    tracing::info!(profiles = targets.len(), "Starting sync");
    let jobs = state.orchestrator.run_many(targets, metrics, range).await;
    for job in &jobs {
        print_summary(job);
    }

    Ok(exit_code(&jobs, interrupted.load(Ordering::SeqCst)))
}

fn print_summary(job: &FetchJob) {
    println!("{}: {}", job.profile_id, job.status);
    for task in &job.tasks {
        let detail = match &task.outcome {
            TaskOutcome::Succeeded { records, windows } => {
                format!("{records} records in {windows} requests")
            }
            TaskOutcome::Failed { message, .. } => format!("failed: {message}"),
            TaskOutcome::Skipped { reason } => format!("skipped: {reason}"),
            other => format!("{other:?}"),
        };
        println!("  {:<6} {detail}", task.metric.as_str());
    }
    if let Some(error) = &job.error {
        println!("  error: {error}");
    }
}

fn exit_code(jobs: &[FetchJob], interrupted: bool) -> ExitCode {
    let any = |status: JobStatus| jobs.iter().any(|j| j.status == status);
    if interrupted || any(JobStatus::Cancelled) {
        ExitCode::from(130)
    } else if any(JobStatus::Failed) {
        ExitCode::FAILURE
    } else if any(JobStatus::Partial) {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

fn date_range(start: Option<&str>, end: Option<&str>) -> Result<Option<DateWindow>> {
    let Some(start) = start else {
        return Ok(None);
    };
    let parse = |raw: &str| parse_date(raw).with_context(|| format!("Invalid date {raw:?}"));
    let start = parse(start)?;
    let end = match end {
        Some(raw) => parse(raw)?,
        None => yesterday(),
    };
    DateWindow::new(start, end)
        .map(Some)
        .with_context(|| format!("Start {start} is after end {end}"))
}

fn parse_metrics(raw: &[String]) -> Result<Vec<Metric>> {
    if raw.is_empty() {
        return Ok(Metric::ALL.to_vec());
    }
    raw.iter()
        .flat_map(|s| s.split(','))
        .map(|s| s.parse::<Metric>().map_err(anyhow::Error::msg))
        .collect()
}

/// Initialize logging: flattened JSON for the server, compact text for the CLI.
fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fitbaus_sync=debug,info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(true)
                    .flatten_event(true),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
