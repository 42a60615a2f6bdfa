//! stagewarden - Stage orchestration and SLO enforcement for clip analysis
//!
//! Runs the Observer -> Thinker -> Doer -> Dispatcher pipeline over a
//! bounded worker pool, with per-stage watchdogs, degradation, audit and
//! incident escalation, behind an HTTP operator surface.
//!
//! # Usage
//!
//! ```bash
//! # Serve the API with stub models, submitting clips over HTTP
//! cargo run --release
//!
//! # Feed 50 synthetic clips with the dispatcher down
//! cargo run --release -- --demo-clips 50 --scenario dispatcher_outage
//!
//! # JSON logs for ingestion
//! RUST_LOG=stagewarden=debug cargo run --release -- --log-json
//! ```
//!
//! # Environment Variables
//!
//! - `STAGEWARDEN_CONFIG`: Path to the pipeline TOML config
//! - `STAGEWARDEN_CORS_ORIGINS`: Comma-separated origins allowed by CORS
//! - `RUST_LOG`: Logging level (default: info)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stagewarden::api::{create_app, ApiState};
use stagewarden::capabilities::{
    ActionExecutor, Capabilities, ConsoleExecutor, IncidentBackend, MemoryIncidentBackend,
    StaticPolicyLookup, WebhookExecutor, WebhookIncidentBackend,
};
use stagewarden::config::{self, defaults, PipelineConfig};
use stagewarden::engine::Engine;
use stagewarden::faults::FaultScenario;
use stagewarden::pipeline::{ClipIntake, IntakeError};
use stagewarden::types::Clip;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "stagewarden")]
#[command(about = "Stage orchestration and SLO enforcement engine for clip analysis pipelines")]
#[command(version)]
struct CliArgs {
    /// Override the server address (default from config: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Path to a pipeline TOML config (overrides STAGEWARDEN_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the worker pool size
    #[arg(short, long)]
    workers: Option<usize>,

    /// Submit N synthetic clips at startup (0 = none)
    #[arg(long, default_value = "0")]
    demo_clips: u64,

    /// Interval between synthetic clips
    #[arg(long, default_value_t = defaults::DEMO_CLIP_INTERVAL_MS)]
    clip_interval_ms: u64,

    /// Fault scenario to activate at startup, e.g. `dispatcher_outage`,
    /// `prompt_injection`, `long_running_observer`, `slow_stage:thinker:2500`
    #[arg(long, value_name = "SCENARIO")]
    scenario: Vec<String>,

    /// JSON rule -> citations table for the policy lookup
    #[arg(long, value_name = "FILE")]
    policies: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "STAGEWARDEN_LOG_JSON")]
    log_json: bool,
}

// ============================================================================
// Logging
// ============================================================================

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(args: &CliArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PipelineConfig::load(),
    };
    if let Some(addr) = &args.addr {
        config.server.addr.clone_from(addr);
    }
    if let Some(workers) = args.workers {
        config.workers.pool_size = workers;
    }
    config.validate().context("invalid pipeline configuration")?;
    Ok(config)
}

/// Pick adapters from config: webhooks when URLs are set, local otherwise.
fn build_adapters(
    config: &PipelineConfig,
    policies: Option<&PathBuf>,
) -> Result<(Capabilities, Arc<dyn IncidentBackend>)> {
    let mut capabilities = Capabilities::stub();

    if let Some(path) = policies {
        capabilities.policy = Arc::new(
            StaticPolicyLookup::from_json_file(path)
                .with_context(|| format!("loading policies from {}", path.display()))?,
        );
        info!(path = %path.display(), "Policy table loaded");
    }

    let executor: Arc<dyn ActionExecutor> = match &config.dispatcher.webhook_url {
        Some(url) => {
            info!(url = %url, "Dispatcher: webhook executor");
            Arc::new(WebhookExecutor::new(url.as_str())?)
        }
        None => {
            info!("Dispatcher: console executor");
            Arc::new(ConsoleExecutor)
        }
    };
    capabilities.executor = executor;

    let backend: Arc<dyn IncidentBackend> = match &config.escalation.webhook_url {
        Some(url) => {
            info!(url = %url, "Escalation: webhook incident backend");
            Arc::new(WebhookIncidentBackend::new(url.as_str())?)
        }
        None => {
            info!("Escalation: in-memory incident backend");
            Arc::new(MemoryIncidentBackend::new())
        }
    };

    Ok((capabilities, backend))
}

// ============================================================================
// Task Names for Supervisor Logging
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    WorkerPool,
    Escalator,
    DemoProducer,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpServer => write!(f, "HttpServer"),
            Self::WorkerPool => write!(f, "WorkerPool"),
            Self::Escalator => write!(f, "Escalator"),
            Self::DemoProducer => write!(f, "DemoProducer"),
        }
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Tags cycled through by the synthetic producer.
///
/// A mix of clean clips, clear violations, uncertain readings and a
/// malformed Observer output so every pipeline path shows up.
const DEMO_TAG_SETS: &[&[&str]] = &[
    &[],
    &["walkway_violation"],
    &["restricted_area_entry", "machine_operating"],
    &["uncertain:unsafe_proximity_to_machine", "machine_operating"],
    &["panel_open"],
    &["guard_open", "machine_operating"],
    &["observer_malformed"],
];

const DEMO_SOURCES: &[&str] = &["cam-dock-01", "cam-press-02", "cam-yard-03"];

/// Spawn the synthetic clip producer.
fn spawn_demo_producer(
    task_set: &mut JoinSet<Result<TaskName>>,
    intake: ClipIntake,
    count: u64,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[DemoProducer] Submitting {} synthetic clips every {:?}", count, interval);
        let mut ticker = tokio::time::interval(interval);
        for i in 0..count {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let idx = usize::try_from(i).unwrap_or(0);
            let source = DEMO_SOURCES[idx % DEMO_SOURCES.len()];
            let tags = DEMO_TAG_SETS[idx % DEMO_TAG_SETS.len()];
            let start = chrono::Utc::now();
            let clip = Clip::new(source, i, start, start + chrono::Duration::seconds(defaults::DEMO_CLIP_SECONDS))
                .with_tags(tags.iter().copied());
            match intake.submit(clip) {
                Ok(()) => {}
                Err(IntakeError::QueueFull) => warn!("[DemoProducer] Intake full, clip {} dropped", i),
                Err(IntakeError::Closed) => break,
            }
        }
        info!("[DemoProducer] Done");
        Ok(TaskName::DemoProducer)
    });
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring...");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("Supervisor: task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("Supervisor: task failed with error: {:#}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("Supervisor: task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("Supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Let the rest drain so in-flight clips finish their audit trail.
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => info!("Supervisor: task {} stopped", task_name),
            Ok(Err(e)) => {
                error!("Supervisor: task failed during shutdown: {:#}", e);
                return Err(e);
            }
            Err(e) => return Err(anyhow::anyhow!("Task panicked during shutdown: {}", e)),
        }
    }

    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let pipeline_config = load_config(&args)?;
    info!(
        service = %pipeline_config.service.name,
        environment = %pipeline_config.service.environment,
        workers = pipeline_config.workers.pool_size,
        end_to_end_ms = pipeline_config.slo.end_to_end_ms,
        "stagewarden starting"
    );
    config::init(pipeline_config);
    let pipeline_config = config::get().clone();

    let (capabilities, backend) = build_adapters(&pipeline_config, args.policies.as_ref())?;
    let engine = Engine::build(pipeline_config, capabilities, backend)?;

    for raw in &args.scenario {
        let scenario = FaultScenario::parse(raw, &engine.config.slo)
            .map_err(|e| anyhow::anyhow!(e))
            .context("--scenario")?;
        engine.faults.activate(scenario);
    }

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let (intake, pool) = engine.worker_pool();
    let app = create_app(ApiState::from_engine(&engine, intake.clone()));
    let addr = engine.config.server.addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "HTTP API listening");

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    spawn_http_server(&mut task_set, listener, app, cancel_token.clone());

    let pool_cancel = cancel_token.clone();
    let readiness = Arc::clone(&engine.readiness);
    task_set.spawn(async move {
        let processed = pool.run(pool_cancel, readiness).await?;
        info!("[WorkerPool] Stopped after {} clips", processed);
        Ok(TaskName::WorkerPool)
    });

    let escalator = Arc::clone(&engine.escalator);
    let escalator_cancel = cancel_token.clone();
    task_set.spawn(async move {
        escalator.run(escalator_cancel).await?;
        Ok(TaskName::Escalator)
    });

    if args.demo_clips > 0 {
        spawn_demo_producer(
            &mut task_set,
            intake,
            args.demo_clips,
            Duration::from_millis(args.clip_interval_ms.max(1)),
            cancel_token.clone(),
        );
    }

    run_supervisor(&mut task_set, cancel_token).await?;

    info!("stagewarden shutdown complete");
    Ok(())
}
