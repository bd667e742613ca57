mod admin;
mod config;
mod llm;
mod shutdown;
mod store;
mod telemetry;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use conductor_core::paths::expand_tilde;
use conductor_core::tool::ToolRegistry;
use conductor_engine::{Engine, EngineConfig, LogOptions, PromptSpec};
use conductor_guard::approvals::ApprovalStore;
use conductor_guard::approvals_sqlite::SqliteApprovalStore;
use conductor_guard::audit::{AuditSink, JsonlAuditSink};
use conductor_guard::Guard;

use crate::store::TaskStore;
use crate::worker::Worker;

/// Conductor daemon — guarded agentic task runner with durable approvals.
#[derive(Parser, Debug)]
#[command(name = "conductord", version, about)]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Increase log verbosity (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Load and validate config
    // -----------------------------------------------------------------------
    let cfg = config::load_config(&cli.config)?;
    config::validate_config(&cfg)?;

    if cli.validate {
        println!("config is valid");
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 2. Initialize tracing / OTEL
    // -----------------------------------------------------------------------
    let telemetry_guard = telemetry::init_telemetry(&cfg.otel, cli.verbose)?;

    info!(bind = %cfg.daemon.bind_addr, "conductord starting");

    // -----------------------------------------------------------------------
    // 3. Build the guard: audit sink + approval store
    // -----------------------------------------------------------------------
    let audit: Option<Arc<dyn AuditSink>> = if cfg.guard.audit.jsonl_path.trim().is_empty() {
        None
    } else {
        Some(Arc::new(JsonlAuditSink::new(
            &cfg.guard.audit.jsonl_path,
            cfg.guard.audit.rotate_max_bytes,
        )?))
    };
    let approvals: Option<Arc<dyn ApprovalStore>> = if cfg.guard.approvals.enabled {
        let path = expand_tilde(&cfg.guard.approvals.db_path);
        Some(Arc::new(SqliteApprovalStore::open(&path).await?))
    } else {
        None
    };
    let guard = Arc::new(Guard::new(cfg.guard.clone(), approvals, audit));

    // -----------------------------------------------------------------------
    // 4. Build the engine: LLM client + tool registry
    // -----------------------------------------------------------------------
    let llm_client = llm::build_llm_client(&cfg.llm)?;
    // Host-provided tools register here; the core ships none of its own.
    let tools = Arc::new(ToolRegistry::new());

    let engine_config = EngineConfig {
        default_model: cfg.daemon.default_model.clone(),
        default_max_steps: cfg.engine.max_steps,
        parse_failure_budget: cfg.engine.parse_failure_budget,
        max_observation_bytes: cfg.engine.max_observation_bytes,
        tool_timeout: Duration::from_secs(cfg.engine.tool_timeout_secs),
        plan_required: cfg.engine.plan_required,
        log: LogOptions {
            include_thoughts: cfg.engine.include_thoughts,
            redact_keys: {
                let mut keys = LogOptions::default().redact_keys;
                keys.extend(cfg.engine.redact_keys.iter().cloned());
                keys
            },
        },
    };
    let engine = Arc::new(
        Engine::new(llm_client, tools, engine_config, PromptSpec::default())
            .with_guard(guard.clone()),
    );

    // -----------------------------------------------------------------------
    // 5. Task store + worker
    // -----------------------------------------------------------------------
    let task_store = TaskStore::new(
        cfg.daemon.queue_capacity,
        cfg.daemon.default_model.clone(),
        Duration::from_secs(cfg.daemon.task_timeout_secs),
        Duration::from_secs(cfg.daemon.completed_ttl_secs),
    );
    let worker_handle = tokio::spawn(Worker::new(task_store.clone(), engine).run());

    // -----------------------------------------------------------------------
    // 6. Admin API server
    // -----------------------------------------------------------------------
    let admin_state = admin::AppState {
        store: task_store.clone(),
        guard,
        start_time: Instant::now(),
    };
    let admin_router = admin::admin_router(admin_state);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (reload_tx, _reload_rx) = watch::channel(());

    let listener = TcpListener::bind(&cfg.daemon.bind_addr).await?;
    info!(bind = %cfg.daemon.bind_addr, "admin API listening");

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, admin_router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
        {
            error!("admin API server error: {e}");
        }
    });

    // -----------------------------------------------------------------------
    // 7. Signal handling and main wait
    // -----------------------------------------------------------------------
    tokio::spawn(shutdown::signal_listener(shutdown_tx.clone(), reload_tx));

    let mut shutdown_watch = shutdown_tx.subscribe();
    info!("entering main loop");
    loop {
        shutdown_watch.changed().await.ok();
        if *shutdown_watch.borrow() {
            info!("shutdown signal received, beginning graceful shutdown");
            break;
        }
    }

    // -----------------------------------------------------------------------
    // 8. Graceful shutdown: close the store (cancels in-flight tasks),
    //    drain the worker, stop the admin API, flush telemetry.
    // -----------------------------------------------------------------------
    info!("graceful shutdown: closing task store");
    task_store.close();

    info!("graceful shutdown: waiting for worker");
    let _ = tokio::time::timeout(Duration::from_secs(30), worker_handle).await;

    info!("graceful shutdown: stopping admin API");
    let _ = shutdown_tx.send(true);
    let _ = admin_handle.await;

    info!("graceful shutdown: flushing telemetry");
    telemetry_guard.flush();

    info!("conductord stopped");
    Ok(())
}
