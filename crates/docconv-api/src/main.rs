//! docconv-api - HTTP API server for the docconv conversion queue

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docconv_api::{parse_allowed_origins, router, AppState};
use docconv_core::{defaults, JobStore, PageMode};
use docconv_db::{create_pool_with_config, log_pool_metrics, MemoryJobStore, PgJobStore, PoolConfig};
use docconv_jobs::{
    builtin_dispatcher, input_cleanup_from_env, CancelRegistry, JobService, ResultStore,
    RetentionSweeper, RetryPolicy, ToolPaths, WorkerBuilder, WorkerConfig, WorkerEvent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "docconv_api=debug,docconv_jobs=info,docconv_db=info,tower_http=debug".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    // Optionally create a file appender with daily rotation
    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("docconv-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false)); // no ANSI in files
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // Console-only output
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    // Get configuration from environment
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults::SERVER_PORT);

    let store = open_store().await?;

    // Converters and job pipeline
    let job_timeout = std::env::var("JOB_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(defaults::JOB_TIMEOUT_SECS);
    let dispatcher = builtin_dispatcher(&ToolPaths::from_env())
        .with_timeout(Duration::from_secs(job_timeout));
    let results = ResultStore::from_env();
    let input_cleanup = input_cleanup_from_env();
    let cancellations = CancelRegistry::new();

    info!(
        subsystem = "api",
        results_dir = %results.dir().display(),
        job_timeout_secs = job_timeout,
        converters = dispatcher.job_types().len(),
        "Conversion pipeline configured"
    );

    let shutdown = CancellationToken::new();

    let pool = WorkerBuilder::new(store.clone())
        .with_config(WorkerConfig::from_env())
        .with_dispatcher(dispatcher.clone())
        .with_results(results.clone())
        .with_input_cleanup(input_cleanup.clone())
        .with_cancellations(cancellations.clone())
        .with_retry_policy(RetryPolicy::from_env())
        .build();
    tokio::spawn(log_worker_events(pool.events()));
    let worker_handle = pool.start();

    let retention = RetentionSweeper::retention_from_env().map(|retention| {
        info!(
            subsystem = "api",
            retention_hours = retention.as_secs() / 3600,
            "Retention cleanup enabled"
        );
        tokio::spawn(
            RetentionSweeper::new(store.clone(), results.clone(), retention).run(shutdown.clone()),
        )
    });

    let jobs = JobService::new(store, Arc::new(dispatcher))
        .with_results(results)
        .with_input_cleanup(input_cleanup)
        .with_cancellations(cancellations)
        .configured_from_env();

    let page_mode = match std::env::var("JOB_LIST_PAGINATION") {
        Ok(v) => v.parse::<PageMode>()?,
        Err(_) => PageMode::default(),
    };
    let state = AppState::new(jobs).with_page_mode(page_mode);
    let app = router(state, parse_allowed_origins());

    // Start server
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!(subsystem = "api", %addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop claiming, let in-flight conversions finish
    shutdown.cancel();
    worker_handle.shutdown().await?;
    if let Some(task) = retention {
        let _ = task.await;
    }

    info!(subsystem = "api", "Graceful shutdown complete");
    Ok(())
}

/// PostgreSQL when `DATABASE_URL` is set, otherwise the in-process store.
async fn open_store() -> anyhow::Result<Arc<dyn JobStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            info!(subsystem = "api", "Connecting to database...");
            let pool = create_pool_with_config(&database_url, PoolConfig::from_env()).await?;
            log_pool_metrics(&pool);

            let store = PgJobStore::new(pool);
            info!(subsystem = "api", "Running database migrations...");
            store.migrate().await?;
            info!(subsystem = "api", "Database migrations complete");
            Ok(Arc::new(store))
        }
        Err(_) => {
            warn!(
                subsystem = "api",
                "DATABASE_URL not set; using the in-process queue store, jobs will not survive a restart"
            );
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

/// Log every worker event until the pool shuts down.
async fn log_worker_events(mut events: broadcast::Receiver<WorkerEvent>) {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::JobsReclaimed { job_ids }) => {
                info!(subsystem = "jobs", component = "events", count = job_ids.len(), "Reclaimed stalled jobs")
            }
            Ok(WorkerEvent::WorkerStopped) => break,
            Ok(event) => tracing::debug!(subsystem = "jobs", component = "events", ?event, "Worker event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(subsystem = "jobs", component = "events", skipped, "Event logger lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl-C), starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
