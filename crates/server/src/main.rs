mod metrics;
mod monitor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_core::{
    create_audit_system, load_config, validate_config, AuditEvent, AuditStore, Config, JobEngine,
    JobStore, LogFormat, PipelineStore, SqliteAuditStore, SqliteJobStore, SqlitePipelineStore,
};

use monitor::StallMonitor;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Determine config path
    let config_path = std::env::var("CONVEYOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration before logging so the format can be configured.
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path));
    let config = match config {
        Ok(config) => {
            init_logging(config.logging.format);
            config
        }
        Err(e) => {
            init_logging(LogFormat::default());
            return Err(e);
        }
    };
    info!("Loaded configuration from {:?}", config_path);

    validate_config(&config).context("Configuration validation failed")?;
    info!("Database path: {:?}", config.database.path);
    info!(
        "Task grouping: {}, max conflict retries: {}",
        config.engine.task_grouping.as_str(),
        config.engine.max_conflict_retries
    );

    // Compute config hash for audit
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    // Stores
    let busy_timeout = Duration::from_millis(config.database.busy_timeout_ms);
    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );
    let pipeline_store: Arc<dyn PipelineStore> = Arc::new(
        SqlitePipelineStore::new(&config.database.path)
            .context("Failed to create pipeline store")?,
    );
    let job_store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::with_busy_timeout(&config.database.path, busy_timeout)
            .context("Failed to create job store")?,
    );
    info!("Stores initialized");

    // Create audit system
    let (audit_handle, audit_writer) =
        create_audit_system(Arc::clone(&audit_store), AUDIT_BUFFER_SIZE);
    let writer_handle = tokio::spawn(audit_writer.run());

    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;

    let engine = Arc::new(
        JobEngine::new(
            job_store,
            Arc::clone(&pipeline_store),
            config.engine.clone(),
        )
        .with_audit(audit_handle.clone()),
    );

    install_pipelines(&config, pipeline_store.as_ref(), &engine)?;

    // Touch the registry so every metric is registered before the first sweep.
    once_cell::sync::Lazy::force(&metrics::REGISTRY);

    let monitor = if config.monitor.enabled {
        let monitor = StallMonitor::new(config.monitor.clone(), Arc::clone(&engine));
        let handle = monitor.start();
        Some((monitor, handle))
    } else {
        info!("Stall monitor disabled in config");
        None
    };

    info!("Conveyor {} ready", VERSION);
    shutdown_signal().await;
    info!("Shutting down...");

    if let Some((monitor, handle)) = monitor {
        monitor.stop();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    metrics::collect_dynamic_metrics(&engine);
    debug!("Final metrics:\n{}", metrics::encode_metrics());

    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // The engine holds an AuditHandle clone; the writer stops once every
    // handle is gone.
    drop(engine);
    drop(audit_handle);

    let _ = writer_handle.await;
    info!("Audit writer stopped");

    Ok(())
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Create configured pipelines that do not exist yet. Existing pipelines are
/// left untouched.
fn install_pipelines(
    config: &Config,
    store: &dyn PipelineStore,
    engine: &JobEngine,
) -> Result<()> {
    let mut installed = 0;
    for pipeline in &config.pipelines {
        let exists = store
            .exists(&pipeline.tenant_id, &pipeline.name)
            .with_context(|| format!("Failed to look up pipeline '{}'", pipeline.name))?;
        if exists {
            debug!(
                tenant_id = %pipeline.tenant_id,
                name = %pipeline.name,
                "Pipeline already installed"
            );
            continue;
        }

        engine
            .create_pipeline(pipeline.to_request())
            .with_context(|| format!("Failed to install pipeline '{}'", pipeline.name))?;
        installed += 1;
    }

    info!(
        installed,
        configured = config.pipelines.len(),
        "Configured pipelines checked"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
