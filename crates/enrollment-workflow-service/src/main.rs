use std::sync::Arc;

use anyhow::{Context, Result};
use enrollment_workflow::{
    EngineConfig, PostgresAuditLog, PostgresWorkflowStore, WorkflowRuntime,
};
use sqlx::PgPool;

mod config;
mod telemetry;

use config::ServiceConfig;
use telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_telemetry(&TelemetryConfig::from_env());

    tracing::info!("enrollment-workflow-service starting...");

    let service = ServiceConfig::from_env();
    let mut engine_config = EngineConfig::load_or_default(&service.workflow_config)
        .with_context(|| format!("Failed to load {}", service.workflow_config.display()))?;
    if let Some(scan_interval) = service.scan_interval {
        engine_config.monitor.scan_interval = scan_interval;
    }

    tracing::info!(
        config = %service.workflow_config.display(),
        states = engine_config.states.len(),
        scan_interval_ms = engine_config.monitor.scan_interval.as_millis() as u64,
        persistent = service.database_url.is_some(),
        "Configuration loaded"
    );

    let mut builder = WorkflowRuntime::builder().with_config(engine_config);
    if let Some(url) = &service.database_url {
        let pool = PgPool::connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        PostgresWorkflowStore::migrate(&pool)
            .await
            .context("Failed to run migrations")?;
        builder = builder
            .with_store(Arc::new(PostgresWorkflowStore::new(pool.clone())))
            .with_audit(Arc::new(PostgresAuditLog::new(pool)));
    } else {
        tracing::warn!("DATABASE_URL not set, instances and audit trail live in memory only");
    }

    let runtime = builder.build().context("Invalid workflow configuration")?;
    let handle = runtime
        .start()
        .await
        .context("Failed to start workflow runtime")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    handle.shutdown().await;
    for (channel, state, metrics) in runtime.notification_worker().breakers().snapshot() {
        tracing::info!(
            %channel,
            %state,
            calls = metrics.calls,
            failures = metrics.failures,
            rejections = metrics.rejections,
            state_changes = metrics.state_changes,
            "Notification channel breaker"
        );
    }
    tracing::info!("Service shutdown complete");
    Ok(())
}
