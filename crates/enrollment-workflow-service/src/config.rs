//! Service configuration from environment variables

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_WORKFLOW_CONFIG: &str = "config/workflow.toml";

/// Deployment settings that sit outside the workflow document
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path of the TOML workflow document (WORKFLOW_CONFIG)
    pub workflow_config: PathBuf,
    /// PostgreSQL connection string; in-memory storage when unset (DATABASE_URL)
    pub database_url: Option<String>,
    /// Overrides `[monitor] scan_interval_ms` (MONITOR_SCAN_INTERVAL_MS)
    pub scan_interval: Option<Duration>,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            workflow_config: lookup("WORKFLOW_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKFLOW_CONFIG)),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            scan_interval: lookup("MONITOR_SCAN_INTERVAL_MS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        }
    }
}
