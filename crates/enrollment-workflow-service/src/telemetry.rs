// Logging setup for the workflow service
//
// Configure via environment variables:
// - RUST_LOG: full filter directive, takes precedence
// - LOG_LEVEL: level applied to the workflow crates when RUST_LOG is unset (default: info)
// - LOG_FORMAT: "json" for structured output, anything else for human-readable lines

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log output style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_filter: String,
    pub format: LogFormat,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_filter = lookup("RUST_LOG").unwrap_or_else(|| {
            let level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
            format!("enrollment_workflow={level},enrollment_workflow_service={level}")
        });
        let format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self { log_filter, format }
    }
}

/// Install the global subscriber
pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).init();
}
