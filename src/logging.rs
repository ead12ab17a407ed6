use serde::{Deserialize, Serialize};
use tracing::debug;
use tracing_subscriber::{prelude::*, EnvFilter};

fn default_log_level() -> String {
    "debug".to_string()
}

/// Top-level `log_level` / `dev_log` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Human-readable colored output instead of JSON lines.
    #[serde(default)]
    pub dev_log: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dev_log: false,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides `log_level`.
///
/// Safe to call more than once: later calls leave the installed subscriber
/// in place and return `false`.
pub fn init_tracing(settings: &LogSettings) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new(default_log_level()));

    let result = if settings.dev_log {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_ansi(true).pretty())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .flatten_event(true),
            )
            .with(filter)
            .try_init()
    };

    match result {
        Ok(()) => true,
        Err(_) => {
            debug!("Tracing already initialized, skipping re-initialization");
            false
        }
    }
}
