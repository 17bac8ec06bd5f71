//! Logging initialisation for the `dk` binary and the HTTP service.

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Install the global subscriber once. Later calls are no-ops.
///
/// `RUST_LOG` wins over `filter`, which wins over `default_filter`. Output goes to
/// stderr so command output on stdout stays machine-readable.
pub fn init_logging(format: LogFormat, filter: Option<&str>, default_filter: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(filter.unwrap_or(default_filter))
                .unwrap_or_else(|_| EnvFilter::new(default_filter))
        });

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}
