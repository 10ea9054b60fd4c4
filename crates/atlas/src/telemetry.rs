//! Process-wide tracing subscriber.

use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, LoggingSettings};

const DEFAULT_FILTER: &str = "info";

/// Builds the filter: `RUST_LOG` wins, then the configured filter, then `info`.
pub fn env_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        settings
            .filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Installs the global subscriber and routes `log` records into it.
/// Output goes to stderr; stdout belongs to command output.
///
/// Call once, from the binary. A second call returns the error from
/// `set_global_default` and leaves the first subscriber in place.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), SetGlobalDefaultError> {
    // Already set when another subscriber or logger won the race.
    let _ = tracing_log::LogTracer::init();

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter(settings));
    tracing::subscriber::set_global_default(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_configured_filter_applies_without_env() {
        std::env::remove_var("RUST_LOG");
        let settings = LoggingSettings {
            format: LogFormat::Text,
            filter: Some("atlas=debug".to_string()),
        };
        assert_eq!(env_filter(&settings).to_string(), "atlas=debug");
    }

    #[test]
    #[serial]
    fn test_invalid_filter_falls_back_to_info() {
        std::env::remove_var("RUST_LOG");
        let settings = LoggingSettings {
            format: LogFormat::Json,
            filter: Some("atlas=verbose".to_string()),
        };
        assert_eq!(env_filter(&settings).to_string(), "info");
    }
}
