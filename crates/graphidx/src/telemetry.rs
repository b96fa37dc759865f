//! Logging setup for binaries embedding the orchestrator.
//!
//! Library code logs through `log` and `tracing`; nothing is installed
//! until a binary calls [`init_logging`].

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LogFormat;
use crate::error::{GraphidxError, Result};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber and bridges `log` records into it.
/// Output goes to stderr so stdout stays free for command results.
pub fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = match format {
        LogFormat::Plain => fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);

    tracing_log::LogTracer::init().map_err(|e| GraphidxError::Telemetry(e.to_string()))?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| GraphidxError::Telemetry(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_second_init_fails_cleanly() {
        // The first call may already have happened in another test.
        let _ = init_logging(LogFormat::Plain);
        let err = init_logging(LogFormat::Json).unwrap_err();
        assert!(matches!(err, GraphidxError::Telemetry(_)));
    }
}
