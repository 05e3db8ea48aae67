//! Tracing subscriber installation.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogSection};

const LOG_FILE_PREFIX: &str = "plugin-gateway.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log.level`. The returned guard flushes the file
/// writer on drop and must be held for the life of the process. A subscriber
/// that is already installed is left in place.
pub fn init(log: &LogSection) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)
            .with_context(|| format!("Invalid log level '{}'", log.level))?,
    };

    let mut layers: Vec<BoxedLayer> = vec![format_layer(log.format, None)];

    let guard = match &log.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(format_layer(log.format, Some(writer)));
            Some(guard)
        }
        None => None,
    };

    let _ = tracing_subscriber::registry().with(layers).with(filter).try_init();
    Ok(guard)
}

fn format_layer(
    format: LogFormat,
    file: Option<tracing_appender::non_blocking::NonBlocking>,
) -> BoxedLayer {
    match (format, file) {
        (LogFormat::Text, None) => fmt::layer().with_target(true).boxed(),
        (LogFormat::Json, None) => fmt::layer().json().with_current_span(true).boxed(),
        (LogFormat::Text, Some(writer)) => {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        }
        (LogFormat::Json, Some(writer)) => fmt::layer().json().with_writer(writer).boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_twice_is_not_an_error() {
        let log = LogSection::default();
        assert!(init(&log).is_ok());
        assert!(init(&log).is_ok());
    }

    #[test]
    fn init_creates_log_directory() {
        let dir = tempdir().unwrap();
        let log = LogSection {
            directory: Some(dir.path().join("logs")),
            format: LogFormat::Json,
            ..LogSection::default()
        };
        let guard = init(&log).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());
    }
}
