// ── Tracing setup ──
//
// Library crates only emit events; the host installs one subscriber at
// startup through `init_tracing`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{ConfigError, LoggingSettings};

pub(crate) fn parse_filter(directive: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(directive).map_err(|e| ConfigError::Validation {
        field: "logging.level".into(),
        reason: e.to_string(),
    })
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `settings.level`. When `settings.file` is set,
/// output goes through a non-blocking file writer and the returned guard
/// must be held for the lifetime of the process so buffered lines are
/// flushed.
pub fn init_tracing(settings: &LoggingSettings) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&settings.level)?,
    };

    let (writer, guard) = match &settings.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().ok_or_else(|| ConfigError::Validation {
                field: "logging.file".into(),
                reason: format!("{} has no file name", path.display()),
            })?;
            std::fs::create_dir_all(dir)?;

            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(settings.file.is_none())
        .with_target(true);

    let installed = if settings.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
    };
    installed.map_err(|e| ConfigError::Logging {
        message: e.to_string(),
    })?;

    Ok(guard)
}
