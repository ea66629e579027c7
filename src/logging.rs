//! tracing-subscriber initialization.
//!
//! Mirrors the teacher's rotation/retention knobs but drops the
//! module-separation machinery: Muster is one coherent log stream, not a
//! handler-per-plugin server, so there is no natural axis to split files on.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn`, or `error`; also accepts a full
    /// `EnvFilter` directive string.
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
            rotation: LogRotation::Daily,
        }
    }
}

/// Initializes the global tracing subscriber. Returns a guard that must be
/// held for the process lifetime when file logging is enabled — dropping it
/// stops the non-blocking writer's background flush thread.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(file_path) = &config.file else {
        init_console(env_filter, config.format);
        return Ok(None);
    };

    let dir = file_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("muster.log");

    let appender = match config.rotation {
        LogRotation::Daily => rolling::daily(dir, file_name),
        LogRotation::Hourly => rolling::hourly(dir, file_name),
        LogRotation::Never => rolling::never(dir, file_name),
    };
    let (writer, guard) = non_blocking(appender);

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        fmt_layer(config.format, std::io::stderr.and(writer)),
    );
    subscriber.init();
    Ok(Some(guard))
}

fn init_console(env_filter: EnvFilter, format: LogFormat) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer(format, std::io::stderr))
        .init();
}

fn fmt_layer<W>(
    format: LogFormat,
    writer: W,
) -> Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .with_target(false)
            .boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_console_pretty() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file.is_none());
        assert_eq!(config.format, LogFormat::Pretty);
    }
}
