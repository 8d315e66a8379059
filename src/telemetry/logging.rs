//! Logging initialization

use anyhow::{Context, Result};
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::TelemetryConfig;

/// Install the global subscriber.
///
/// When `log_file` is set, lines are also written through a non-blocking
/// appender; the returned guard must be held until shutdown to flush it.
pub fn init_logging(config: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = build_filter(&config.log_level)?;

    let console = if config.json_logs {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .boxed()
    };

    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(Path::new(path))?;
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    let filter = EnvFilter::builder()
        .with_default_directive(parse_log_level(level).into())
        .from_env_lossy()
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);
    Ok(filter)
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file has no file name: {:?}", path))?;

    let appender = tracing_appender::rolling::daily(directory, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("WARNING"), Level::WARN);
        assert_eq!(parse_log_level("debug"), Level::DEBUG);
        assert_eq!(parse_log_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_file_writer_rejects_directory_path() {
        assert!(file_writer(Path::new("/")).is_err());
    }
}
