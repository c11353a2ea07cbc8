//! Logging initialization using tracing.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Console log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event, for log aggregation
    Json,
}

/// Options for [`init_logging`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Log level (trace, debug, info, warn, error), overridden by `RUST_LOG`
    pub level: String,
    /// Console format
    pub format: LogFormat,
    /// Optional log file; events are appended as JSON lines
    pub file: Option<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Console output goes to stderr so that stdout stays free for reports.
/// When `options.file` is set, every event is also appended to that file.
pub fn init_logging(options: &LoggingOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.level));
    let file = options.file.as_deref().map(Path::new);

    match options.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(file_layer(file)?)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(file_layer(file)?)
            .try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn file_layer<S>(file: Option<&Path>) -> Result<Option<impl Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(path) = file else {
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("Log file path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(Some(
        fmt::layer()
            .json()
            .with_target(true)
            .with_ansi(false)
            .with_writer(appender),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = LoggingOptions::default();
        assert_eq!(options.level, "info");
        assert_eq!(options.format, LogFormat::Pretty);
        assert!(options.file.is_none());
    }

    #[test]
    fn test_options_yaml() {
        let options: LoggingOptions = serde_yaml::from_str(
            "level: debug\nformat: json\nfile: /var/log/compass/netsetup.log\n",
        )
        .unwrap();
        assert_eq!(options.level, "debug");
        assert_eq!(options.format, LogFormat::Json);
        assert_eq!(options.file.as_deref(), Some("/var/log/compass/netsetup.log"));
    }

    #[test]
    fn test_file_layer_rejects_directory_path() {
        let result = file_layer::<tracing_subscriber::Registry>(Some(Path::new("/")));
        assert!(result.is_err());
    }
}
