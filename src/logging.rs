use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::SenderConfig;
use crate::errors::TrapperError;

const DEFAULT_LOG_FILE: &str = "trapper-sender.log";

/// Install the global subscriber: console output plus, when `log_file_path`
/// is set, a daily-rolling file. Keep the returned guard alive so buffered
/// file output is flushed on exit.
pub fn init_logging(config: &SenderConfig) -> Result<Option<WorkerGuard>, TrapperError> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match config.log_file_path.as_deref() {
        Some(path) => {
            let (directory, prefix) = split_log_path(path);
            let appender = tracing_appender::rolling::daily(directory, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| TrapperError::Logging(e.to_string()))?;

    Ok(guard)
}

fn split_log_path(path: &Path) -> (&Path, &str) {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    (directory, prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        assert_eq!(
            split_log_path(Path::new("/var/log/trapper/agent.log")),
            (Path::new("/var/log/trapper"), "agent.log")
        );
        assert_eq!(split_log_path(Path::new("agent.log")), (Path::new("."), "agent.log"));
    }
}
