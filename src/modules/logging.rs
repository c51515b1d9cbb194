// Tracing subscriber setup
//
// Console output always; a daily rolling file when `log_dir` is set.
// RUST_LOG overrides the configured level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::models::LoggingConfig;

const LOG_FILE_PREFIX: &str = "gateway.log";

/// Build the env filter: RUST_LOG when set, otherwise the configured level.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = format!(
            "antigravity_gateway_lib={level},antigravity_gateway={level},tower_http=warn",
            level = config.level
        );
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber.
///
/// The returned guard must be held for the process lifetime so buffered file
/// output gets flushed.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = build_filter(config);
    let console = fmt::layer().compact().with_target(false);

    let file_writer = config.log_dir.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: could not create log directory {}: {}", dir, e);
            return None;
        }
        Some(tracing_appender::non_blocking(
            tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX),
        ))
    });

    match file_writer {
        Some((writer, guard)) => {
            let result = tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init();
            if let Err(e) = result {
                eprintln!("Warning: tracing already initialized: {}", e);
            }
            Some(guard)
        }
        None => {
            if let Err(e) = tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()
            {
                eprintln!("Warning: tracing already initialized: {}", e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_uses_configured_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let filter = build_filter(&LoggingConfig {
            level: "debug".to_string(),
            log_dir: None,
        });
        assert!(filter.to_string().contains("antigravity_gateway_lib=debug"));
    }

    #[test]
    fn test_init_with_log_dir_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init_tracing(&LoggingConfig {
            level: "info".to_string(),
            log_dir: Some(dir.path().to_string_lossy().into_owned()),
        });
        assert!(guard.is_some());
    }
}
