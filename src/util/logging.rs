//! Logging initialization.

use crate::config::LogFormat;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set. Worker threads
/// are named, so their names are included in every event.
pub fn init_logging(level: &str, format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().with_thread_names(true))
                .init();
        }
        LogFormat::Pretty => {
            registry
                .with(fmt::layer().pretty().with_thread_names(true))
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global subscriber can only be set once per process, so only
    // the format parsing is covered here.
    #[test]
    fn test_log_format_from_yaml() {
        let format: LogFormat = serde_yaml::from_str("pretty").unwrap();
        assert_eq!(format, LogFormat::Pretty);
        assert_ne!(LogFormat::Json, LogFormat::Pretty);
    }
}
