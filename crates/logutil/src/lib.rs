//! Utilities for logging.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Json,
}

impl LogFormat {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "human" | "human_readable" | "text" => Some(LogFormat::HumanReadable),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Build the filter for the global subscriber.
///
/// `RUST_LOG` takes precedence over the provided level when set.
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Configure the global logger.
///
/// Only the first call installs a subscriber, later calls are no-ops.
pub fn configure_global_logger<W>(level: Level, format: LogFormat, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(writer)
        .with_thread_ids(true);

    let _ = match format {
        LogFormat::HumanReadable => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Enable debug logging for tests, writing through the test harness capture.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(Level::DEBUG))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_format_names() {
        assert_eq!(Some(LogFormat::Json), LogFormat::from_name("JSON"));
        assert_eq!(Some(LogFormat::HumanReadable), LogFormat::from_name("human"));
        assert_eq!(None, LogFormat::from_name("xml"));
    }

    #[test]
    fn init_twice_is_fine() {
        init_test();
        init_test();
        tracing::debug!("still logging");
    }
}
