/*!
 * Logging and tracing initialization
 *
 * Each transfer runs inside a span (`upload`, `download`, `copy`) carrying
 * its URI, size and strategy. On stderr, closing spans are reported with
 * their timings when debug output is on; the JSON log file attaches the
 * enclosing transfer span to every event and records every span close.
 */

use std::fs::OpenOptions;
use std::path::Path;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LogConfig;
use crate::error::{FerryError, Result};

/// Environment variable with filter directives, e.g. `ferry::protocol=trace`
pub const LOG_ENV: &str = "FERRY_LOG";

/// Initialize structured logging based on configuration
pub fn init_logging(config: &LogConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    };
    let directives = std::env::var(LOG_ENV).ok().or_else(|| config.filter.clone());
    let filter = log_filter(level, directives.as_deref())?;

    match &config.file {
        Some(path) => init_file_logging(path, filter),
        None => {
            init_stderr_logging(filter, level >= Level::DEBUG);
            Ok(())
        }
    }
}

/// Filter logging `ferry` at `level` and other crates at warnings only.
///
/// `directives` are applied on top and take precedence for the targets
/// they name.
pub fn log_filter(level: Level, directives: Option<&str>) -> Result<EnvFilter> {
    let mut text = format!("warn,ferry={}", level);
    if let Some(directives) = directives.map(str::trim).filter(|d| !d.is_empty()) {
        text.push(',');
        text.push_str(directives);
    }
    EnvFilter::try_new(&text)
        .map_err(|e| FerryError::Config(format!("invalid log filter '{}': {}", text, e)))
}

/// Human-readable logs on stderr, leaving stdout for command output
fn init_stderr_logging(filter: EnvFilter, span_timings: bool) {
    let span_events = if span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(span_timings)
        .with_span_events(span_events)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// JSON lines appended to `log_path`
fn init_file_logging(log_path: &Path, filter: EnvFilter) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| {
            FerryError::Config(format!("failed to open log file {}: {}", log_path.display(), e))
        })?;

    let fmt_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Initialize logging with a test writer
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let directives = std::env::var(LOG_ENV).ok();
        let Ok(filter) = log_filter(Level::DEBUG, directives.as_deref()) else {
            return;
        };
        let fmt_layer = fmt::layer()
            .with_test_writer()
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}
