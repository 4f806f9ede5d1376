//! Logging setup.
//!
//! One process-wide `tracing` subscriber with environment-based
//! filtering, plus per-workspace rolling log files for plugin output.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Builder for the process-wide subscriber.
#[derive(Default)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: Option<tracing::Level>,
    with_target: bool,
    with_file: bool,
    with_line_number: bool,
}

impl LoggingBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base log level.
    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Adds a filter directive, e.g. `"gantry_rpc=debug"`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    /// Includes the module path in log lines.
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Includes file names in log lines.
    pub fn with_file(mut self, enabled: bool) -> Self {
        self.with_file = enabled;
        self
    }

    /// Includes line numbers in log lines.
    pub fn with_line_number(mut self, enabled: bool) -> Self {
        self.with_line_number = enabled;
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let base = self
            .level
            .map(|l| l.to_string().to_lowercase())
            .unwrap_or_else(|| "info".to_string());
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base));
        for directive in &self.directives {
            if let Ok(parsed) = directive.parse() {
                filter = filter.add_directive(parsed);
            }
        }
        filter
    }

    /// Installs the subscriber. Safe to call more than once; only the
    /// first call takes effect.
    pub fn init(self) {
        if LOGGING_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let filter = self.build_filter();
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(self.with_target)
                    .with_file(self.with_file)
                    .with_line_number(self.with_line_number),
            )
            .with(filter)
            .init();
    }
}

/// Initializes logging from a textual level, as supplied by the config
/// file or `--debug`.
pub fn init_from_level(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    LoggingBuilder::new().with_level(level).init();
}

/// Returns whether logging was initialized.
pub fn is_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::SeqCst)
}

/// A rolling log file for one workspace under
/// `<workspace_root>/<name>/logs/`. The returned guard flushes on drop.
pub fn workspace_log_writer(
    workspace_root: &Path,
    workspace: &str,
) -> std::io::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let log_dir = workspace_root.join(workspace).join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, "gantry.log");
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_writer_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_writer, _guard) = workspace_log_writer(dir.path(), "lab").unwrap();
        assert!(dir.path().join("lab").join("logs").is_dir());
    }
}
