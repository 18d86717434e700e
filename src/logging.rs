//! Logging setup shared by the binary and tests.

use std::sync::Once;

use env_logger::{Builder, Target, WriteStyle};

static INIT: Once = Once::new();

/// Output destination for logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogOutput {
    #[default]
    Stderr,
    Stdout,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directives, e.g. "info" or "info,gplda::engine=debug".
    /// RUST_LOG wins when set.
    pub level: String,
    pub output: LogOutput,
    pub colored: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stderr,
            colored: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn stdout(mut self) -> Self {
        self.output = LogOutput::Stdout;
        self
    }

    pub fn stderr(mut self) -> Self {
        self.output = LogOutput::Stderr;
        self
    }

    pub fn colored(mut self) -> Self {
        self.colored = true;
        self
    }

    pub fn no_color(mut self) -> Self {
        self.colored = false;
        self
    }

    fn builder(&self) -> Builder {
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| self.level.clone());
        let mut builder = Builder::new();
        builder
            .parse_filters(&filter)
            .target(match self.output {
                LogOutput::Stderr => Target::Stderr,
                LogOutput::Stdout => Target::Stdout,
            })
            .write_style(if self.colored {
                WriteStyle::Auto
            } else {
                WriteStyle::Never
            });
        builder
    }
}

/// Initialize logging. Only the first call in a process has any effect.
pub fn init(config: LoggingConfig) {
    INIT.call_once(|| {
        // A logger installed by someone else wins.
        let _ = config.builder().try_init();
    });
}

/// Plain stderr logging at `level`, for tests.
pub fn init_stderr(level: &str) {
    init(LoggingConfig::new(level).stderr().no_color());
}

pub fn init_default() {
    init(LoggingConfig::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_options() {
        let config = LoggingConfig::new("debug").stdout().no_color();
        assert_eq!(config.output, LogOutput::Stdout);
        assert!(!config.colored);
        assert!(config.colored().colored);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_stderr("warn");
        init_default();
        log::warn!("logging initialized twice without panicking");
    }
}
