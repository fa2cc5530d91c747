//! Subscriber setup for the `tracing` events this crate emits.
//!
//! Components never install a subscriber themselves; binaries and tests call
//! [`LoggingConfig::init`] once at startup.

use crate::errors::{ResilienceError, ResilienceResult};
use std::fmt;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const CRATE_TARGET: &str = "integrations_resilience";

/// Where resilience events go and how they look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for this crate's events (retries, circuit transitions, alerts)
    pub level: LogLevel,
    /// Level for every other target, e.g. the inference client
    pub dependency_level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Print the event target
    pub include_target: bool,
    /// Print source file and line
    pub include_file_line: bool,
}

/// Event severity, most verbose first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Everything, including per-attempt detail
    Trace,
    /// Classification and cache decisions
    Debug,
    /// State changes and retries
    Info,
    /// Open circuits, threshold alerts
    Warn,
    /// Failures only
    Error,
}

impl LogLevel {
    /// Lowercase name as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ResilienceError::Configuration {
                message: format!("unknown log level '{}'", other),
            }),
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, coloured; for local runs
    Pretty,
    /// One JSON object per event; for log shipping
    Json,
    /// Single line per event
    Compact,
}

impl FromStr for LogFormat {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ResilienceError::Configuration {
                message: format!("unknown log format '{}'", other),
            }),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            dependency_level: LogLevel::Warn,
            format: LogFormat::Compact,
            include_target: true,
            include_file_line: false,
        }
    }
}

impl LoggingConfig {
    /// Same as [`LoggingConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the level for this crate's events.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the level for every other target.
    pub fn with_dependency_level(mut self, level: LogLevel) -> Self {
        self.dependency_level = level;
        self
    }

    /// Sets the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Includes or omits the event target.
    pub fn with_target(mut self, include: bool) -> Self {
        self.include_target = include;
        self
    }

    /// Includes or omits source file and line.
    pub fn with_file_line(mut self, include: bool) -> Self {
        self.include_file_line = include;
        self
    }

    /// Filter directive used when `RUST_LOG` is unset, e.g.
    /// `warn,integrations_resilience=info`.
    pub fn directive(&self) -> String {
        format!("{},{}={}", self.dependency_level, CRATE_TARGET, self.level)
    }

    fn filter(&self) -> ResilienceResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(self.directive()).map_err(|err| {
                ResilienceError::Configuration {
                    message: format!("invalid log filter: {}", err),
                }
            }),
        }
    }

    /// Installs the global subscriber. `RUST_LOG` replaces the configured levels.
    ///
    /// # Errors
    ///
    /// Fails if a global subscriber is already installed.
    pub fn init(&self) -> ResilienceResult<()> {
        let base = tracing_subscriber::fmt::layer()
            .with_target(self.include_target)
            .with_file(self.include_file_line)
            .with_line_number(self.include_file_line);
        let layer = match self.format {
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
        };

        tracing_subscriber::registry()
            .with(layer.with_filter(self.filter()?))
            .try_init()
            .map_err(|err| ResilienceError::Configuration {
                message: format!("logging already initialised: {}", err),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_defaults_favour_crate_events() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.dependency_level, LogLevel::Warn);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.directive(), "warn,integrations_resilience=info");
    }

    #[test]
    fn test_directive_follows_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Trace)
            .with_dependency_level(LogLevel::Error)
            .with_format(LogFormat::Json)
            .with_file_line(true);

        assert_eq!(config.directive(), "error,integrations_resilience=trace");
        assert!(EnvFilter::try_new(config.directive()).is_ok());
        assert!(config.include_file_line);
    }

    #[test_case("debug", LogLevel::Debug)]
    #[test_case("WARN", LogLevel::Warn)]
    #[test_case("warning", LogLevel::Warn)]
    #[test_case(" error ", LogLevel::Error)]
    fn test_parse_log_level(input: &str, expected: LogLevel) {
        assert_eq!(input.parse::<LogLevel>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_values_are_configuration_errors() {
        assert!(matches!(
            "verbose".parse::<LogLevel>(),
            Err(ResilienceError::Configuration { .. })
        ));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_level_filter_ordering() {
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
        assert!(LogLevel::Debug < LogLevel::Warn);
    }
}
