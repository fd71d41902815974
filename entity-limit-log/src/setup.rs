use std::env;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

// Import CRATE_NAMES, which lists all crates in the workspace.
include!(concat!(env!("OUT_DIR"), "/constants.gen.rs"));

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  entity_limit::usage > entity limit evaluated
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-12-04T12:10:32Z  INFO entity_limit::usage: entity limit evaluated
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2024-12-04T12:11:08.729716Z","level":"INFO","target":"entity_limit::usage","message":"entity limit evaluated"}
    /// ```
    Json,
}

/// The severity of a log message, used as the maximum level to emit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Disables logging entirely.
    Off,
    /// Only errors.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages and above.
    Info,
    /// Debug messages and above.
    Debug,
    /// Everything.
    Trace,
}

impl Level {
    /// Returns the `tracing` level filter corresponding to this level.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for the entity limit crates.
    pub level: Level,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE` variable to `full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Builds the default filter directives.
///
/// Third-party crates log at `INFO`, all crates of this workspace at the configured level.
fn default_filter(level: Level) -> EnvFilter {
    let level = level.level_filter();
    let mut filter = EnvFilter::default().add_directive(LevelFilter::INFO.into());

    for name in CRATE_NAMES {
        if let Ok(directive) = format!("{name}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    filter
}

/// Initialize the logging system.
///
/// If the `RUST_LOG` environment variable is set, it takes precedence over the configured level.
/// Calling this function more than once has no effect.
///
/// # Example
///
/// ```
/// let log_config = entity_limit_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// entity_limit_log::init(&log_config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        // SAFETY: Logging is initialized during startup before any other threads are spawned.
        unsafe { env::set_var("RUST_BACKTRACE", "full") };
    }

    let filter = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => default_filter(config.level),
    };

    let format: Box<dyn Layer<Registry> + Send + Sync> =
        match (config.format, console::user_attended()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => fmt::layer().pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                fmt::layer().with_ansi(false).boxed()
            }
            (LogFormat::Json, _) => fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .boxed(),
        };

    tracing_subscriber::registry()
        .with(format)
        .with(filter)
        .try_init()
        .ok();
}
