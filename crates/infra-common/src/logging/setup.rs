use crate::errors::types::{Error, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

/// How the process-wide subscriber is built
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted unless `RUST_LOG` says otherwise
    pub level: Level,
    /// One JSON object per event instead of human-readable lines
    pub json: bool,
    /// Source file and line of each event
    pub file_info: bool,
    /// Emit an event whenever a span is entered for the first time and closed
    pub log_spans: bool,
    /// Name announced in the startup line
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "sipdrill".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        Self {
            level,
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    pub fn with_json(self) -> Self {
        Self { json: true, ..self }
    }

    pub fn with_file_info(self) -> Self {
        Self { file_info: true, ..self }
    }

    pub fn with_spans(self) -> Self {
        Self { log_spans: true, ..self }
    }

    fn span_events(&self) -> FmtSpan {
        if self.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Events go to stderr, leaving stdout to whatever report the program
/// prints. `RUST_LOG` directives are honoured on top of `config.level`.
/// Fails if a global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(config.span_events())
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.with_target(false).try_init()
    };
    installed.map_err(|e| Error::Logging(e.to_string()))?;

    announce(&config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Parse a level name, case-insensitively
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| Error::Config(format!("Invalid log level: {}", level)))
}

fn announce(app_name: &str, version: &str) {
    tracing::info!(app = app_name, version, "starting");
}
