//! Logging setup for the `phasegate` binary.
//!
//! - Console output on stderr, compact text or JSON (`--json-logs`)
//! - Level from `RUST_LOG`, else `-v` count, else `[logging].level`
//! - Daily rolling JSON log files under `.phasegate/logs`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const FILE_FILTER: &str = "phasegate=debug,warn";
const MAX_LOG_FILES: usize = 7;

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Number of `-v` flags.
    pub verbosity: u8,
    pub json: bool,
    /// Configured console level, used when `-v` is absent.
    pub level: String,
    /// Directory for rolling log files; `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            verbosity: 0,
            json: false,
            level: "warn".to_string(),
            log_dir: None,
        }
    }
}

/// Must be held until exit so buffered file logs are flushed.
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(options: &LogOptions) -> Result<LogGuards> {
    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(console_level(options.verbosity, &options.level))
            .context("Invalid log level")?,
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if options.json {
        layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(console_filter)
                .boxed(),
        );
    } else {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact()
                .with_filter(console_filter)
                .boxed(),
        );
    }

    let mut file_guard = None;
    if let Some(dir) = &options.log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("phasegate")
            .filename_suffix("log")
            .max_log_files(MAX_LOG_FILES)
            .build(dir)
            .context("Failed to create log file appender")?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new(FILE_FILTER))
                .boxed(),
        );
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to initialize logging")?;

    tracing::debug!(
        verbosity = options.verbosity,
        json = options.json,
        log_dir = ?options.log_dir,
        "logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// Console level: `-v`, `-vv` and `-vvv` select info, debug and trace.
fn console_level(verbosity: u8, configured: &str) -> String {
    match verbosity {
        0 => configured.to_lowercase(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}
