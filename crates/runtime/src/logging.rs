//! File logging for the vaultpilot binary.
//!
//! Everything goes to one file under the log directory; the terminal is
//! left to the streamed answer.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";
const LOG_FILE: &str = "vaultpilot.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Where and how to log, resolved before the subscriber is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub filter: String,
    pub format: LogFormat,
    /// Correlates the log lines of one invocation. A host that spawns
    /// vaultpilot can pass its own through `VAULTPILOT_RUN_ID`.
    pub run_id: String,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let dir = lookup("VAULTPILOT_LOG_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);
        let valid = |filter: &String| EnvFilter::try_new(filter).is_ok();
        let filter = lookup("VAULTPILOT_LOG_FILTER")
            .filter(valid)
            .or_else(|| lookup("RUST_LOG").filter(valid))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = lookup("VAULTPILOT_LOG_FORMAT")
            .map(|value| LogFormat::parse(&value))
            .unwrap_or(LogFormat::Json);
        let run_id = lookup("VAULTPILOT_RUN_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generated_run_id);

        Self {
            dir,
            filter,
            format,
            run_id,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    pub log_path: PathBuf,
    pub guard: WorkerGuard,
}

pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".vaultpilot")
        .join("logs")
}

fn generated_run_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("pid-{}-{}", std::process::id(), now)
}

/// Install the global subscriber writing to `config.log_path()`.
pub fn init_logging(config: LogConfig) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(&config.dir)?;

    let file_appender = tracing_appender::rolling::never(&config.dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let registry = tracing_subscriber::registry().with(EnvFilter::try_new(&config.filter)?);

    match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %config.run_id,
        log_path = %config.log_path().display(),
        format = ?config.format,
        filter = %config.filter,
    );

    Ok(LoggingHandle {
        log_path: config.log_path(),
        run_id: config.run_id,
        guard,
    })
}
