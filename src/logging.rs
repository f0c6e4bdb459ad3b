use clap::ValueEnum;
use once_cell::sync::OnceCell;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Env var holding a full filter directive; wins over `RUST_LOG` and the
/// `--log-level` flag.
pub const FILTER_ENV: &str = "PEERLINK_LOG_FILTER";

/// Crates that flood debug output with packet-level detail.
const CHATTY_CRATES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "mio",
    "mdns_sd",
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_mdns",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("cannot open log file {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("another logger is already installed: {0}")]
    AlreadySet(String),
}

// Holding the guard keeps the background writer flushing until exit.
static WRITER_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Installs the global subscriber, writing to `config.file` or stderr. Only
/// the first call does anything.
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    WRITER_GUARD
        .get_or_try_init(|| {
            let (writer, guard) = match &config.file {
                Some(path) => {
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|source| LoggingError::OpenFile {
                            path: path.clone(),
                            source,
                        })?;
                    tracing_appender::non_blocking(file)
                }
                None => tracing_appender::non_blocking(std::io::stderr()),
            };

            tracing_subscriber::fmt()
                .with_env_filter(env_filter(config.level))
                .with_target(config.level >= LogLevel::Debug)
                .with_ansi(config.file.is_none())
                .with_writer(writer)
                .try_init()
                .map_err(|e| LoggingError::AlreadySet(e.to_string()))?;
            Ok(guard)
        })
        .map(|_| ())
}

fn env_filter(level: LogLevel) -> EnvFilter {
    let configured = [FILTER_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|value| !value.trim().is_empty());

    match configured.map(|directives| EnvFilter::try_new(&directives)) {
        Some(Ok(filter)) => filter,
        Some(Err(e)) => {
            eprintln!("peerlink: ignoring bad log filter: {}", e);
            EnvFilter::new(directives_for(level))
        }
        None => EnvFilter::new(directives_for(level)),
    }
}

/// `--log-level debug` -> `debug,hyper=warn,...`; quiet levels need no caps.
fn directives_for(level: LogLevel) -> String {
    let level = LevelFilter::from(level);
    let mut directives = level.to_string().to_lowercase();
    if level > LevelFilter::WARN {
        for name in CHATTY_CRATES {
            directives.push_str(&format!(",{}=warn", name));
        }
    }
    directives
}
