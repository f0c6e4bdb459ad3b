use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::directory::{DEFAULT_STALE_AFTER, DEFAULT_SWEEP_INTERVAL};
use crate::error::{Error, Result};
use crate::logging::{LogConfig, LogLevel};
use crate::mailbox::{DEFAULT_IDLE_AFTER, DEFAULT_MAILBOX_CAPACITY};
use crate::server::DEFAULT_ALLOWED_ORIGINS;

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_SERVICE_CLASS: &str = "chat-peer";
pub const FALLBACK_DEVICE_NAME: &str = "ChatConnect-Device";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "peerlink",
    version,
    about = "Local-network peer directory and signaling relay"
)]
pub struct Cli {
    /// HTTP port, also the port we announce
    #[arg(long, env = "PEERLINK_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Announced device name (defaults to the hostname)
    #[arg(long, env = "PEERLINK_NAME")]
    pub name: Option<String>,

    /// mDNS service class, without the leading underscore
    #[arg(long, env = "PEERLINK_SERVICE_TYPE", default_value = DEFAULT_SERVICE_CLASS)]
    pub service_type: String,

    /// Origin allowed to call the HTTP surface with credentials (repeatable)
    #[arg(
        long = "allowed-origin",
        env = "PEERLINK_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    /// Seconds without an announcement before a peer is evicted
    #[arg(long, env = "PEERLINK_STALE_AFTER", default_value_t = DEFAULT_STALE_AFTER.as_secs())]
    pub stale_after_secs: u64,

    #[arg(long, env = "PEERLINK_SWEEP_INTERVAL", default_value_t = DEFAULT_SWEEP_INTERVAL.as_secs())]
    pub sweep_interval_secs: u64,

    /// Pending signals kept per recipient; the oldest is dropped beyond this
    #[arg(long, env = "PEERLINK_MAILBOX_CAPACITY", default_value_t = DEFAULT_MAILBOX_CAPACITY)]
    pub mailbox_capacity: usize,

    /// Seconds after its newest message before an unclaimed mailbox is dropped
    #[arg(long, env = "PEERLINK_MAILBOX_IDLE", default_value_t = DEFAULT_IDLE_AFTER.as_secs())]
    pub mailbox_idle_secs: u64,

    /// Answer incoming offers addressed to this device
    #[arg(long, env = "PEERLINK_AUTO_ACCEPT")]
    pub auto_accept: bool,

    #[arg(long, env = "PEERLINK_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "PEERLINK_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Resolved and validated runtime settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub device_name: String,
    pub service_class: String,
    pub allowed_origins: Vec<String>,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub mailbox_capacity: usize,
    pub mailbox_idle: Duration,
    pub auto_accept: bool,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            device_name: FALLBACK_DEVICE_NAME.to_string(),
            service_class: DEFAULT_SERVICE_CLASS.to_string(),
            allowed_origins: default_origins(),
            stale_after: DEFAULT_STALE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            mailbox_idle: DEFAULT_IDLE_AFTER,
            auto_accept: false,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let device_name = match cli.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            Some(_) => return Err(Error::Config("device name must not be empty".into())),
            None => default_device_name(),
        };

        let service_class = cli.service_type.trim().trim_start_matches('_').to_string();
        if service_class.is_empty() {
            return Err(Error::Config("service type must not be empty".into()));
        }

        let allowed_origins: Vec<String> = cli
            .allowed_origins
            .into_iter()
            .map(|origin| origin.trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();
        let allowed_origins = if allowed_origins.is_empty() {
            default_origins()
        } else {
            allowed_origins
        };

        let config = Self {
            port: cli.port,
            device_name,
            service_class,
            allowed_origins,
            stale_after: Duration::from_secs(cli.stale_after_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            mailbox_capacity: cli.mailbox_capacity,
            mailbox_idle: Duration::from_secs(cli.mailbox_idle_secs),
            auto_accept: cli.auto_accept,
            log: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stale_after.is_zero() {
            return Err(Error::Config("staleness window must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("sweep interval must be positive".into()));
        }
        if self.sweep_interval > self.stale_after {
            return Err(Error::Config(format!(
                "sweep interval {:?} is longer than the staleness window {:?}",
                self.sweep_interval, self.stale_after
            )));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::Config("mailbox capacity must be positive".into()));
        }
        if self.mailbox_idle.is_zero() {
            return Err(Error::Config("mailbox idle window must be positive".into()));
        }
        Ok(())
    }
}

fn default_origins() -> Vec<String> {
    DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect()
}

/// The system hostname without any domain part.
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.split('.').next().unwrap_or_default().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_string())
}
