//! Configuration for anyslk.
//!
//! Settings come from an optional INI file (under a `[params]` section) and
//! are then overridden by command line flags. The resulting [`Config`] is
//! built once at startup and never mutated afterwards.

use crate::message::BodyMode;
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command line interface.
#[derive(Debug, Parser)]
#[command(
    name = "anyslk",
    version,
    disable_version_flag = true,
    about = "* -> slack message",
    long_about = "Accepts mail over SMTP and posts every message to a Slack incoming webhook.\n\
                  The channel is taken from the local part of the recipient address."
)]
pub struct Args {
    /// Show version
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SMTP server host
    #[arg(long)]
    pub smtp_host: Option<String>,

    /// SMTP server port, 0 disables the SMTP server
    #[arg(long)]
    pub smtp_port: Option<u16>,

    /// Log directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Listen on the socket handed over by the process supervisor
    #[arg(long)]
    pub use_inherited_socket: bool,

    /// How the DATA payload is turned into a notification
    #[arg(long, value_enum)]
    pub body_mode: Option<BodyMode>,

    /// Extra webhook attempts after a failed delivery
    #[arg(long)]
    pub webhook_retries: Option<u32>,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long)]
    pub drain_timeout: Option<u64>,
}

/// anyslk configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "Config::default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub use_inherited_socket: bool,
    #[serde(default = "Config::default_domain")]
    pub domain: String,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_body_mode")]
    pub body_mode: BodyMode,
    #[serde(default = "Config::default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "Config::default_max_recipients")]
    pub max_recipients: usize,
    #[serde(default = "Config::default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default)]
    pub webhook_retries: u32,
    #[serde(default = "Config::default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigWrapper {
    // The whole actual config is under `params` section.
    pub params: Config,
}

/// Custom deserializer to parse a [`BodyMode`] from its name.
fn deserialize_body_mode<'de, D>(deserializer: D) -> Result<BodyMode, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    match s.as_deref().map(str::trim) {
        None | Some("") => Ok(BodyMode::default()),
        Some(name) => name.parse().map_err(serde::de::Error::custom),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smtp_host: Self::default_smtp_host(),
            smtp_port: Self::default_smtp_port(),
            use_inherited_socket: false,
            domain: Self::default_domain(),
            log_dir: None,
            body_mode: BodyMode::default(),
            max_message_size: Self::default_max_message_size(),
            max_recipients: Self::default_max_recipients(),
            io_timeout_secs: Self::default_io_timeout(),
            webhook_retries: 0,
            drain_timeout_secs: Self::default_drain_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, crate::error::Error> {
        let content = std::fs::read_to_string(path)?;
        let wrapped_config: ConfigWrapper = serini::from_str(&content)?;
        Ok(wrapped_config.params)
    }

    /// Build the configuration from the config file named in `args` (if any),
    /// with every flag given on the command line taking precedence.
    pub fn load(args: &Args) -> Result<Self, crate::error::Error> {
        let base = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        Ok(base.with_args(args))
    }

    fn with_args(mut self, args: &Args) -> Self {
        if let Some(host) = &args.smtp_host {
            self.smtp_host = host.clone();
        }
        if let Some(port) = args.smtp_port {
            self.smtp_port = port;
        }
        if args.use_inherited_socket {
            self.use_inherited_socket = true;
        }
        if let Some(dir) = &args.log_dir {
            self.log_dir = Some(dir.clone());
        }
        if let Some(mode) = args.body_mode {
            self.body_mode = mode;
        }
        if let Some(retries) = args.webhook_retries {
            self.webhook_retries = retries;
        }
        if let Some(secs) = args.drain_timeout {
            self.drain_timeout_secs = secs;
        }
        self
    }

    /// Address the SMTP server binds to when no socket is inherited.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.smtp_host, self.smtp_port)
    }

    /// Read and write timeout applied to every client connection.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Upper bound on how long shutdown waits for in-flight connections.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    // Following are needed since serde does not support default literals.

    fn default_smtp_host() -> String {
        "127.0.0.1".to_string()
    }
    const fn default_smtp_port() -> u16 {
        1025
    }
    fn default_domain() -> String {
        "anyslk.local".to_string()
    }
    const fn default_max_message_size() -> usize {
        1024 * 1024
    }
    const fn default_max_recipients() -> usize {
        50
    }
    const fn default_io_timeout() -> u64 {
        1000
    }
    const fn default_drain_timeout() -> u64 {
        10
    }
}
