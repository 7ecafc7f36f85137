use anyhow::{bail, Context};
use protocol::{defaults, CommandPayload};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;

pub(crate) const AUTH_TOKEN_ENV: &str = "RELAY_AUTH_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RelayConfig {
    #[serde(default = "default_listen_addr")]
    pub(crate) listen_addr: String,
    #[serde(default)]
    pub(crate) auth_token: String,
    #[serde(default = "default_data_dir")]
    pub(crate) data_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub(crate) log_dir: PathBuf,
    #[serde(default)]
    pub(crate) timeouts: TimeoutConfig,
    #[serde(default)]
    pub(crate) liveness: LivenessConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_token: String::new(),
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            timeouts: TimeoutConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

impl RelayConfig {
    pub(crate) fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// File (when present), then environment, then command line.
    pub(crate) fn resolve(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => Self::default(),
        };
        if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
            config.auth_token = token;
        }
        if let Some(listen_addr) = &args.listen_addr {
            config.listen_addr = listen_addr.clone();
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(log_dir) = &args.log_dir {
            config.log_dir = log_dir.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.auth_token.trim().is_empty() {
            bail!("auth_token is empty; set it in the config file or via {AUTH_TOKEN_ENV}");
        }
        if self.timeouts.max_secs == 0 {
            bail!("timeouts.max_secs must be positive");
        }
        if self.liveness.ping_interval_secs == 0 || self.liveness.grace_secs == 0 {
            bail!("liveness intervals must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TimeoutConfig {
    #[serde(default = "default_shell_timeout")]
    pub(crate) default_secs: u64,
    #[serde(default = "default_max_timeout")]
    pub(crate) max_secs: u64,
    #[serde(default = "default_file_timeout")]
    pub(crate) file_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: default_shell_timeout(),
            max_secs: default_max_timeout(),
            file_secs: default_file_timeout(),
        }
    }
}

impl TimeoutConfig {
    /// Settles the timeout for `payload` and writes it back into shell payloads so
    /// the executor enforces the same bound. A shell timeout of 0 means "default".
    pub(crate) fn apply(&self, payload: &mut CommandPayload) -> u64 {
        match payload {
            CommandPayload::Shell { timeout_secs, .. } => {
                let requested = if *timeout_secs == 0 {
                    self.default_secs
                } else {
                    *timeout_secs
                };
                *timeout_secs = requested.clamp(1, self.max_secs);
                *timeout_secs
            }
            _ => self.file_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LivenessConfig {
    #[serde(default = "default_ping_interval")]
    pub(crate) ping_interval_secs: u64,
    #[serde(default = "default_grace")]
    pub(crate) grace_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            grace_secs: default_grace(),
        }
    }
}

impl LivenessConfig {
    pub(crate) fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub(crate) fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8700".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_shell_timeout() -> u64 {
    defaults::SHELL_TIMEOUT_SECS
}

fn default_max_timeout() -> u64 {
    defaults::MAX_TIMEOUT_SECS
}

fn default_file_timeout() -> u64 {
    defaults::FILE_TIMEOUT_SECS
}

fn default_ping_interval() -> u64 {
    defaults::PING_INTERVAL_SECS
}

fn default_grace() -> u64 {
    defaults::LIVENESS_GRACE_SECS
}
