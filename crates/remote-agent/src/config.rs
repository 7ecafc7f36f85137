use anyhow::{bail, Context};
use protocol::defaults;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::cli::Args;

pub(crate) const AUTH_TOKEN_ENV: &str = "AGENT_AUTH_TOKEN";
pub(crate) const RELAY_URL_ENV: &str = "RELAY_URL";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AgentConfig {
    #[serde(default)]
    pub(crate) relay_url: String,
    #[serde(default)]
    pub(crate) auth_token: String,
    #[serde(default = "default_allowed_roots")]
    pub(crate) allowed_roots: Vec<String>,
    #[serde(default = "default_max_output_bytes")]
    pub(crate) max_output_bytes: usize,
    #[serde(default = "default_reconnect_delay")]
    pub(crate) reconnect_delay_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub(crate) ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout")]
    pub(crate) pong_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub(crate) max_concurrency: usize,
    /// Falls back to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub(crate) shell: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: String::new(),
            auth_token: String::new(),
            allowed_roots: default_allowed_roots(),
            max_output_bytes: default_max_output_bytes(),
            reconnect_delay_secs: default_reconnect_delay(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            max_concurrency: default_max_concurrency(),
            shell: None,
        }
    }
}

impl AgentConfig {
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
        if let Ok(url) = std::env::var(RELAY_URL_ENV) {
            config.relay_url = url;
        }
        if let Some(url) = &args.relay_url {
            config.relay_url = url.clone();
        }
        if let Some(max_concurrency) = args.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.relay_url.trim().is_empty() {
            bail!("relay_url is empty; set it in the config file, via {RELAY_URL_ENV} or --relay-url");
        }
        if !self.relay_url.starts_with("ws://") {
            bail!("relay_url must be a ws:// URL; TLS is expected to be terminated by a local tunnel");
        }
        if self.auth_token.trim().is_empty() {
            bail!("auth_token is empty; set it in the config file or via {AUTH_TOKEN_ENV}");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.ping_interval_secs == 0 {
            bail!("ping_interval_secs must be positive");
        }
        Ok(())
    }

    pub(crate) fn shell(&self) -> String {
        self.shell
            .clone()
            .filter(|shell| !shell.trim().is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|shell| !shell.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    pub(crate) fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub(crate) fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Silence from the relay longer than this drops the connection.
    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs + self.pong_timeout_secs)
    }
}

fn default_allowed_roots() -> Vec<String> {
    vec!["~".to_string(), "/tmp".to_string(), "/var/tmp".to_string()]
}

fn default_max_output_bytes() -> usize {
    defaults::MAX_OUTPUT_BYTES
}

fn default_reconnect_delay() -> u64 {
    defaults::RECONNECT_DELAY_SECS
}

fn default_ping_interval() -> u64 {
    defaults::PING_INTERVAL_SECS
}

fn default_pong_timeout() -> u64 {
    defaults::PONG_TIMEOUT_SECS
}

fn default_max_concurrency() -> usize {
    1
}
