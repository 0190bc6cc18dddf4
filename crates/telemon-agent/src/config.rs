use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Collector address, `host:port` or a full base URL.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Maximum number of jobs running at once.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    /// Shared HMAC key; batches are signed when set.
    #[serde(default)]
    pub hash_key: Option<String>,
    /// PEM file with the collector's public key; batches are encrypted when
    /// set.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,
    /// Sent as `X-Real-IP` so a collector with a trusted subnet can admit us.
    #[serde(default)]
    pub real_ip: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

fn default_report_interval() -> u64 {
    10
}

fn default_rate_limit() -> usize {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            poll_interval_secs: default_poll_interval(),
            report_interval_secs: default_report_interval(),
            rate_limit: default_rate_limit(),
            hash_key: None,
            crypto_key: None,
            real_ip: None,
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Command-line flags. Every flag can also come from the environment; both
/// take precedence over the config file.
#[derive(Debug, Default, Parser)]
#[command(name = "telemon-agent", version, about = "Collects host metrics and reports them to a telemon server")]
pub struct AgentArgs {
    /// TOML config file
    #[arg(short = 'c', long = "config", env = "CONFIG")]
    pub config: Option<PathBuf>,
    /// Server address
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,
    /// Poll interval in seconds
    #[arg(short = 'p', long = "poll-interval", env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,
    /// Report interval in seconds
    #[arg(short = 'r', long = "report-interval", env = "REPORT_INTERVAL")]
    pub report_interval: Option<u64>,
    /// HMAC signing key
    #[arg(short = 'k', long = "key", env = "KEY")]
    pub key: Option<String>,
    /// Concurrent job limit
    #[arg(short = 'l', long = "rate-limit", env = "RATE_LIMIT")]
    pub rate_limit: Option<usize>,
    /// Server public key (PEM)
    #[arg(long = "crypto-key", env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,
    /// Origin address reported in X-Real-IP
    #[arg(long = "real-ip", env = "REAL_IP")]
    pub real_ip: Option<String>,
    #[arg(long = "log-level", env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Layers flags and environment over the optional config file, then
    /// validates the result.
    pub fn from_args(args: AgentArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(address) = args.address {
            config.address = address;
        }
        if let Some(secs) = args.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(secs) = args.report_interval {
            config.report_interval_secs = secs;
        }
        if let Some(key) = args.key {
            config.hash_key = Some(key);
        }
        if let Some(limit) = args.rate_limit {
            config.rate_limit = limit;
        }
        if let Some(path) = args.crypto_key {
            config.crypto_key = Some(path);
        }
        if let Some(ip) = args.real_ip {
            config.real_ip = Some(ip);
        }
        if let Some(level) = args.log_level {
            config.log_level = level;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("poll interval must be positive");
        }
        if self.report_interval_secs == 0 {
            bail!("report interval must be positive");
        }
        if self.rate_limit == 0 {
            bail!("rate limit must be positive");
        }
        if self.request_timeout_secs == 0 {
            bail!("request timeout must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The signing key, treating an empty string as unset.
    pub fn hash_key(&self) -> Option<&str> {
        self.hash_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Batch endpoint on the collector. Addresses without a scheme get
    /// `http://`.
    pub fn updates_url(&self) -> String {
        let addr = self.address.trim().trim_end_matches('/');
        if addr.contains("://") {
            format!("{addr}/updates/")
        } else {
            format!("http://{addr}/updates/")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.address, "127.0.0.1:8080");
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.report_interval_secs, 10);
        assert_eq!(config.rate_limit, 2);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.hash_key().is_none());
    }

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address = \"10.0.0.5:9000\"\nrate_limit = 8\nhash_key = \"\"").unwrap();

        let args = AgentArgs {
            config: Some(file.path().to_path_buf()),
            rate_limit: Some(3),
            ..AgentArgs::default()
        };
        let config = AgentConfig::from_args(args).unwrap();
        assert_eq!(config.address, "10.0.0.5:9000");
        assert_eq!(config.rate_limit, 3);
        assert!(config.hash_key().is_none());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let args = AgentArgs {
            poll_interval: Some(0),
            ..AgentArgs::default()
        };
        assert!(AgentConfig::from_args(args).is_err());

        let args = AgentArgs {
            rate_limit: Some(0),
            ..AgentArgs::default()
        };
        assert!(AgentConfig::from_args(args).is_err());
    }

    #[test]
    fn updates_url_adds_scheme_only_when_missing() {
        let mut config = AgentConfig::default();
        assert_eq!(config.updates_url(), "http://127.0.0.1:8080/updates/");
        config.address = "https://collector.internal/".into();
        assert_eq!(config.updates_url(), "https://collector.internal/updates/");
    }
}
