use anyhow::{anyhow, Context};
use clap::Parser;
use ip_network::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use telemon_storage::StorageConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between snapshot writes; 0 persists after every write.
    #[serde(default = "default_store_interval")]
    pub store_interval_secs: u64,
    /// Snapshot file for the in-memory backend. Empty disables snapshots.
    #[serde(default = "default_file_storage_path")]
    pub file_storage_path: String,
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// Selects the relational backend when non-empty.
    #[serde(default)]
    pub database_dsn: Option<String>,
    #[serde(default)]
    pub hash_key: Option<String>,
    /// PEM file with the private key matching the agents' public key.
    #[serde(default)]
    pub crypto_key: Option<PathBuf>,
    /// CIDR that ingestion requests must originate from, judged by
    /// `X-Real-IP`.
    #[serde(default)]
    pub trusted_subnet: Option<String>,
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_interval() -> u64 {
    300
}

fn default_file_storage_path() -> String {
    "./storage.json".to_string()
}

fn default_restore() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            log_level: default_log_level(),
            store_interval_secs: default_store_interval(),
            file_storage_path: default_file_storage_path(),
            restore: default_restore(),
            database_dsn: None,
            hash_key: None,
            crypto_key: None,
            trusted_subnet: None,
        }
    }
}

#[derive(Debug, Default, Parser)]
#[command(name = "telemon-server", version, about = "Receives and stores telemon metrics")]
pub struct ServerArgs {
    /// TOML config file
    #[arg(short = 'c', long = "config", env = "CONFIG")]
    pub config: Option<PathBuf>,
    /// Listen address
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,
    #[arg(long = "log-level", env = "LOG_LEVEL")]
    pub log_level: Option<String>,
    /// Snapshot interval in seconds (0 = after every write)
    #[arg(short = 'i', long = "store-interval", env = "STORE_INTERVAL")]
    pub store_interval: Option<u64>,
    /// Snapshot file path
    #[arg(short = 'f', long = "file-storage-path", env = "FILE_STORAGE_PATH")]
    pub file_storage_path: Option<String>,
    /// Load the snapshot on start
    #[arg(short = 'r', long, env = "RESTORE")]
    pub restore: Option<bool>,
    /// Database connection string
    #[arg(short = 'd', long = "database-dsn", env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,
    /// HMAC signing key
    #[arg(short = 'k', long = "key", env = "KEY")]
    pub key: Option<String>,
    /// Private key (PEM) for encrypted batches
    #[arg(long = "crypto-key", env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,
    /// Trusted CIDR for ingestion
    #[arg(short = 't', long = "trusted-subnet", env = "TRUSTED_SUBNET")]
    pub trusted_subnet: Option<String>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Flags and environment win over the config file.
    pub fn from_args(args: ServerArgs) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(address) = args.address {
            config.address = address;
        }
        if let Some(level) = args.log_level {
            config.log_level = level;
        }
        if let Some(secs) = args.store_interval {
            config.store_interval_secs = secs;
        }
        if let Some(path) = args.file_storage_path {
            config.file_storage_path = path;
        }
        if let Some(restore) = args.restore {
            config.restore = restore;
        }
        if let Some(dsn) = args.database_dsn {
            config.database_dsn = Some(dsn);
        }
        if let Some(key) = args.key {
            config.hash_key = Some(key);
        }
        if let Some(path) = args.crypto_key {
            config.crypto_key = Some(path);
        }
        if let Some(subnet) = args.trusted_subnet {
            config.trusted_subnet = Some(subnet);
        }
        config.trusted_subnet()?;
        Ok(config)
    }

    pub fn hash_key(&self) -> Option<&str> {
        self.hash_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn database_dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|d| !d.is_empty())
    }

    /// Periodic snapshot interval, or `None` when snapshots are written
    /// synchronously.
    pub fn store_interval(&self) -> Option<Duration> {
        (self.store_interval_secs > 0).then(|| Duration::from_secs(self.store_interval_secs))
    }

    /// Parses the trusted subnet. Host bits in a CIDR value are masked off,
    /// so `192.168.1.5/24` means `192.168.1.0/24`; a bare address is taken
    /// as a single-host network.
    pub fn trusted_subnet(&self) -> anyhow::Result<Option<IpNetwork>> {
        let Some(raw) = self.trusted_subnet.as_deref().map(str::trim).filter(|s| !s.is_empty())
        else {
            return Ok(None);
        };
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (raw, None),
        };
        let ip = IpAddr::from_str(addr).map_err(|_| anyhow!("invalid trusted subnet: {raw}"))?;
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| anyhow!("invalid trusted subnet prefix: {raw}"))?,
            None if ip.is_ipv4() => 32,
            None => 128,
        };
        IpNetwork::new_truncate(ip, prefix)
            .map(Some)
            .map_err(|e| anyhow!("invalid trusted subnet {raw}: {e}"))
    }

    pub fn storage_config(&self) -> StorageConfig {
        let file_path = Some(self.file_storage_path.trim())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        StorageConfig {
            database_url: self.database_dsn().map(str::to_string),
            file_path,
            sync_persist: self.store_interval_secs == 0,
            restore: self.restore,
        }
    }
}
