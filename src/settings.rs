use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    "127.0.0.1:8000".parse().expect("static listen address")
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_client_timeout() -> u64 {
    10
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_max_response_size() -> u64 {
    64 * 1024 * 1024
}

fn default_max_connections() -> usize {
    1024
}

fn default_cache_max_entry_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_total_capacity() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_cache_sweeper_interval() -> u64 {
    300
}

fn default_cache_sweeper_batch_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_max_response_size")]
    pub max_response_size: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_cache_max_entry_size")]
    pub cache_max_entry_size: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_total_capacity")]
    pub cache_total_capacity: u64,
    /// Time-to-live for cache entries in seconds. Absent means entries never
    /// expire; header-driven expiry is deliberately not interpreted.
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    #[serde(default = "default_cache_sweeper_interval")]
    pub cache_sweeper_interval: u64,
    #[serde(default = "default_cache_sweeper_batch_size")]
    pub cache_sweeper_batch_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CACHEWARD")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        if let Some(port) = cli.port {
            settings.listen.set_port(port);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl.map(Duration::from_secs)
    }

    pub fn cache_sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweeper_interval)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.max_response_size > 0,
            "max_response_size must be greater than 0 (got {})",
            self.max_response_size
        );
        ensure!(
            self.max_connections > 0,
            "max_connections must be at least 1 (got {})",
            self.max_connections
        );
        if self.cache_dir.is_some() {
            ensure!(
                self.cache_max_entry_size > 0,
                "cache_max_entry_size must be greater than 0 (got {})",
                self.cache_max_entry_size
            );
            ensure!(
                self.cache_max_entries > 0,
                "cache_max_entries must be greater than 0 (got {})",
                self.cache_max_entries
            );
            ensure!(
                self.cache_total_capacity > 0,
                "cache_total_capacity must be greater than 0 (got {})",
                self.cache_total_capacity
            );
            if let Some(ttl) = self.cache_ttl {
                ensure!(ttl > 0, "cache_ttl must be greater than 0 seconds (got 0)");
                ensure!(
                    self.cache_sweeper_interval > 0,
                    "cache_sweeper_interval must be greater than 0 seconds (got {})",
                    self.cache_sweeper_interval
                );
                ensure!(
                    self.cache_sweeper_batch_size > 0,
                    "cache_sweeper_batch_size must be greater than 0 (got {})",
                    self.cache_sweeper_batch_size
                );
            }
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Some(path.to_path_buf());
    }
    let default = PathBuf::from("cacheward.toml");
    default.exists().then_some(default)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
