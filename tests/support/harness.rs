use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use cacheward::{
    cli::LogFormat,
    proxy::{self, AppContext, cache::HttpCache},
    settings::Settings,
};

use super::dirs::TestDirs;
use super::net::{find_free_port, wait_for_listener};

fn default_test_settings(listen: SocketAddr, dirs: &TestDirs) -> Settings {
    Settings {
        listen,
        log: LogFormat::Text,
        client_timeout: 10,
        upstream_connect_timeout: 5,
        upstream_timeout: 10,
        max_request_header_size: 32 * 1024,
        max_response_header_size: 4096,
        max_request_body_size: 1024 * 1024,
        max_response_size: 10 * 1024 * 1024,
        max_connections: 64,
        cache_dir: dirs.cache_dir.clone(),
        cache_max_entry_size: 10 * 1024 * 1024,
        cache_max_entries: 10_000,
        cache_total_capacity: 1024 * 1024 * 1024,
        cache_ttl: None,
        cache_sweeper_interval: 300,
        cache_sweeper_batch_size: 1000,
        metrics_listen: None,
    }
}

pub struct ProxyHarness {
    pub dirs: TestDirs,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub cache: Option<Arc<HttpCache>>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    pub async fn shutdown(self) {
        self.shutdown_into_dirs().await;
    }

    /// Stop the proxy but keep the backing directories alive, so a second
    /// harness can be spawned over the same cache.
    pub async fn shutdown_into_dirs(self) -> TestDirs {
        let ProxyHarness { dirs, handle, .. } = self;
        handle.abort();
        let _ = handle.await;
        dirs
    }
}

pub struct ProxyHarnessBuilder {
    dirs: TestDirs,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self::with_dirs(TestDirs::new()?))
    }

    pub fn with_dirs(dirs: TestDirs) -> Self {
        Self {
            dirs,
            settings_override: None,
        }
    }

    pub fn with_cache_dir(mut self) -> Result<Self> {
        self.dirs.enable_cache_dir()?;
        Ok(self)
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let proxy_port = find_free_port()?;
        let proxy_addr: SocketAddr = format!("127.0.0.1:{proxy_port}")
            .parse()
            .expect("valid listen address");

        let mut settings = default_test_settings(proxy_addr, &self.dirs);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        let proxy_addr = settings.listen;
        let settings = Arc::new(settings);

        let cache = if let Some(cache_dir) = settings.cache_dir.clone() {
            Some(Arc::new(
                HttpCache::new(
                    settings.cache_max_entries,
                    cache_dir,
                    settings.cache_max_entry_size,
                    settings.cache_total_capacity,
                    settings.cache_ttl.map(StdDuration::from_secs),
                    StdDuration::from_secs(settings.cache_sweeper_interval),
                    settings.cache_sweeper_batch_size,
                )
                .await?,
            ))
        } else {
            None
        };

        let app = AppContext::new(settings.clone(), cache.clone());
        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::run(app).await {
                tracing::error!(error = ?err, "proxy run failed");
            }
        });

        wait_for_listener(proxy_addr).await?;

        Ok(ProxyHarness {
            dirs: self.dirs,
            addr: proxy_addr,
            settings,
            cache,
            handle,
        })
    }
}
