pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let cache = if let Some(cache_dir) = &settings.cache_dir {
        Some(Arc::new(
            proxy::cache::HttpCache::new(
                settings.cache_max_entries,
                cache_dir.clone(),
                settings.cache_max_entry_size,
                settings.cache_total_capacity,
                settings.cache_ttl(),
                settings.cache_sweeper_interval(),
                settings.cache_sweeper_batch_size,
            )
            .await?,
        ))
    } else {
        None
    };

    let app = proxy::AppContext::new(settings, cache);
    proxy::run(app).await
}
