pub mod cache;
pub mod http;
pub mod listener;
pub mod request;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::settings::Settings;

#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Option<Arc<cache::HttpCache>>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: Option<Arc<cache::HttpCache>>) -> Self {
        Self { settings, cache }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    tokio::select! {
        result = listener::start_listener(app) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
