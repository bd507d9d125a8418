use std::sync::Arc;

use crate::config::Config;
use crate::master::Master;
use crate::metrics::Metrics;

struct AppStateInner {
    master: Arc<Master>,
    config: Config,
    metrics: Metrics,
}

/// Shared application state, threaded through axum as an extractor. Cheap to
/// clone: everything behind the `Arc` is constructed once at startup.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

impl AppState {
    pub fn new(master: Arc<Master>, config: Config, metrics: Metrics) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                master,
                config,
                metrics,
            }),
        }
    }

    pub fn master(&self) -> &Arc<Master> {
        &self.inner.master
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }
}
