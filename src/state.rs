use std::sync::Arc;

use crate::config::AppConfig;

/// Built once at startup; request handlers only read it.
pub struct AppState {
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}
