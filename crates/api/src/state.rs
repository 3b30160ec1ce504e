//! Application state

use std::sync::Arc;

use donorbridge_ingest::WebhookDispatcher;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub dispatcher: Arc<WebhookDispatcher>,
}

impl AppState {
    pub fn new(config: Config, dispatcher: WebhookDispatcher) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
        }
    }
}
