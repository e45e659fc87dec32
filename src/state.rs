use crate::config::Config;
use crate::store::AggregateStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<AggregateStore>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<AggregateStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
        }
    }
}
