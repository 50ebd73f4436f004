use std::sync::Arc;

use crate::broker::Broker;
use crate::config::Config;
use crate::error::Result;
use crate::security::SessionKeys;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub broker: Arc<Broker>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let keys = SessionKeys::from_config(config.session_secret.as_deref())?;
        let broker = Broker::new(keys, config.session_expiry());

        Ok(Self {
            config: Arc::new(config),
            broker: Arc::new(broker),
        })
    }
}
