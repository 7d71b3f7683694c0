//! Shared handler state

use std::sync::Arc;

use tokio::sync::watch;

use crate::gateway::Gateway;
use crate::replication::Context;

/// Gateway handle shared across handlers
pub struct GatewayState {
    gateway: Arc<Gateway>,
    shutdown: watch::Receiver<bool>,
}

impl GatewayState {
    pub fn new(gateway: Arc<Gateway>, shutdown: watch::Receiver<bool>) -> Self {
        Self { gateway, shutdown }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Context of one request: the configured timeout, cancelled at shutdown
    pub fn request_context(&self) -> Context {
        Context::background()
            .with_timeout(self.gateway.config().request_timeout())
            .with_signal(self.shutdown.clone())
    }
}
