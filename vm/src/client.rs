use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use haven_service::{ServiceError, VirtualizationService};

use crate::error::VmError;

/// Establishes connections to the virtualization service. In production this
/// spawns (or attaches to) the privileged service process; tests inject a
/// connector that hands out fakes.
#[async_trait]
pub trait ServiceConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn VirtualizationService>, ServiceError>;
}

/// Lazily connected, cached handle to the virtualization service.
///
/// The connection is only made on first use. A cached connection that stops
/// answering its liveness probe is dropped and respawned through the
/// connector.
#[derive(Clone)]
pub struct ServiceClient {
    connector: Arc<dyn ServiceConnector>,
    cached: Arc<Mutex<Option<Arc<dyn VirtualizationService>>>>,
}

impl ServiceClient {
    pub fn new(connector: Arc<dyn ServiceConnector>) -> Self {
        Self {
            connector,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn VirtualizationService>, VmError> {
        let mut cached = self.cached.lock().await;
        if let Some(service) = cached.as_ref() {
            if service.is_healthy() {
                return Ok(service.clone());
            }
            debug!("cached virtualization service is gone, reconnecting");
            cached.take();
        }
        let service = self.connector.connect().await?;
        *cached = Some(service.clone());
        Ok(service)
    }
}
