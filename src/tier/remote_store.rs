//! Remote-store tier medium: the permanent, durable object-store backing for
//! originals and any derivative explicitly made persistent. Configured with
//! no size/count bound, so `clean` never evicts from it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::ObjectStoreClient;
use crate::error::AppError;
use crate::handle::Handle;

use super::TierMedium;

pub struct RemoteStoreMedium {
    client: Arc<dyn ObjectStoreClient>,
    container: String,
}

impl RemoteStoreMedium {
    pub fn new(client: Arc<dyn ObjectStoreClient>, container: impl Into<String>) -> Self {
        RemoteStoreMedium {
            client,
            container: container.into(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn client(&self) -> Arc<dyn ObjectStoreClient> {
        self.client.clone()
    }
}

#[async_trait]
impl TierMedium for RemoteStoreMedium {
    fn label(&self) -> &'static str {
        "remote_store"
    }

    async fn store_bytes(&self, name: &str, handle: &Handle) -> Result<(), AppError> {
        handle
            .as_persistent(name, self.client.clone(), &self.container)
            .await?;
        debug!(container = %self.container, name, "wrote remote store entry");
        Ok(())
    }

    async fn remove_bytes(&self, name: &str) -> Result<(), AppError> {
        self.client
            .delete(&self.container, name)
            .await
            .map_err(AppError::Other)
    }

    async fn read_bytes(&self, name: &str) -> Result<Option<Handle>, AppError> {
        let stat = self
            .client
            .stat(&self.container, name)
            .await
            .map_err(AppError::Other)?;
        let Some(stat) = stat else {
            return Ok(None);
        };
        let format = name.rsplit('.').next().unwrap_or("bin").to_string();
        Ok(Some(Handle::from_remote(
            self.client.clone(),
            self.container.clone(),
            name.to_string(),
            format,
            Some(stat.size),
        )))
    }

    async fn startup_scan(&self) -> Result<Vec<(String, super::Entry)>, AppError> {
        super::scan_remote_objects(&self.client, &self.container, true).await
    }
}
