//! Remote-cache tier medium: an object-store container used as a shared,
//! ephemeral cache between the local-file tier and the permanent remote
//! store. Distinguished from [`super::remote_store::RemoteStoreMedium`] only
//! by the container it points at and its tier bounds.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::ObjectStoreClient;
use crate::error::AppError;
use crate::handle::Handle;

use super::TierMedium;

pub struct RemoteCacheMedium {
    client: Arc<dyn ObjectStoreClient>,
    container: String,
}

impl RemoteCacheMedium {
    pub fn new(client: Arc<dyn ObjectStoreClient>, container: impl Into<String>) -> Self {
        RemoteCacheMedium {
            client,
            container: container.into(),
        }
    }
}

#[async_trait]
impl TierMedium for RemoteCacheMedium {
    fn label(&self) -> &'static str {
        "remote_cache"
    }

    async fn store_bytes(&self, name: &str, handle: &Handle) -> Result<(), AppError> {
        handle
            .as_persistent(name, self.client.clone(), &self.container)
            .await?;
        debug!(container = %self.container, name, "wrote remote cache entry");
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
        super::scan_remote_objects(&self.client, &self.container, false).await
    }
}

pub(crate) fn content_type_for(format: &str) -> String {
    match format {
        "jpg" | "jpeg" => "image/jpeg".to_string(),
        "png" => "image/png".to_string(),
        "gif" => "image/gif".to_string(),
        "webp" => "image/webp".to_string(),
        "bmp" => "image/bmp".to_string(),
        other => format!("application/{other}"),
    }
}
