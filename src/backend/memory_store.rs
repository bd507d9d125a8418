//! An in-process stand-in for [`ObjectStoreClient`], used by tests and by
//! `imagevault serve --no-remote` to run without real cloud credentials.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use super::object_store::{ObjectInfo, ObjectStat, ObjectStoreClient};

#[derive(Default)]
struct Object {
    bytes: Vec<u8>,
    content_type: String,
    metadata: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    containers: Mutex<HashMap<String, HashMap<String, Object>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn list(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        let containers = self.containers.lock().map_err(|_| anyhow!("poisoned"))?;
        let Some(objects) = containers.get(container) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .iter()
            .map(|(name, obj)| ObjectInfo {
                name: name.clone(),
                size: obj.bytes.len() as u64,
                content_type: Some(obj.content_type.clone()),
            })
            .collect())
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        let containers = self.containers.lock().map_err(|_| anyhow!("poisoned"))?;
        containers
            .get(container)
            .and_then(|objs| objs.get(name))
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| anyhow!("object not found: {container}/{name}"))
    }

    async fn put(
        &self,
        container: &str,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<()> {
        let mut containers = self.containers.lock().map_err(|_| anyhow!("poisoned"))?;
        let objects = containers.entry(container.to_string()).or_default();
        objects.insert(
            name.to_string(),
            Object {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
                metadata: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete(&self, container: &str, name: &str) -> Result<()> {
        let mut containers = self.containers.lock().map_err(|_| anyhow!("poisoned"))?;
        if let Some(objects) = containers.get_mut(container) {
            objects.remove(name);
        }
        Ok(())
    }

    async fn stat(&self, container: &str, name: &str) -> Result<Option<ObjectStat>> {
        let containers = self.containers.lock().map_err(|_| anyhow!("poisoned"))?;
        Ok(containers
            .get(container)
            .and_then(|objs| objs.get(name))
            .map(|obj| ObjectStat {
                name: name.to_string(),
                size: obj.bytes.len() as u64,
                metadata: obj.metadata.clone(),
            }))
    }

    async fn post_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let mut containers = self.containers.lock().map_err(|_| anyhow!("poisoned"))?;
        let obj = containers
            .get_mut(container)
            .and_then(|objs| objs.get_mut(name))
            .ok_or_else(|| anyhow!("object not found: {container}/{name}"))?;
        obj.metadata.extend(metadata);
        Ok(())
    }

    async fn sign_url(&self, container: &str, name: &str, lifetime: Duration) -> Result<String> {
        Ok(format!(
            "memory://{container}/{name}?expires_in={}",
            lifetime.as_secs()
        ))
    }
}
