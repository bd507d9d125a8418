//! [`Handle`]: a lazily-materialized reference to one cached artifact's bytes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::backend::{DecodedImage, ImageBackend, ObjectStoreClient};
use crate::error::AppError;

struct RemoteRef {
    client: Arc<dyn ObjectStoreClient>,
    container: String,
    key: String,
}

impl Clone for RemoteRef {
    fn clone(&self) -> Self {
        RemoteRef {
            client: self.client.clone(),
            container: self.container.clone(),
            key: self.key.clone(),
        }
    }
}

struct HandleInner {
    memory: Option<Vec<u8>>,
    local_path: Option<PathBuf>,
    remote: Option<RemoteRef>,
    decoded: Option<DecodedImage>,
    format: String,
    known_size: Option<u64>,
}

/// A reference to cached bytes that may live in memory, on local disk, or in
/// a remote object store, and may additionally carry a decoded in-memory
/// image. At most one of those forms is ever held strongly at a time beyond
/// what was used to construct it; [`Handle::weaken`] drops the decoded hold.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Mutex<HandleInner>>,
}

impl Handle {
    pub fn from_bytes(bytes: Vec<u8>, format: impl Into<String>) -> Self {
        let known_size = Some(bytes.len() as u64);
        Handle {
            inner: Arc::new(Mutex::new(HandleInner {
                memory: Some(bytes),
                local_path: None,
                remote: None,
                decoded: None,
                format: format.into(),
                known_size,
            })),
        }
    }

    pub fn from_local_path(path: PathBuf, format: impl Into<String>, size: Option<u64>) -> Self {
        Handle {
            inner: Arc::new(Mutex::new(HandleInner {
                memory: None,
                local_path: Some(path),
                remote: None,
                decoded: None,
                format: format.into(),
                known_size: size,
            })),
        }
    }

    pub fn from_remote(
        client: Arc<dyn ObjectStoreClient>,
        container: impl Into<String>,
        key: impl Into<String>,
        format: impl Into<String>,
        size: Option<u64>,
    ) -> Self {
        Handle {
            inner: Arc::new(Mutex::new(HandleInner {
                memory: None,
                local_path: None,
                remote: Some(RemoteRef {
                    client,
                    container: container.into(),
                    key: key.into(),
                }),
                decoded: None,
                format: format.into(),
                known_size: size,
            })),
        }
    }

    pub async fn format(&self) -> String {
        self.inner.lock().await.format.clone()
    }

    /// Best-effort size without touching disk or network. Zero means unknown.
    pub async fn size_hint(&self) -> u64 {
        let inner = self.inner.lock().await;
        if let Some(mem) = &inner.memory {
            return mem.len() as u64;
        }
        inner.known_size.unwrap_or(0)
    }

    pub async fn has_persistence(&self) -> bool {
        self.inner.lock().await.remote.is_some()
    }

    pub async fn local_path(&self) -> Option<PathBuf> {
        self.inner.lock().await.local_path.clone()
    }

    /// Ensures a file copy exists under `dir` and returns its path. Idempotent:
    /// a handle that already has a local path returns it unchanged.
    pub async fn as_local_file(&self, dir: &std::path::Path) -> Result<PathBuf, AppError> {
        if let Some(path) = self.local_path().await {
            return Ok(path);
        }
        let bytes = self.bytes().await?;
        let format = self.format().await;
        let digest = format!("{:x}", md5::compute(&bytes));
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{digest}.{format}"));
        tokio::fs::write(&path, &bytes).await?;
        let mut inner = self.inner.lock().await;
        inner.local_path = Some(path.clone());
        Ok(path)
    }

    /// Ensures the artifact exists in the remote store under `name`, recording
    /// the remote path. Idempotent: once a remote path is known, further
    /// calls are no-ops.
    pub async fn as_persistent(
        &self,
        name: &str,
        store: Arc<dyn ObjectStoreClient>,
        container: &str,
    ) -> Result<(), AppError> {
        if self.has_persistence().await {
            return Ok(());
        }
        let bytes = self.bytes().await?;
        let format = self.format().await;
        store
            .put(
                container,
                name,
                &bytes,
                &crate::tier::remote_cache::content_type_for(&format),
            )
            .await
            .map_err(AppError::Other)?;
        let mut inner = self.inner.lock().await;
        inner.remote = Some(RemoteRef {
            client: store,
            container: container.to_string(),
            key: name.to_string(),
        });
        Ok(())
    }

    /// Materializes and returns the raw bytes, searching in-memory, then
    /// local file, then remote storage, in that order.
    pub async fn bytes(&self) -> Result<Vec<u8>, AppError> {
        {
            let inner = self.inner.lock().await;
            if let Some(mem) = &inner.memory {
                return Ok(mem.clone());
            }
        }
        let local_path = { self.inner.lock().await.local_path.clone() };
        if let Some(path) = local_path {
            let bytes = tokio::fs::read(&path).await?;
            let mut inner = self.inner.lock().await;
            inner.memory = Some(bytes.clone());
            return Ok(bytes);
        }
        let remote = { self.inner.lock().await.remote.clone() };
        if let Some(remote) = remote {
            let bytes = remote
                .client
                .get(&remote.container, &remote.key)
                .await
                .map_err(|e| AppError::IoError(std::io::Error::other(e.to_string())))?;
            let mut inner = self.inner.lock().await;
            inner.memory = Some(bytes.clone());
            return Ok(bytes);
        }
        Err(AppError::IoError(std::io::Error::other(
            "no reachable source for handle bytes",
        )))
    }

    pub async fn md5(&self) -> Result<String, AppError> {
        let bytes = self.bytes().await?;
        Ok(format!("{:x}", md5::compute(&bytes)))
    }

    /// A new handle with the same backing pointers but an independent mutable
    /// state cell; mutating one's decoded hold never affects the other.
    pub async fn clone_handle(&self) -> Handle {
        let inner = self.inner.lock().await;
        Handle {
            inner: Arc::new(Mutex::new(HandleInner {
                memory: inner.memory.clone(),
                local_path: inner.local_path.clone(),
                remote: inner.remote.clone(),
                decoded: inner.decoded.clone(),
                format: inner.format.clone(),
                known_size: inner.known_size,
            })),
        }
    }

    /// Drops the decoded image hold, if any, without disturbing the
    /// materialized bytes behind it.
    pub async fn weaken(&self) {
        self.inner.lock().await.decoded = None;
    }

    async fn decode_cached(&self, backend: &dyn ImageBackend) -> Result<DecodedImage, AppError> {
        {
            let inner = self.inner.lock().await;
            if let Some(decoded) = &inner.decoded {
                return Ok(decoded.clone());
            }
        }
        let bytes = self.bytes().await?;
        let decoded = backend.decode(&bytes)?;
        let mut inner = self.inner.lock().await;
        inner.decoded = Some(decoded.clone());
        Ok(decoded)
    }

    pub async fn convert(&self, backend: &dyn ImageBackend, format: &str) -> Result<Handle, AppError> {
        if self.format().await == format {
            return Ok(self.clone());
        }
        let decoded = self.decode_cached(backend).await?;
        let bytes = backend.encode(&decoded, format)?;
        Ok(Handle::from_bytes(bytes, format))
    }

    pub async fn crop(
        &self,
        backend: &dyn ImageBackend,
        w: u32,
        h: u32,
        x: u32,
        y: u32,
        format: &str,
    ) -> Result<Handle, AppError> {
        let decoded = self.decode_cached(backend).await?;
        let cropped = backend.crop(&decoded, w, h, x, y);
        let bytes = backend.encode(&cropped, format)?;
        Ok(Handle::from_bytes(bytes, format))
    }

    pub async fn resize(
        &self,
        backend: &dyn ImageBackend,
        w: u32,
        h: u32,
        format: &str,
    ) -> Result<Handle, AppError> {
        let decoded = self.decode_cached(backend).await?;
        let resized = backend.resize(&decoded, w, h);
        let bytes = backend.encode(&resized, format)?;
        Ok(Handle::from_bytes(bytes, format))
    }

    pub async fn thumbnail(
        &self,
        backend: &dyn ImageBackend,
        w: u32,
        h: u32,
        flags: crate::name::ThumbnailFlags,
        format: &str,
        liquid_cutin_ratio: f64,
    ) -> Result<Handle, AppError> {
        let decoded = self.decode_cached(backend).await?;
        let mut image = if flags.liquid {
            let (sw, sh) = decoded.dimensions();
            let src_ratio = sw as f64 / sh.max(1) as f64;
            let target_ratio = w as f64 / h.max(1) as f64;
            let (lw, lh) = if src_ratio > liquid_cutin_ratio {
                (((h as f64) * liquid_cutin_ratio).round() as u32, h)
            } else if target_ratio > 0.0 && (1.0 / src_ratio) > liquid_cutin_ratio {
                (w, ((w as f64) / liquid_cutin_ratio).round() as u32)
            } else {
                (w, h)
            };
            backend
                .liquid_rescale(&decoded, lw, lh)
                .unwrap_or_else(|| backend.fit(&decoded, w, h))
        } else {
            backend.fit(&decoded, w, h)
        };
        if flags.equalise {
            image = backend.equalize(&image);
        }
        if flags.sharpen {
            image = backend.unsharp_mask(&image);
        }
        let bytes = backend.encode(&image, format)?;
        Ok(Handle::from_bytes(bytes, format))
    }

    pub async fn extract_metadata(
        &self,
        backend: &dyn ImageBackend,
    ) -> Result<Vec<(String, String)>, AppError> {
        let decoded = self.decode_cached(backend).await?;
        Ok(backend.extract_metadata(&decoded))
    }

    pub async fn sign_url(&self, lifetime: Duration) -> Result<String, AppError> {
        let remote = { self.inner.lock().await.remote.clone() };
        let remote = remote.ok_or_else(|| {
            AppError::NotPersistable("handle has no remote backing to sign a url for".into())
        })?;
        remote
            .client
            .sign_url(&remote.container, &remote.key, lifetime)
            .await
            .map_err(|e| AppError::Other(e))
    }
}
