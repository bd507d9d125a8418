//! Local-disk tier medium.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::handle::Handle;

use super::{Entry, TierMedium, new_entry};

/// Percent-encodes whatever is left of a cache key after we strip the base
/// and format, so the on-disk filename can never escape `cache_dir` via `..`
/// or an absolute path.
fn filename_for(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' | '+' | '(' | ')' | ',' => c,
            _ => '_',
        })
        .take(255)
        .collect()
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                if let Some(last) = components.last() {
                    if !matches!(last, std::path::Component::RootDir) {
                        components.pop();
                    }
                }
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

pub struct LocalFileMedium {
    cache_dir: PathBuf,
}

impl LocalFileMedium {
    /// Validates that `cache_dir` exists, is a directory, and is not a
    /// symlink pointing somewhere unexpected, failing startup with
    /// [`AppError::InsecureCacheDir`] otherwise. When `initialise` is set,
    /// the directory is wiped once validated, discarding anything left from
    /// a prior run.
    pub async fn new(cache_dir: PathBuf, initialise: bool) -> Result<Self, AppError> {
        fs::create_dir_all(&cache_dir).await?;
        let meta = fs::symlink_metadata(&cache_dir).await?;
        if meta.file_type().is_symlink() {
            return Err(AppError::InsecureCacheDir(format!(
                "cache dir must not be a symlink: {}",
                cache_dir.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&cache_dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
        let canonical = fs::canonicalize(&cache_dir).await?;
        let medium = LocalFileMedium {
            cache_dir: canonical,
        };
        if initialise {
            medium.wipe().await?;
        }
        Ok(medium)
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, AppError> {
        let path = self.cache_dir.join(filename_for(name));
        let normalized = normalize_path(&path);
        if !normalized.starts_with(&self.cache_dir) {
            return Err(AppError::InsecureCacheDir(format!(
                "derived path escapes cache directory: {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl TierMedium for LocalFileMedium {
    fn label(&self) -> &'static str {
        "local_file"
    }

    async fn store_bytes(&self, name: &str, handle: &Handle) -> Result<(), AppError> {
        let path = self.path_for(name)?;
        let bytes = handle.bytes().await?;
        fs::write(&path, &bytes).await?;
        debug!(name, path = %path.display(), size = bytes.len(), "wrote local file entry");
        Ok(())
    }

    async fn remove_bytes(&self, name: &str) -> Result<(), AppError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_bytes(&self, name: &str) -> Result<Option<Handle>, AppError> {
        let path = self.path_for(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => {
                let format = name.rsplit('.').next().unwrap_or("bin").to_string();
                Ok(Some(Handle::from_local_path(path, format, Some(meta.len()))))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn startup_scan(&self) -> Result<Vec<(String, Entry)>, AppError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        let mut seq = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            let format = name.rsplit('.').next().unwrap_or("bin").to_string();
            let handle = Handle::from_local_path(entry.path(), format, Some(meta.len()));
            seq += 1;
            out.push((name, new_entry(handle, meta.len(), false, false, seq)));
        }
        debug!(count = out.len(), "restored local file tier from disk");
        Ok(out)
    }

    async fn wipe(&self) -> Result<(), AppError> {
        warn!(cache_dir = %self.cache_dir.display(), "wiping local file cache directory");
        let mut entries = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                let _ = fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}
