//! [`Master`]: the top-level entry point wiring together the four cache
//! tiers, the base-image index, the derivation engine, and the singleflight
//! coalescing layer that gives every cached name a unique [`Handle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{ImageBackend, ObjectStoreClient};
use crate::config::Config;
use crate::derive::DerivationEngine;
use crate::error::AppError;
use crate::handle::Handle;
use crate::name::Name;
use crate::tier::local_file::LocalFileMedium;
use crate::tier::memory::MemoryMedium;
use crate::tier::remote_cache::RemoteCacheMedium;
use crate::tier::remote_store::RemoteStoreMedium;
use crate::tier::{CacheTier, Tier, TierConfig, TierStats};

#[derive(Debug, Clone, Copy)]
pub struct MasterStats {
    pub memory: TierStats,
    pub local_file: TierStats,
    pub remote_cache: TierStats,
    pub remote_store: TierStats,
    pub error_count: u64,
}

pub struct Master {
    memory: Arc<Tier<MemoryMedium>>,
    local_file: Arc<Tier<LocalFileMedium>>,
    remote_cache: Arc<Tier<RemoteCacheMedium>>,
    remote_store: Arc<Tier<RemoteStoreMedium>>,
    base_images: Arc<DashMap<String, Handle>>,
    inflight: DashMap<String, Arc<OnceCell<Result<Handle, String>>>>,
    engine: DerivationEngine,
    backend: Arc<dyn ImageBackend>,
    error_threshold: u64,
    shutting_down: AtomicBool,
    url_lifetime: Duration,
    url_lifetime_slack: Duration,
    url_key: String,
}

impl Master {
    pub async fn new(
        config: &Config,
        backend: Arc<dyn ImageBackend>,
        store: Arc<dyn ObjectStoreClient>,
    ) -> Result<Arc<Master>, AppError> {
        let memory: Arc<Tier<MemoryMedium>> = Tier::new(
            MemoryMedium,
            TierConfig {
                name: "memory",
                size_max: config.memory_size_max,
                count_max: config.memory_count_max,
                hysteresis: config.hysteresis,
                base_cost: 1,
                eager_writeback: false,
            },
        );
        let local_file: Arc<Tier<LocalFileMedium>> = Tier::new(
            LocalFileMedium::new(config.cache_dir.clone(), config.local_initialise).await?,
            TierConfig {
                name: "local_file",
                size_max: config.local_size_max,
                count_max: config.local_count_max,
                hysteresis: config.hysteresis,
                base_cost: 10,
                eager_writeback: false,
            },
        );
        let remote_cache: Arc<Tier<RemoteCacheMedium>> = Tier::new(
            RemoteCacheMedium::new(store.clone(), config.remote_cache_container.clone()),
            TierConfig {
                name: "remote_cache",
                size_max: config.remote_cache_size_max,
                count_max: config.remote_cache_count_max,
                hysteresis: config.hysteresis,
                base_cost: 100,
                eager_writeback: config.eager_writeback,
            },
        );
        let remote_store: Arc<Tier<RemoteStoreMedium>> = Tier::new(
            RemoteStoreMedium::new(store.clone(), config.remote_store_container.clone()),
            TierConfig {
                name: "remote_store",
                size_max: 0,
                count_max: 0,
                hysteresis: config.hysteresis,
                base_cost: 1000,
                eager_writeback: false,
            },
        );

        memory.wire(
            Some(local_file.clone() as Arc<dyn CacheTier>),
            Some(local_file.clone() as Arc<dyn CacheTier>),
        );
        local_file.wire(
            Some(remote_cache.clone() as Arc<dyn CacheTier>),
            Some(remote_store.clone() as Arc<dyn CacheTier>),
        );
        remote_cache.wire(
            Some(remote_store.clone() as Arc<dyn CacheTier>),
            Some(remote_store.clone() as Arc<dyn CacheTier>),
        );
        local_file.restore_from_medium().await?;
        if !config.initialise_store {
            remote_cache.restore_from_medium().await?;
            remote_store.restore_from_medium().await?;
        }

        let base_images: Arc<DashMap<String, Handle>> = Arc::new(DashMap::new());
        for name_str in remote_store.snapshot_names().await {
            if let Ok(name) = Name::parse(&name_str, None) {
                if name.is_base() || name.is_original() {
                    if let Some(handle) = remote_store.get(&name_str).await {
                        base_images.insert(name.base_name().to_string(), handle);
                    }
                }
            }
        }
        let engine = DerivationEngine::new(base_images.clone(), backend.clone(), config.liquid_cutin_ratio);

        let master = Arc::new(Master {
            memory,
            local_file,
            remote_cache,
            remote_store,
            base_images,
            inflight: DashMap::new(),
            engine,
            backend,
            error_threshold: config.error_threshold,
            shutting_down: AtomicBool::new(false),
            url_lifetime: Duration::from_secs(config.url_lifetime_secs),
            url_lifetime_slack: Duration::from_secs(config.url_lifetime_slack_secs),
            url_key: config.url_key.clone(),
        });
        info!(originals = master.base_images.len(), "master cache initialized");
        Ok(master)
    }

    fn tiers_outermost_first(&self) -> [Arc<dyn CacheTier>; 4] {
        [
            self.memory.clone() as Arc<dyn CacheTier>,
            self.local_file.clone() as Arc<dyn CacheTier>,
            self.remote_cache.clone() as Arc<dyn CacheTier>,
            self.remote_store.clone() as Arc<dyn CacheTier>,
        ]
    }

    pub fn base_name_hash(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Ingests a freshly-uploaded original image, returning its canonical
    /// name.
    pub async fn add_original(
        &self,
        bytes: Vec<u8>,
        raw_filename: &str,
        format: &str,
    ) -> Result<Name, AppError> {
        let base = Self::base_name_hash(&bytes);
        let mut name = Name::base(base.clone(), format);
        name.apply_original(raw_filename);

        let handle = Handle::from_bytes(bytes, format);
        self.base_images.insert(base, handle.clone());
        self.add(&name.render(), handle, false, true).await?;
        debug!(name = %name, "added original image");
        Ok(name)
    }

    /// Adds a handle to the cache, cascading memory -> local_file ->
    /// remote_cache and stopping at the first tier willing to take it.
    /// `AppError::CapacityExceeded` if every tier declines for size reasons.
    pub async fn add(
        &self,
        name_str: &str,
        handle: Handle,
        prefer_retain: bool,
        must_retain: bool,
    ) -> Result<Handle, AppError> {
        let chain: [Arc<dyn CacheTier>; 3] = [
            self.memory.clone() as Arc<dyn CacheTier>,
            self.local_file.clone() as Arc<dyn CacheTier>,
            self.remote_cache.clone() as Arc<dyn CacheTier>,
        ];
        for tier in &chain {
            match tier.add(name_str, handle.clone(), prefer_retain, must_retain).await {
                Ok(h) => return Ok(h),
                Err(AppError::OversizeRejected) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AppError::CapacityExceeded)
    }

    /// Resolves a canonical name to a handle, checking tiers outermost first
    /// and falling back to the derivation engine, single-flighted so
    /// concurrent requests for the same missing name derive it exactly once.
    pub async fn get(&self, name_str: &str) -> Result<Handle, AppError> {
        let name = Name::parse(name_str, None)?;
        let canonical = name.render();

        let tiers = self.tiers_outermost_first();
        for (depth, tier) in tiers.iter().enumerate() {
            if let Some(handle) = tier.get(&canonical).await {
                for above in &tiers[..depth] {
                    if let Err(e) = above.add(&canonical, handle.clone(), false, false).await {
                        debug!(name = %canonical, tier = above.tier_name(), error = %e, "promotion failed");
                    }
                }
                return Ok(handle);
            }
        }

        let cell = self
            .inflight
            .entry(canonical.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();
        let result = cell
            .get_or_init(|| async {
                let resolved = self.engine.resolve(&name).await;
                match resolved {
                    Ok(handle) => {
                        let prefer_retain = name.is_thumbnail();
                        if let Err(e) = self.add(&canonical, handle.clone(), prefer_retain, false).await {
                            debug!(name = %canonical, error = %e, "failed to populate cache after derivation");
                        }
                        Ok(handle)
                    }
                    Err(e) => Err(e.to_string()),
                }
            })
            .await
            .clone();
        self.inflight.remove(&canonical);
        result.map_err(|e| AppError::Other(anyhow::anyhow!(e)))
    }

    /// Removes an original (and, transitively, every derivative no longer
    /// resolvable once its base image is gone) from the cache. `name_str` is
    /// the original's own canonical name.
    pub async fn delete(&self, name_str: &str) -> Result<(), AppError> {
        let name = Name::parse(name_str, None)?;
        self.base_images.remove(name.base_name());
        for tier in self.tiers_outermost_first() {
            tier.delete(&name.render()).await?;
        }
        Ok(())
    }

    /// Ensures a name's bytes exist in the remote store and marks the entry
    /// `must_retain` in every tier that currently holds it.
    pub async fn make_persistent(&self, name_str: &str) -> Result<(), AppError> {
        let name = Name::parse(name_str, None)?;
        let canonical = name.render();
        let handle = self.get(&canonical).await?;
        if !handle.has_persistence().await {
            self.remote_store
                .add(&canonical, handle.clone(), true, true)
                .await?;
        }
        Ok(())
    }

    /// Hands out a signed URL for `name_str`, extending its eviction hold by
    /// at least `url_lifetime + url_lifetime_slack` beyond now (or leaving a
    /// longer existing hold untouched), and publishing the new expiry as
    /// `lifetime` metadata on the remote object so a restart can restore it.
    pub async fn signed_url(&self, name_str: &str) -> Result<String, AppError> {
        let name = Name::parse(name_str, None)?;
        let canonical = name.render();
        self.make_persistent(&canonical).await?;
        let handle = self.get(&canonical).await?;

        let now = SystemTime::now();
        let mut current: Option<SystemTime> = None;
        for tier in self.tiers_outermost_first() {
            if let Some(existing) = tier.retain_until(&canonical).await {
                current = Some(current.map_or(existing, |c| c.max(existing)));
            }
        }
        let computed = now + self.url_lifetime + self.url_lifetime_slack;
        let target = match current {
            Some(c) if c > computed => c,
            _ => computed,
        };

        let secs = target
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| AppError::Other(anyhow::anyhow!(e)))?
            .as_secs();
        let mut metadata = std::collections::HashMap::new();
        metadata.insert(self.url_key.clone(), secs.to_string());
        self.remote_store
            .medium()
            .client()
            .post_metadata(self.remote_store.medium().container(), &canonical, metadata)
            .await
            .map_err(AppError::Other)?;

        for tier in self.tiers_outermost_first() {
            tier.hold_until(&canonical, target).await;
        }
        handle.sign_url(self.url_lifetime).await
    }

    pub async fn stats(&self) -> MasterStats {
        MasterStats {
            memory: self.memory.stats().await,
            local_file: self.local_file.stats().await,
            remote_cache: self.remote_cache.stats().await,
            remote_store: self.remote_store.stats().await,
            error_count: crate::error::ERROR_COUNT.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    pub async fn gc(&self) -> Result<(), AppError> {
        for tier in self.tiers_outermost_first() {
            tier.clean().await?;
        }
        Ok(())
    }

    /// Flushes memory and local-file tiers down to their successors. Called
    /// during graceful shutdown.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        for tier in self.tiers_outermost_first() {
            tier.cancel_sweep();
        }
        self.memory.flush_down().await?;
        self.local_file.flush_down().await?;
        Ok(())
    }

    pub fn backend(&self) -> Arc<dyn ImageBackend> {
        self.backend.clone()
    }

    pub fn known_bases(&self) -> Vec<String> {
        self.base_images.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Records a server-error response. Once the process-wide recoverable
    /// error count exceeds this master's configured threshold, flips
    /// `shutting_down` so new requests are refused while existing work
    /// drains.
    pub fn note_error(&self) {
        let count = crate::error::ERROR_COUNT.load(Ordering::Relaxed);
        if count > self.error_threshold
            && !self.shutting_down.swap(true, Ordering::Relaxed)
        {
            warn!(count, threshold = self.error_threshold, "error threshold exceeded, refusing new requests");
        }
    }
}
