//! Generic tier machinery: a single [`Tier`] struct parametrized over a
//! [`TierMedium`] capability, plus the [`CacheTier`] trait object used to wire
//! differently-typed tiers together into a chain.

pub mod local_file;
pub mod memory;
pub mod remote_cache;
pub mod remote_store;

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::ReentrantMutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::ObjectStoreClient;
use crate::error::AppError;
use crate::handle::Handle;

/// Shared startup-scan implementation for the two remote-backed mediums:
/// lists every object in `container`, then consults each one's `lifetime`
/// metadata key to restore any still-future `retain_until`.
pub(crate) async fn scan_remote_objects(
    client: &Arc<dyn ObjectStoreClient>,
    container: &str,
    must_retain: bool,
) -> Result<Vec<(String, Entry)>, AppError> {
    let objects = client.list(container).await.map_err(AppError::Other)?;
    let mut seq = 0u64;
    let mut out = Vec::with_capacity(objects.len());
    for obj in objects {
        let format = obj.name.rsplit('.').next().unwrap_or("bin").to_string();
        let handle = Handle::from_remote(
            client.clone(),
            container.to_string(),
            obj.name.clone(),
            format,
            Some(obj.size),
        );
        seq += 1;
        let mut entry = new_entry(handle, obj.size, must_retain, must_retain, seq);
        if let Ok(Some(stat)) = client.stat(container, &obj.name).await {
            if let Some(until) = stat
                .metadata
                .get("lifetime")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
            {
                if until > SystemTime::now() {
                    entry.retain_until = Some(until);
                }
            }
        }
        out.push((obj.name, entry));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TierStats {
    pub count: usize,
    pub size_used: u64,
    pub count_max: u64,
    pub size_max: u64,
}

#[derive(Clone)]
pub struct Entry {
    pub handle: Handle,
    pub size: u64,
    pub last_access: Instant,
    pub prefer_retain: bool,
    pub must_retain: bool,
    pub retain_until: Option<SystemTime>,
    seq: u64,
}

/// The storage-specific capability a [`Tier`] drives. Each tier variant
/// (memory, local file, remote cache, remote store) implements this once.
#[async_trait]
pub trait TierMedium: Send + Sync {
    fn label(&self) -> &'static str;
    async fn store_bytes(&self, name: &str, handle: &Handle) -> Result<(), AppError>;
    async fn remove_bytes(&self, name: &str) -> Result<(), AppError>;
    async fn read_bytes(&self, name: &str) -> Result<Option<Handle>, AppError>;

    /// Entries discovered on the medium at startup, outside of any `add`
    /// call (e.g. files already on disk).
    async fn startup_scan(&self) -> Result<Vec<(String, Entry)>, AppError> {
        Ok(Vec::new())
    }

    /// Invoked when `clean` cannot bring the tier within bounds by normal
    /// eviction. Local-file media wipe their directory after flushing
    /// persistence-required entries; other media simply fail.
    async fn wipe(&self) -> Result<(), AppError> {
        Err(AppError::InternalTierError(
            "clean could not bring tier within bounds".into(),
        ))
    }
}

pub fn new_entry(handle: Handle, size: u64, prefer_retain: bool, must_retain: bool, seq: u64) -> Entry {
    Entry {
        handle,
        size,
        last_access: Instant::now(),
        prefer_retain,
        must_retain,
        retain_until: None,
        seq,
    }
}

/// Type-erased view of a tier, used to wire a chain of tiers whose mediums
/// differ in concrete type (memory -> local file -> remote cache -> remote
/// store).
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn tier_name(&self) -> &'static str;
    fn base_cost(&self) -> u32;
    async fn contains(&self, name: &str) -> bool;
    async fn get(&self, name: &str) -> Option<Handle>;
    async fn add(
        &self,
        name: &str,
        handle: Handle,
        prefer_retain: bool,
        must_retain: bool,
    ) -> Result<Handle, AppError>;
    async fn delete(&self, name: &str) -> Result<(), AppError>;
    async fn cost(&self, name: &str) -> Option<u32>;
    async fn clean(&self) -> Result<(), AppError>;
    async fn stats(&self) -> TierStats;
    async fn flush_down(&self) -> Result<(), AppError>;

    /// Names currently held by this tier, used at startup to rebuild the
    /// base-image index from whatever the remote store already had.
    async fn snapshot_names(&self) -> Vec<String>;

    /// Extends (or sets) the eviction hold on an entry until `until`, used
    /// when a signed URL is handed out so the artifact cannot be evicted
    /// while the URL might still be in use.
    async fn hold_until(&self, name: &str, until: SystemTime);

    /// The current eviction hold on an entry, if any, read without mutating it.
    async fn retain_until(&self, name: &str) -> Option<SystemTime>;

    /// Stops any in-flight `clean` sweep at its next entry boundary.
    fn cancel_sweep(&self);
}

struct TierState {
    contents: HashMap<String, Entry>,
    size_used: u64,
    seq: u64,
}

/// An eager write-back queued for the background drain task rather than
/// awaited inline from `add`.
struct WritebackJob {
    name: String,
    handle: Handle,
    prefer_retain: bool,
    must_retain: bool,
}

impl TierState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// A single cache tier: bounded storage over one [`TierMedium`], with
/// deterministic hysteresis-based eviction and optional eager write-back to
/// the next tier down.
pub struct Tier<M: TierMedium> {
    name: &'static str,
    medium: M,
    state: ReentrantMutex<RefCell<TierState>>,
    size_max: u64,
    count_max: u64,
    hysteresis: f64,
    base_cost: u32,
    eager_writeback: bool,
    next_ephemeral: OnceLock<Arc<dyn CacheTier>>,
    next_retained: OnceLock<Arc<dyn CacheTier>>,
    writeback_tx: mpsc::UnboundedSender<WritebackJob>,
    cancel: CancellationToken,
}

pub struct TierConfig {
    pub name: &'static str,
    pub size_max: u64,
    pub count_max: u64,
    pub hysteresis: f64,
    pub base_cost: u32,
    pub eager_writeback: bool,
}

impl<M: TierMedium + 'static> Tier<M> {
    pub fn new(medium: M, cfg: TierConfig) -> Arc<Self> {
        let (writeback_tx, mut writeback_rx) = mpsc::unbounded_channel::<WritebackJob>();
        let tier = Arc::new(Tier {
            name: cfg.name,
            medium,
            state: ReentrantMutex::new(RefCell::new(TierState {
                contents: HashMap::new(),
                size_used: 0,
                seq: 0,
            })),
            size_max: cfg.size_max,
            count_max: cfg.count_max,
            hysteresis: cfg.hysteresis,
            base_cost: cfg.base_cost,
            eager_writeback: cfg.eager_writeback,
            next_ephemeral: OnceLock::new(),
            next_retained: OnceLock::new(),
            writeback_tx,
            cancel: CancellationToken::new(),
        });

        let worker_tier = tier.clone();
        tokio::spawn(async move {
            while let Some(job) = writeback_rx.recv().await {
                let Some(next) = worker_tier.pick_next(job.must_retain) else {
                    continue;
                };
                if let Err(e) = next
                    .add(&job.name, job.handle, job.prefer_retain, job.must_retain)
                    .await
                {
                    warn!(tier = worker_tier.name, name = %job.name, error = %e, "async write-back failed");
                }
            }
        });

        tier
    }

    /// Wires successor tiers. Must be called once, before the tier serves
    /// traffic; later calls are ignored.
    pub fn wire(
        self: &Arc<Self>,
        next_ephemeral: Option<Arc<dyn CacheTier>>,
        next_retained: Option<Arc<dyn CacheTier>>,
    ) {
        if let Some(t) = next_ephemeral {
            let _ = self.next_ephemeral.set(t);
        }
        if let Some(t) = next_retained {
            let _ = self.next_retained.set(t);
        }
    }

    /// Restores entries found on the medium at startup (e.g. files already on
    /// disk from a prior run).
    pub async fn restore_from_medium(&self) -> Result<(), AppError> {
        let found = self.medium.startup_scan().await?;
        if found.is_empty() {
            return Ok(());
        }
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        for (name, mut entry) in found {
            entry.seq = st.next_seq();
            st.size_used += entry.size;
            st.contents.insert(name, entry);
        }
        Ok(())
    }

    fn pick_next(&self, must_retain: bool) -> Option<Arc<dyn CacheTier>> {
        if must_retain {
            self.next_retained.get().cloned()
        } else {
            self.next_ephemeral.get().cloned()
        }
    }

    fn max_oversize(&self) -> u64 {
        if self.size_max == 0 {
            u64::MAX
        } else {
            (self.size_max as f64 * 0.1).ceil() as u64
        }
    }

    async fn write_back_now(&self, name: &str, entry: &Entry) -> Result<(), AppError> {
        if entry.handle.has_persistence().await {
            return Ok(());
        }
        let Some(next) = self.next_retained.get() else {
            return Err(AppError::NotPersistable(format!(
                "{name} has no persistence-capable successor tier"
            )));
        };
        next.add(name, entry.handle.clone(), entry.prefer_retain, true)
            .await?;
        Ok(())
    }

    fn over_bounds(&self, st: &TierState) -> bool {
        (self.count_max > 0 && st.contents.len() as u64 > self.count_max)
            || (self.size_max > 0 && st.size_used > self.size_max)
    }

    /// A handle future callers can cancel to stop an in-flight `clean` sweep
    /// between entries, e.g. during shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }
}

#[async_trait]
impl<M: TierMedium + 'static> CacheTier for Tier<M> {
    fn tier_name(&self) -> &'static str {
        self.name
    }

    fn base_cost(&self) -> u32 {
        self.base_cost
    }

    async fn contains(&self, name: &str) -> bool {
        let guard = self.state.lock();
        guard.borrow().contents.contains_key(name)
    }

    async fn get(&self, name: &str) -> Option<Handle> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let entry = st.contents.get_mut(name)?;
        entry.last_access = Instant::now();
        Some(entry.handle.clone())
    }

    async fn add(
        &self,
        name: &str,
        handle: Handle,
        prefer_retain: bool,
        must_retain: bool,
    ) -> Result<Handle, AppError> {
        if let Some(existing) = self.get(name).await {
            return Ok(existing);
        }
        let size = handle.size_hint().await;
        if size > self.max_oversize() {
            return Err(AppError::OversizeRejected);
        }
        {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            let seq = st.next_seq();
            let entry = new_entry(handle.clone(), size, prefer_retain, must_retain, seq);
            st.size_used += entry.size;
            st.contents.insert(name.to_string(), entry);
        }
        self.medium.store_bytes(name, &handle).await?;
        if self.eager_writeback && self.next_ephemeral.get().or(self.next_retained.get()).is_some() {
            let job = WritebackJob {
                name: name.to_string(),
                handle: handle.clone(),
                prefer_retain,
                must_retain,
            };
            // Unbounded channel with a permanently-live receiver task; the
            // only way this fails is if that task panicked.
            let _ = self.writeback_tx.send(job);
        }
        let needs_clean = {
            let guard = self.state.lock();
            self.over_bounds(&guard.borrow())
        };
        if needs_clean {
            self.clean().await?;
        }
        Ok(handle)
    }

    async fn delete(&self, name: &str) -> Result<(), AppError> {
        let entry = {
            let guard = self.state.lock();
            guard.borrow().contents.get(name).cloned()
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        if entry.must_retain && !entry.handle.has_persistence().await {
            self.write_back_now(name, &entry).await?;
        }
        {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            if let Some(removed) = st.contents.remove(name) {
                st.size_used = st.size_used.saturating_sub(removed.size);
            }
        }
        self.medium.remove_bytes(name).await?;
        Ok(())
    }

    async fn cost(&self, name: &str) -> Option<u32> {
        if self.contains(name).await {
            Some(self.base_cost)
        } else {
            None
        }
    }

    async fn clean(&self) -> Result<(), AppError> {
        if self.count_max == 0 && self.size_max == 0 {
            return Ok(());
        }
        let snapshot: Vec<(String, Entry)> = {
            let guard = self.state.lock();
            let st = guard.borrow();
            st.contents
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        let mut kill = Vec::new();
        let mut unsafe_entries = Vec::new();
        let mut retain = Vec::new();
        let now = SystemTime::now();
        for (name, entry) in snapshot {
            if entry.retain_until.is_some_and(|t| t > now) {
                // held by an outstanding signed URL; not eligible this pass.
                continue;
            }
            if entry.must_retain && !entry.handle.has_persistence().await {
                unsafe_entries.push((name, entry));
            } else if entry.prefer_retain || entry.must_retain {
                retain.push((name, entry));
            } else {
                kill.push((name, entry));
            }
        }
        let by_access = |a: &(String, Entry), b: &(String, Entry)| {
            a.1.last_access
                .cmp(&b.1.last_access)
                .then(a.1.seq.cmp(&b.1.seq))
        };
        kill.sort_by(by_access);
        unsafe_entries.sort_by(by_access);
        retain.sort_by(by_access);

        let target_count = if self.count_max > 0 {
            (self.hysteresis * self.count_max as f64).ceil() as i64
        } else {
            0
        };
        let target_size = if self.size_max > 0 {
            (self.hysteresis * self.size_max as f64).ceil() as i64
        } else {
            0
        };
        let mut freed_count = 0i64;
        let mut freed_size = 0i64;

        let targets_met = |freed_count: i64, freed_size: i64| {
            freed_count >= target_count && freed_size >= target_size
        };

        for (name, entry) in kill {
            if self.cancel.is_cancelled() || targets_met(freed_count, freed_size) {
                break;
            }
            self.evict_direct(&name, &entry).await;
            freed_count += 1;
            freed_size += entry.size as i64;
        }
        for (name, entry) in unsafe_entries {
            if self.cancel.is_cancelled() || targets_met(freed_count, freed_size) {
                break;
            }
            if self.write_back_now(&name, &entry).await.is_err() {
                warn!(tier = self.name, name = %name, "could not write back unsafe entry during clean");
                continue;
            }
            self.evict_direct(&name, &entry).await;
            freed_count += 1;
            freed_size += entry.size as i64;
        }
        for (name, entry) in retain {
            if self.cancel.is_cancelled() || targets_met(freed_count, freed_size) {
                break;
            }
            self.evict_direct(&name, &entry).await;
            freed_count += 1;
            freed_size += entry.size as i64;
        }

        let still_over = {
            let guard = self.state.lock();
            self.over_bounds(&guard.borrow())
        };
        if still_over {
            warn!(tier = self.name, "clean could not reach hysteresis target, wiping");
            self.medium.wipe().await?;
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            st.contents.clear();
            st.size_used = 0;
        }
        Ok(())
    }

    async fn stats(&self) -> TierStats {
        let guard = self.state.lock();
        let st = guard.borrow();
        TierStats {
            count: st.contents.len(),
            size_used: st.size_used,
            count_max: self.count_max,
            size_max: self.size_max,
        }
    }

    async fn flush_down(&self) -> Result<(), AppError> {
        let snapshot: Vec<(String, Entry)> = {
            let guard = self.state.lock();
            let st = guard.borrow();
            st.contents
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (name, entry) in snapshot {
            if let Some(next) = self.pick_next(entry.must_retain) {
                if let Err(e) = next
                    .add(&name, entry.handle.clone(), entry.prefer_retain, entry.must_retain)
                    .await
                {
                    warn!(tier = self.name, name = %name, error = %e, "flush-down failed");
                }
            }
        }
        debug!(tier = self.name, "flushed down");
        Ok(())
    }

    async fn snapshot_names(&self) -> Vec<String> {
        let guard = self.state.lock();
        guard.borrow().contents.keys().cloned().collect()
    }

    async fn hold_until(&self, name: &str, until: SystemTime) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if let Some(entry) = st.contents.get_mut(name) {
            entry.retain_until = match entry.retain_until {
                Some(existing) if existing > until => Some(existing),
                _ => Some(until),
            };
        }
    }

    async fn retain_until(&self, name: &str) -> Option<SystemTime> {
        let guard = self.state.lock();
        guard.borrow().contents.get(name).and_then(|e| e.retain_until)
    }

    fn cancel_sweep(&self) {
        self.cancel.cancel();
    }
}

impl<M: TierMedium> Tier<M> {
    async fn evict_direct(&self, name: &str, _entry: &Entry) {
        {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            if let Some(removed) = st.contents.remove(name) {
                st.size_used = st.size_used.saturating_sub(removed.size);
            }
        }
        if let Err(e) = self.medium.remove_bytes(name).await {
            warn!(tier = self.name, name, error = %e, "failed to remove bytes during eviction");
        }
    }
}
