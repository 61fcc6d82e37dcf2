//! Keyed pool of live backends shared across concurrent callers.
//!
//! The usage counter is bookkeeping for eviction, not a lock: several leases
//! may hold the same backend at once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backends::{Backend, ConnectionStatus, FileBackend};
use crate::config::{merge_layers, BackendConfig, ConfigLayer};
use crate::error::Result;

/// Builds a backend from a fully merged configuration layer.
pub type BackendFactory = Arc<dyn Fn(ConfigLayer) -> BoxFuture<'static, Result<Backend>> + Send + Sync>;

/// Factory that deserializes the layer as a [`BackendConfig`].
pub fn config_factory() -> BackendFactory {
    Arc::new(|layer| {
        async move {
            let config = BackendConfig::from_layer(layer)?;
            Backend::from_config(&config).await
        }
        .boxed()
    })
}

#[derive(Clone)]
pub struct PoolOptions {
    pub default_config: ConfigLayer,
    pub idle_timeout: Duration,
    /// Period of the background eviction task; `None` disables it.
    pub cleanup_interval: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            default_config: ConfigLayer::new(),
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    /// Entries with at least one outstanding lease.
    pub active: usize,
    pub idle: usize,
    pub keys: Vec<String>,
}

struct PooledEntry {
    backend: Backend,
    in_use: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl PooledEntry {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            in_use: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn checkout(&self) {
        self.in_use.fetch_add(1, Ordering::SeqCst);
        *self.last_used.lock() = Instant::now();
    }

    /// The idle clock restarts at release too, so long leases are not evicted on return.
    fn checkin(&self) {
        let _ = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        *self.last_used.lock() = Instant::now();
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// A borrowed backend. Released on drop or by [`PoolLease::release`].
pub struct PoolLease {
    backend: Backend,
    entry: Option<Arc<PooledEntry>>,
}

impl PoolLease {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Returns the lease. Repeated calls are no-ops; unpooled leases never
    /// touch the pool.
    pub fn release(&mut self) {
        if let Some(entry) = self.entry.take() {
            entry.checkin();
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::ops::Deref for PoolLease {
    type Target = Backend;

    fn deref(&self) -> &Backend {
        &self.backend
    }
}

pub struct BackendPoolManager {
    options: PoolOptions,
    factory: BackendFactory,
    entries: Mutex<HashMap<String, Arc<PooledEntry>>>,
    /// Serializes construction so concurrent acquires of one key share it.
    building: AsyncMutex<()>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl BackendPoolManager {
    /// Creates the pool. When `cleanup_interval` is set this spawns the
    /// eviction task, so it must run inside a tokio runtime.
    pub fn new(options: PoolOptions, factory: BackendFactory) -> Arc<Self> {
        let pool = Arc::new(Self {
            options,
            factory,
            entries: Mutex::new(HashMap::new()),
            building: AsyncMutex::new(()),
            cleanup: Mutex::new(None),
        });
        if let Some(interval) = pool.options.cleanup_interval {
            let handle = tokio::spawn(cleanup_loop(Arc::downgrade(&pool), interval));
            *pool.cleanup.lock() = Some(handle);
        }
        pool
    }

    pub fn with_config_factory(options: PoolOptions) -> Arc<Self> {
        Self::new(options, config_factory())
    }

    async fn build(&self, overrides: Option<&ConfigLayer>) -> Result<Backend> {
        let layer = match overrides {
            Some(overlay) => merge_layers(&self.options.default_config, overlay),
            None => self.options.default_config.clone(),
        };
        (self.factory)(layer).await
    }

    /// Checks out the pooled entry for `key` if it is still connected. The
    /// map lock is held across the checkout so eviction cannot take the
    /// entry in between.
    fn checkout_live(&self, key: &str) -> Option<Arc<PooledEntry>> {
        let entries = self.entries.lock();
        let entry = entries
            .get(key)
            .filter(|e| e.backend.status() == ConnectionStatus::Connected)?;
        entry.checkout();
        Some(Arc::clone(entry))
    }

    /// Borrows a backend. Without a key a fresh, unpooled instance is built
    /// every time. With a key the pooled instance is reused while it is
    /// connected; otherwise a replacement is built and stored.
    pub async fn acquire(&self, key: Option<&str>, overrides: Option<&ConfigLayer>) -> Result<PoolLease> {
        let Some(key) = key else {
            let backend = self.build(overrides).await?;
            return Ok(PoolLease { backend, entry: None });
        };

        let entry = match self.checkout_live(key) {
            Some(entry) => entry,
            None => {
                let _building = self.building.lock().await;
                match self.checkout_live(key) {
                    Some(entry) => entry,
                    None => {
                        let backend = self.build(overrides).await?;
                        debug!("pool: new {} backend for key {key}", backend.backend_type());
                        let entry = Arc::new(PooledEntry::new(backend));
                        entry.checkout();
                        self.entries.lock().insert(key.to_string(), Arc::clone(&entry));
                        entry
                    }
                }
            }
        };

        Ok(PoolLease {
            backend: entry.backend.clone(),
            entry: Some(entry),
        })
    }

    /// Runs `f` with a borrowed backend and releases it whatever the outcome.
    pub async fn with_backend<F, Fut, T>(
        &self,
        key: Option<&str>,
        overrides: Option<&ConfigLayer>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Backend) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut lease = self.acquire(key, overrides).await?;
        let result = f(lease.backend().clone()).await;
        lease.release();
        result
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.lock();
        let active = entries.values().filter(|e| e.in_use() > 0).count();
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        PoolStats {
            total: entries.len(),
            active,
            idle: entries.len() - active,
            keys,
        }
    }

    /// Destroys entries unused for longer than the idle timeout. Returns how
    /// many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let timeout = self.options.idle_timeout;
        let evicted: Vec<(String, Arc<PooledEntry>)> = {
            let mut entries = self.entries.lock();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.in_use() == 0 && e.last_used.lock().elapsed() >= timeout)
                .map(|(k, _)| k.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        for (key, entry) in &evicted {
            info!("pool: evicting idle backend {key}");
            if let Err(e) = entry.backend.destroy().await {
                error!("Failed to destroy evicted backend {key}: {e}");
            }
        }
        evicted.len()
    }

    /// Stops eviction and destroys every pooled backend. One failing
    /// backend does not prevent the others from being destroyed.
    pub async fn destroy_all(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
        }
        let drained: Vec<(String, Arc<PooledEntry>)> = self.entries.lock().drain().collect();
        let outcomes = join_all(drained.iter().map(|(_, e)| e.backend.destroy())).await;
        for ((key, _), outcome) in drained.iter().zip(outcomes) {
            if let Err(e) = outcome {
                error!("Failed to destroy pooled backend {key}: {e}");
            }
        }
        info!("pool: destroyed {} backends", drained.len());
    }
}

impl Drop for BackendPoolManager {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.get_mut().take() {
            handle.abort();
        }
    }
}

async fn cleanup_loop(pool: Weak<BackendPoolManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        let evicted = pool.evict_idle().await;
        if evicted > 0 {
            debug!("pool: cleanup evicted {evicted} backends");
        }
    }
}
