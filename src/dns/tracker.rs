//! Keeps the bypass cache and the firewall's domain set in lock-step
//!
//! Every mutation takes the cache lock, issues the firewall command, and
//! only then updates the cache, so an address is cached exactly when the
//! firewall set holds it. Where the two could disagree after a failure the
//! address is dropped from the cache rather than left cached but unset.

use super::cache::{BypassCache, CacheEntry, CacheError};
use crate::platform::PlatformError;
use crate::steering::Firewall;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Failed to update bypass set: {0}")]
    Firewall(#[from] PlatformError),
}

pub struct BypassTracker {
    cache: Mutex<BypassCache>,
    firewall: Arc<Firewall>,
    path: PathBuf,
    ttl: Duration,
}

impl BypassTracker {
    pub fn new(firewall: Arc<Firewall>, path: PathBuf, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(BypassCache::new(ttl)),
            firewall,
            path,
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the persisted cache and re-apply it to an emptied domain set.
    /// Returns the number of addresses restored.
    pub async fn restore(&self) -> Result<usize, TrackerError> {
        self.restore_at(Utc::now()).await
    }

    pub async fn restore_at(&self, now: DateTime<Utc>) -> Result<usize, TrackerError> {
        let mut cache = self.cache.lock().await;

        let mut loaded = match BypassCache::load(&self.path, self.ttl, now) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Ignoring unreadable bypass cache {}: {}", self.path.display(), e);
                BypassCache::new(self.ttl)
            }
        };

        self.firewall.flush_bypass_ips().await?;

        let addresses = loaded.addresses();
        let rejected = self.add_all(&addresses).await;
        loaded.commit_eviction(&rejected);
        *cache = loaded;

        if !cache.is_empty() {
            info!("Restored {} bypass address(es)", cache.len());
        }
        Ok(cache.len())
    }

    /// Record addresses seen in a bypass-domain answer. New addresses are
    /// added to the firewall set; known ones only have their expiry extended.
    /// Returns the number of newly added addresses.
    pub async fn observe(&self, ips: &[Ipv4Addr]) -> usize {
        self.observe_at(ips, Utc::now()).await
    }

    pub async fn observe_at(&self, ips: &[Ipv4Addr], now: DateTime<Utc>) -> usize {
        let mut cache = self.cache.lock().await;

        let mut fresh: Vec<Ipv4Addr> = Vec::new();
        for ip in ips {
            if cache.contains(*ip) {
                cache.insert(*ip, now);
            } else if !fresh.contains(ip) {
                fresh.push(*ip);
            }
        }
        if fresh.is_empty() {
            return 0;
        }

        let rejected = self.add_all(&fresh).await;
        let mut added = 0;
        for ip in fresh.into_iter().filter(|ip| !rejected.contains(ip)) {
            info!("Bypassing {}", ip);
            cache.insert(ip, now);
            added += 1;
        }
        added
    }

    /// Remove expired addresses from the firewall set, then from the cache.
    /// Addresses whose removal fails stay cached and are retried next sweep.
    /// Returns the number of evicted addresses.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut cache = self.cache.lock().await;

        let due = cache.expired(now);
        if due.is_empty() {
            return 0;
        }

        let removed = match self.firewall.remove_bypass_ips(&due).await {
            Ok(()) => due,
            Err(e) => {
                warn!("Batch removal of {} expired address(es) failed: {}", due.len(), e);
                let mut removed = Vec::new();
                for ip in due {
                    match self.firewall.remove_bypass_ips(&[ip]).await {
                        Ok(()) => removed.push(ip),
                        Err(e) => warn!("Failed to remove {} from bypass set, retrying next sweep: {}", ip, e),
                    }
                }
                removed
            }
        };

        cache.commit_eviction(&removed);
        if !removed.is_empty() {
            info!("Expired {} bypass address(es)", removed.len());
        }
        removed.len()
    }

    /// Sweep every `interval` until cancelled
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tracker.sweep().await;
                    }
                }
            }
            debug!("Bypass sweeper stopped");
        })
    }

    /// Write the cache to disk
    pub async fn persist(&self) -> Result<(), TrackerError> {
        let cache = self.cache.lock().await;
        cache.save(&self.path, Utc::now())?;
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<CacheEntry> {
        self.cache.lock().await.entries()
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }

    /// Add addresses in one batch, falling back to one at a time.
    /// Returns the addresses that could not be added.
    async fn add_all(&self, ips: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
        if ips.is_empty() {
            return Vec::new();
        }
        let Err(e) = self.firewall.add_bypass_ips(ips).await else {
            return Vec::new();
        };

        warn!("Batch add of {} address(es) failed: {}", ips.len(), e);
        let mut rejected = Vec::new();
        for ip in ips {
            if let Err(e) = self.firewall.add_bypass_ips(&[*ip]).await {
                warn!("Failed to add {} to bypass set: {}", ip, e);
                rejected.push(*ip);
            }
        }
        rejected
    }
}
