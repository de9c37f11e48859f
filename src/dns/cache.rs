//! Time-limited set of bypassed addresses
//!
//! The cache never touches the firewall. Expiry is two-phase: [`BypassCache::expired`]
//! reports what is due, the caller removes those addresses from the firewall
//! set, and only then calls [`BypassCache::commit_eviction`] for the ones that
//! were actually removed.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_TTL: Duration = Duration::from_secs(48 * 3600);

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to access cache file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to decode cache file: {0}")]
    FormatError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub ip: Ipv4Addr,
    pub expires_at: DateTime<Utc>,
}

/// On-disk layout
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    saved_at: DateTime<Utc>,
    entries: Vec<CacheEntry>,
}

#[derive(Debug, Clone)]
pub struct BypassCache {
    entries: BTreeMap<Ipv4Addr, DateTime<Utc>>,
    ttl: TimeDelta,
}

impl Default for BypassCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl BypassCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::hours(48)),
        }
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.entries.contains_key(&ip)
    }

    pub fn expiry(&self, ip: Ipv4Addr) -> Option<DateTime<Utc>> {
        self.entries.get(&ip).copied()
    }

    /// Insert or refresh `ip`, expiring one TTL after `now`.
    /// Returns whether the address was already present.
    pub fn insert(&mut self, ip: Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.entries.insert(ip, now + self.ttl).is_some()
    }

    /// Addresses whose expiry is at or before `now`
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<Ipv4Addr> {
        self.entries
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(ip, _)| *ip)
            .collect()
    }

    /// Drop addresses that have been removed from the firewall set
    pub fn commit_eviction(&mut self, ips: &[Ipv4Addr]) {
        for ip in ips {
            self.entries.remove(ip);
        }
    }

    pub fn remove(&mut self, ip: Ipv4Addr) -> bool {
        self.entries.remove(&ip).is_some()
    }

    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.entries.keys().copied().collect()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries
            .iter()
            .map(|(ip, expires_at)| CacheEntry {
                ip: *ip,
                expires_at: *expires_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read the persisted cache, dropping entries already expired at `now`.
    /// A missing file yields an empty cache.
    pub fn load(path: &Path, ttl: Duration, now: DateTime<Utc>) -> Result<Self, CacheError> {
        let mut cache = Self::new(ttl);
        if !path.exists() {
            debug!("No bypass cache at {}", path.display());
            return Ok(cache);
        }

        let file: CacheFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let total = file.entries.len();
        cache.entries = file
            .entries
            .into_iter()
            .filter(|e| e.expires_at > now)
            .map(|e| (e.ip, e.expires_at))
            .collect();

        info!(
            "Loaded {} bypass address(es) from {} ({} expired)",
            cache.len(),
            path.display(),
            total - cache.len()
        );
        Ok(cache)
    }

    /// Read the persisted file as-is, without dropping expired entries
    pub fn read_entries(path: &Path) -> Result<Vec<CacheEntry>, CacheError> {
        let file: CacheFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(file.entries)
    }

    pub fn save(&self, path: &Path, now: DateTime<Utc>) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = CacheFile {
            saved_at: now,
            entries: self.entries(),
        };
        // Write then rename so a crash never leaves a torn file
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, path)?;
        info!("Saved {} bypass address(es) to {}", self.len(), path.display());
        Ok(())
    }
}
