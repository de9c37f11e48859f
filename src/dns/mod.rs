//! DNS bypass relay
//!
//! - `wire`: the small slice of the DNS wire format the relay needs
//! - `matcher`: which names are bypass-listed
//! - `cache`: address expiry bookkeeping and persistence
//! - `tracker`: cache and firewall set kept in lock-step
//! - `proxy`: UDP listener and ordered upstream failover

pub mod cache;
pub mod matcher;
pub mod proxy;
pub mod tracker;
pub mod wire;

pub use cache::{BypassCache, CacheEntry, CacheError, SWEEP_INTERVAL};
pub use matcher::{BypassMatcher, MatcherError};
pub use proxy::{DnsProxy, ProxyError, Relay};
pub use tracker::{BypassTracker, TrackerError};
pub use wire::WireError;
