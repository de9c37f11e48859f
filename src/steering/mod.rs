//! Traffic steering control plane
//!
//! Links are fixed for the process lifetime. Each one gets a dedicated
//! routing table and packet mark, a health monitor, and membership in the
//! chain for its role. Status transitions flow to a per-chain worker that
//! recompiles the chain's weighted split.
//!
//! - `firewall`: nft table, bypass sets, chain program application
//! - `routes`: per-link policy routing with exact rollback
//! - `health`: per-link reachability probing with hysteresis
//! - `rules`: weighted split compilation
//! - `chain`: per-chain serializer task
//! - `engine`: start-up and shutdown orchestration

pub mod chain;
pub mod engine;
pub mod firewall;
pub mod health;
pub mod routes;
pub mod rules;

pub use chain::{ChainEvent, ChainHandle, ChainMember, ChainWorker};
pub use engine::{EngineError, SteeringEngine};
pub use firewall::Firewall;
pub use health::{Hysteresis, LinkMonitor, MonitorSettings, PingProber, Prober};
pub use routes::{PolicyRouter, RouteArtifact, RouteLedger, RoutingError};
pub use rules::{Bucket, ChainPlan, WeightedMark};

use crate::config::{EmptyPolicy, LinksConfig};
use std::fmt;

/// First value of the mark/table counter; the first link gets `FIRST_SLOT + 1`
pub const FIRST_SLOT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    Vpn,
    Wan,
}

impl LinkRole {
    /// Name of the nft chain that dispatches this role's traffic
    pub fn chain_name(self) -> &'static str {
        match self {
            LinkRole::Vpn => "vpn",
            LinkRole::Wan => "wan",
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.chain_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    /// Optimistic initial state, so traffic isn't blackholed before the first probe
    #[default]
    Available,
    Unavailable,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Available => write!(f, "available"),
            LinkStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Stable index of a link in the [`LinkRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub id: LinkId,
    /// Interface name
    pub name: String,
    pub role: LinkRole,
    /// Configured weight; see [`Link::weight`] for the effective value
    pub configured_weight: i64,
    pub mark: u32,
    pub table: u32,
}

impl Link {
    /// Effective weight: configured values below 1 count as 1
    pub fn weight(&self) -> u32 {
        self.configured_weight.clamp(1, u32::MAX as i64) as u32
    }

    /// Mark as written in `ip rule` and nft rules
    pub fn mark_hex(&self) -> String {
        format_mark(self.mark)
    }
}

pub fn format_mark(mark: u32) -> String {
    format!("{:#x}", mark)
}

/// Owned arena of links, built once at start
#[derive(Debug, Clone, Default)]
pub struct LinkRegistry {
    links: Vec<Link>,
}

impl LinkRegistry {
    /// Assign marks and tables in declaration order: VPN links first, then WAN
    pub fn from_config(config: &LinksConfig) -> Self {
        let declared = config
            .vpn
            .iter()
            .map(|l| (l, LinkRole::Vpn))
            .chain(config.wan.iter().map(|l| (l, LinkRole::Wan)));

        let links = declared
            .enumerate()
            .map(|(idx, (link, role))| {
                let slot = FIRST_SLOT + idx as u32 + 1;
                Link {
                    id: LinkId(idx),
                    name: link.name.clone(),
                    role,
                    configured_weight: link.weight,
                    mark: slot,
                    table: slot,
                }
            })
            .collect();

        Self { links }
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    /// Links of one role, in declaration order
    pub fn by_role(&self, role: LinkRole) -> impl Iterator<Item = &Link> {
        self.links.iter().filter(move |l| l.role == role)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// One kernel dispatch point and the policy applied when it has no links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficChain {
    pub role: LinkRole,
    pub when_empty: EmptyPolicy,
}

impl TrafficChain {
    pub fn for_role(role: LinkRole, config: &LinksConfig) -> Self {
        let when_empty = match role {
            LinkRole::Vpn => config.vpn_when_empty,
            LinkRole::Wan => config.wan_when_empty,
        };
        Self { role, when_empty }
    }

    pub fn name(&self) -> &'static str {
        self.role.chain_name()
    }
}
