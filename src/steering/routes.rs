//! Policy routing for per-link egress
//!
//! Each link gets a default route in its own table and a rule sending packets
//! carrying its mark to that table. Every installed item records its exact
//! inverse so teardown restores the pre-start kernel state.

use super::firewall::Firewall;
use super::{Link, LinkRegistry};
use crate::platform::{Effector, PlatformError, SystemCommand};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Failed to provision routing for {link}: {source}")]
    ProvisionFailed {
        link: String,
        source: PlatformError,
    },
}

/// One routing item installed for a link, with its inverse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteArtifact {
    pub link: String,
    pub install: SystemCommand,
    pub inverse: SystemCommand,
}

/// Recorded inverses, replayed in recording order at teardown
#[derive(Debug, Clone, Default)]
pub struct RouteLedger {
    artifacts: Vec<RouteArtifact>,
}

impl RouteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an artifact unless its inverse is already recorded
    pub fn record(&mut self, artifact: RouteArtifact) {
        if !self.artifacts.iter().any(|a| a.inverse == artifact.inverse) {
            self.artifacts.push(artifact);
        }
    }

    pub fn artifacts(&self) -> &[RouteArtifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// Outcome of a best-effort teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub attempted: usize,
    pub failed: usize,
}

pub struct PolicyRouter {
    effector: Arc<dyn Effector>,
}

impl PolicyRouter {
    pub fn new(effector: Arc<dyn Effector>) -> Self {
        Self { effector }
    }

    pub fn route_command(verb: &str, link: &Link) -> SystemCommand {
        let table = link.table.to_string();
        SystemCommand::new(
            "ip",
            ["route", verb, "default", "dev", link.name.as_str(), "table", table.as_str()],
        )
    }

    pub fn rule_command(verb: &str, link: &Link) -> SystemCommand {
        let mark = link.mark_hex();
        let table = link.table.to_string();
        SystemCommand::new(
            "ip",
            ["rule", verb, "fwmark", mark.as_str(), "lookup", table.as_str()],
        )
    }

    /// Install routing for every link, recording inverses into `ledger`.
    ///
    /// Safe to repeat for the same links: the route is replaced and a stale
    /// identical rule is removed before the rule is added.
    pub async fn provision(
        &self,
        registry: &LinkRegistry,
        ledger: &mut RouteLedger,
    ) -> Result<(), RoutingError> {
        for link in registry.iter() {
            self.provision_link(link, ledger).await?;
        }
        info!("Provisioned policy routing for {} link(s)", registry.len());
        Ok(())
    }

    async fn provision_link(&self, link: &Link, ledger: &mut RouteLedger) -> Result<(), RoutingError> {
        let failed = |source| RoutingError::ProvisionFailed {
            link: link.name.clone(),
            source,
        };

        let route = Self::route_command("replace", link);
        self.effector.run(&route).await.map_err(failed)?;
        ledger.record(RouteArtifact {
            link: link.name.clone(),
            install: route,
            inverse: Self::route_command("del", link),
        });

        if let Err(e) = self.effector.run(&Self::rule_command("del", link)).await {
            debug!("No stale rule for {}: {}", link.name, e);
        }

        let rule = Self::rule_command("add", link);
        self.effector.run(&rule).await.map_err(failed)?;
        ledger.record(RouteArtifact {
            link: link.name.clone(),
            install: rule,
            inverse: Self::rule_command("del", link),
        });

        info!(
            "Link {}: mark {} -> table {}",
            link.name,
            link.mark_hex(),
            link.table
        );
        Ok(())
    }

    /// Replay every recorded inverse, then remove the firewall table.
    /// Failures are logged and never stop the remaining steps.
    pub async fn teardown(&self, ledger: RouteLedger, firewall: &Firewall) -> TeardownReport {
        let mut report = TeardownReport::default();

        for artifact in ledger.artifacts {
            report.attempted += 1;
            match self.effector.run(&artifact.inverse).await {
                Ok(_) => debug!("Removed: {}", artifact.inverse),
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to undo routing for {}: {} (continuing)", artifact.link, e);
                }
            }
        }

        report.attempted += 1;
        if let Err(e) = firewall.delete_table().await {
            report.failed += 1;
            warn!("Failed to delete firewall table: {} (continuing)", e);
        }

        info!(
            "Teardown complete: {} step(s), {} failure(s)",
            report.attempted, report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkConfig, LinksConfig};
    use crate::platform::RecordingEffector;

    fn registry() -> LinkRegistry {
        LinkRegistry::from_config(&LinksConfig {
            vpn: vec![LinkConfig {
                name: "wg0".to_string(),
                weight: 1,
            }],
            wan: vec![LinkConfig {
                name: "eth0".to_string(),
                weight: 1,
            }],
            ..LinksConfig::default()
        })
    }

    fn setup() -> (Arc<RecordingEffector>, PolicyRouter, Firewall) {
        let effector = Arc::new(RecordingEffector::new());
        (
            effector.clone(),
            PolicyRouter::new(effector.clone()),
            Firewall::new(effector),
        )
    }

    #[test]
    fn test_routing_error_display() {
        let err = RoutingError::ProvisionFailed {
            link: "wg0".to_string(),
            source: PlatformError::CommandFailed {
                command: "ip rule add fwmark 0x3e9 lookup 1001".to_string(),
                output: "permission denied".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("wg0"));
        assert!(msg.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_provision_commands() {
        let (effector, router, _) = setup();
        let mut ledger = RouteLedger::new();
        router.provision(&registry(), &mut ledger).await.unwrap();

        assert_eq!(
            effector.rendered(),
            vec![
                "ip route replace default dev wg0 table 1001",
                "ip rule del fwmark 0x3e9 lookup 1001",
                "ip rule add fwmark 0x3e9 lookup 1001",
                "ip route replace default dev eth0 table 1002",
                "ip rule del fwmark 0x3ea lookup 1002",
                "ip rule add fwmark 0x3ea lookup 1002",
            ]
        );

        let inverses: Vec<_> = ledger.artifacts().iter().map(|a| a.inverse.to_string()).collect();
        assert_eq!(
            inverses,
            vec![
                "ip route del default dev wg0 table 1001",
                "ip rule del fwmark 0x3e9 lookup 1001",
                "ip route del default dev eth0 table 1002",
                "ip rule del fwmark 0x3ea lookup 1002",
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_rule_removal_failure_is_ignored() {
        let (effector, router, _) = setup();
        effector.fail_matching("rule del");
        let mut ledger = RouteLedger::new();
        router.provision(&registry(), &mut ledger).await.unwrap();
        assert_eq!(ledger.len(), 4);
    }

    #[tokio::test]
    async fn test_provision_failure_keeps_partial_ledger() {
        let (effector, router, _) = setup();
        effector.fail_matching("dev eth0");
        let mut ledger = RouteLedger::new();

        let err = router.provision(&registry(), &mut ledger).await.unwrap_err();
        assert!(err.to_string().contains("eth0"));
        // wg0 was fully provisioned and must still be undoable
        assert_eq!(ledger.len(), 2);
        assert!(ledger.artifacts().iter().all(|a| a.link == "wg0"));
    }

    #[tokio::test]
    async fn test_reprovision_does_not_duplicate_inverses() {
        let (_, router, _) = setup();
        let mut ledger = RouteLedger::new();
        router.provision(&registry(), &mut ledger).await.unwrap();
        router.provision(&registry(), &mut ledger).await.unwrap();
        assert_eq!(ledger.len(), 4);
    }

    #[tokio::test]
    async fn test_teardown_attempts_every_inverse() {
        let (effector, router, firewall) = setup();
        let mut ledger = RouteLedger::new();
        router.provision(&registry(), &mut ledger).await.unwrap();
        effector.take();

        effector.fail_matching("dev wg0");
        let report = router.teardown(ledger, &firewall).await;

        assert_eq!(report, TeardownReport { attempted: 5, failed: 1 });
        assert_eq!(
            effector.rendered(),
            vec![
                "ip route del default dev wg0 table 1001",
                "ip rule del fwmark 0x3e9 lookup 1001",
                "ip route del default dev eth0 table 1002",
                "ip rule del fwmark 0x3ea lookup 1002",
                "nft delete table ip shieldlink",
            ]
        );
    }
}
