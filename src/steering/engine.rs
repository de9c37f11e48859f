//! Start-up and shutdown orchestration for the steering control plane

use super::chain::{ChainHandle, ChainMember, ChainWorker};
use super::firewall::Firewall;
use super::health::{LinkMonitor, MonitorHandle, MonitorSettings, Prober, INITIAL_PROBE_WINDOW};
use super::routes::{PolicyRouter, RouteLedger, RoutingError, TeardownReport};
use super::{Link, LinkId, LinkRegistry, LinkRole, LinkStatus, TrafficChain};
use crate::config::{Config, ConfigError};
use crate::platform::{Effector, PlatformError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to set up firewall: {0}")]
    Firewall(#[from] PlatformError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

struct ChainRuntime {
    chain: TrafficChain,
    handle: ChainHandle,
    task: JoinHandle<()>,
}

/// Running steering control plane
pub struct SteeringEngine {
    registry: LinkRegistry,
    router: PolicyRouter,
    firewall: Arc<Firewall>,
    ledger: RouteLedger,
    statuses: Vec<watch::Receiver<LinkStatus>>,
    monitors: Vec<JoinHandle<()>>,
    chains: Vec<ChainRuntime>,
    token: CancellationToken,
}

impl SteeringEngine {
    /// Install the firewall table and policy routing, start one monitor per
    /// link, and program both chains once every link has reported (or the
    /// initial probe window has elapsed).
    ///
    /// Kernel state touched before a fatal error is rolled back before the
    /// error is returned.
    pub async fn start(
        config: &Config,
        effector: Arc<dyn Effector>,
        prober: Arc<dyn Prober>,
        firewall: Arc<Firewall>,
        token: &CancellationToken,
    ) -> Result<Self, EngineError> {
        let static_entries = config.bypass.static_entries()?;
        let registry = LinkRegistry::from_config(&config.links);
        let router = PolicyRouter::new(effector);
        let mut ledger = RouteLedger::new();

        firewall.install(&config.links.lan).await?;

        if let Err(e) = firewall.add_static_bypass(&static_entries).await {
            error!("Failed to load static bypass list: {}", e);
            router.teardown(ledger, &firewall).await;
            return Err(e.into());
        }

        if let Err(e) = router.provision(&registry, &mut ledger).await {
            error!("{}", e);
            router.teardown(ledger, &firewall).await;
            return Err(e.into());
        }

        let token = token.child_token();
        let settings = Arc::new(MonitorSettings::new(
            config.health.ping_targets.clone(),
            config.health.ping_timeout(),
            config.health.probe_interval(),
        ));

        let mut senders = Vec::with_capacity(registry.len());
        let mut statuses = Vec::with_capacity(registry.len());
        for _ in registry.iter() {
            let (tx, rx) = watch::channel(LinkStatus::Available);
            senders.push(tx);
            statuses.push(rx);
        }

        let spawn_chain = |role: LinkRole| {
            let chain = TrafficChain::for_role(role, &config.links);
            let members = registry
                .by_role(role)
                .map(|link| ChainMember {
                    link: link.id,
                    mark: link.mark,
                    weight: link.weight(),
                    status: statuses[link.id.0].clone(),
                })
                .collect();
            let (handle, task) = ChainWorker::spawn(chain, members, firewall.clone());
            ChainRuntime {
                chain,
                handle,
                task,
            }
        };
        let vpn = spawn_chain(LinkRole::Vpn);
        let wan = spawn_chain(LinkRole::Wan);

        let mut pending: Vec<MonitorHandle> = registry
            .iter()
            .zip(senders)
            .map(|(link, status)| {
                let chain = match link.role {
                    LinkRole::Vpn => vpn.handle.clone(),
                    LinkRole::Wan => wan.handle.clone(),
                };
                LinkMonitor::new(
                    link.clone(),
                    prober.clone(),
                    settings.clone(),
                    status,
                    chain,
                    token.clone(),
                )
                .spawn()
            })
            .collect();
        let chains = vec![vpn, wan];

        // All monitors share one deadline for their first outcome
        let deadline = Instant::now() + INITIAL_PROBE_WINDOW;
        for monitor in pending.iter_mut() {
            monitor.wait_ready(deadline).await;
        }
        let monitors = pending.into_iter().map(|m| m.task).collect();

        for runtime in &chains {
            runtime.handle.recompute().await;
        }

        info!(
            "Steering started: {} VPN link(s), {} WAN link(s)",
            registry.by_role(LinkRole::Vpn).count(),
            registry.by_role(LinkRole::Wan).count()
        );

        Ok(Self {
            registry,
            router,
            firewall,
            ledger,
            statuses,
            monitors,
            chains,
            token,
        })
    }

    pub fn registry(&self) -> &LinkRegistry {
        &self.registry
    }

    pub fn status(&self, id: LinkId) -> Option<LinkStatus> {
        self.statuses.get(id.0).map(|rx| *rx.borrow())
    }

    /// Every link with its current status, in declaration order
    pub fn statuses(&self) -> Vec<(&Link, LinkStatus)> {
        self.registry
            .iter()
            .zip(&self.statuses)
            .map(|(link, rx)| (link, *rx.borrow()))
            .collect()
    }

    /// Force a recompute of both chains and wait until they are applied
    pub async fn recompute(&self) {
        for runtime in &self.chains {
            runtime.handle.recompute().await;
        }
    }

    /// Stop monitors, drain the chain workers, then undo routing and delete
    /// the firewall table
    pub async fn shutdown(self) -> TeardownReport {
        self.token.cancel();

        for monitor in self.monitors {
            if let Err(e) = monitor.await {
                warn!("Link monitor ended abnormally: {}", e);
            }
        }

        // Monitors held the remaining handles; dropping ours closes the queues
        for runtime in self.chains {
            drop(runtime.handle);
            if let Err(e) = runtime.task.await {
                warn!("Chain {} worker ended abnormally: {}", runtime.chain.name(), e);
            }
        }

        self.router.teardown(self.ledger, &self.firewall).await
    }
}
