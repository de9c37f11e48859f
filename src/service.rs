//! Process wiring: DNS relay plus steering engine, run until a signal

use crate::config::{Config, ConfigError};
use crate::dns::{
    BypassMatcher, BypassTracker, DnsProxy, MatcherError, ProxyError, Relay, TrackerError,
    SWEEP_INTERVAL,
};
use crate::platform::{self, Effector, PlatformError, RecordingEffector};
use crate::steering::{EngineError, Firewall, PingProber, Prober, SteeringEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Upper bound on stopping the DNS relay and saving the cache; kernel
/// teardown runs after it regardless
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Matcher(#[from] MatcherError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Failed to restore bypass cache: {0}")]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("Failed to listen for shutdown signals: {0}")]
    SignalError(std::io::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Log kernel commands instead of executing them
    pub dry_run: bool,
}

/// A started service: the relay is serving and links are being monitored
pub struct Service {
    engine: SteeringEngine,
    tracker: Arc<BypassTracker>,
    dns_addr: SocketAddr,
    proxy: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    token: CancellationToken,
}

impl Service {
    /// Bring everything up in dependency order. The DNS port is bound
    /// before any kernel state is touched so a taken port fails fast; the
    /// persisted bypass set is re-applied before the first query is served.
    pub async fn start(
        config: &Config,
        effector: Arc<dyn Effector>,
        prober: Arc<dyn Prober>,
        token: CancellationToken,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let matcher = BypassMatcher::new(&config.bypass.domains)?;
        info!("Loaded {} bypass domain pattern(s)", matcher.len());

        let firewall = Arc::new(Firewall::new(effector.clone()));
        let tracker = Arc::new(BypassTracker::new(
            firewall.clone(),
            config.dns.cache_file.clone(),
            config.dns.cache_ttl(),
        ));
        let relay = Relay::new(
            config.dns.upstream_addrs()?,
            config.dns.upstream_timeout(),
            matcher,
            tracker.clone(),
        );
        let proxy = DnsProxy::bind(config.dns.listen_addr(), relay)
            .await?
            .with_grace(config.dns.shutdown_grace());
        let dns_addr = proxy
            .local_addr()
            .map_err(|source| ProxyError::BindError {
                addr: config.dns.listen_addr(),
                source,
            })?;

        let engine = SteeringEngine::start(config, effector, prober, firewall, &token).await?;

        if let Err(e) = tracker.restore().await {
            error!("{}", e);
            engine.shutdown().await;
            return Err(e.into());
        }

        let sweeper = tracker.spawn_sweeper(SWEEP_INTERVAL, token.clone());
        let proxy = tokio::spawn(proxy.serve(token.clone()));

        Ok(Self {
            engine,
            tracker,
            dns_addr,
            proxy,
            sweeper,
            token,
        })
    }

    pub fn dns_addr(&self) -> SocketAddr {
        self.dns_addr
    }

    pub fn engine(&self) -> &SteeringEngine {
        &self.engine
    }

    pub fn tracker(&self) -> &Arc<BypassTracker> {
        &self.tracker
    }

    /// Stop accepting queries and save the cache, bounded by
    /// [`SHUTDOWN_TIMEOUT`], then stop monitoring and remove every kernel
    /// artifact. Teardown always runs to the end; each command carries its
    /// own timeout.
    pub async fn shutdown(self) {
        let Self {
            engine,
            tracker,
            mut proxy,
            mut sweeper,
            token,
            ..
        } = self;
        info!("Shutting down...");
        token.cancel();

        let drain = async {
            if let Err(e) = (&mut proxy).await {
                warn!("DNS proxy ended abnormally: {}", e);
            }
            if let Err(e) = (&mut sweeper).await {
                warn!("Bypass sweeper ended abnormally: {}", e);
            }
            if let Err(e) = tracker.persist().await {
                warn!("Failed to save bypass cache: {}", e);
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            error!(
                "DNS shutdown did not finish within {:?}, removing kernel state anyway",
                SHUTDOWN_TIMEOUT
            );
            proxy.abort();
            sweeper.abort();
        }

        let report = engine.shutdown().await;
        if report.failed > 0 {
            warn!(
                "{} of {} teardown step(s) failed; check `ip rule` and `nft list tables`",
                report.failed, report.attempted
            );
        }
        info!("Shutdown complete");
    }
}

/// Run the service until SIGINT or SIGTERM
pub async fn run(config: Config, options: RunOptions) -> Result<(), ServiceError> {
    let effector: Arc<dyn Effector> = if options.dry_run {
        info!("Dry run: kernel commands are logged, not executed");
        Arc::new(RecordingEffector::new())
    } else {
        warn_if_unprivileged();
        platform::get_effector()?
    };

    let token = CancellationToken::new();
    let service = Service::start(&config, effector, Arc::new(PingProber::new()), token).await?;
    info!("DNS relay on {}", service.dns_addr());

    let signalled = wait_for_signal().await;
    service.shutdown().await;
    signalled.map_err(ServiceError::SignalError)
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn warn_if_unprivileged() {
    #[cfg(unix)]
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root; nft and ip commands will likely fail");
    }
}
