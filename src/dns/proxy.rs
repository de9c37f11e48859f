//! Forwarding DNS relay with bypass harvesting
//!
//! Each query is relayed to the upstreams in declared order until one
//! answers; the chosen answer is returned verbatim. Answers to bypass-listed
//! names feed their IPv4 addresses to the [`BypassTracker`] before the reply
//! is sent, so the client's next connection already takes the bypass path.

use super::matcher::BypassMatcher;
use super::tracker::BypassTracker;
use super::wire::{self, WireError};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receive buffer for client queries and upstream answers
pub const MAX_MESSAGE: usize = 4096;

pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to bind DNS listener on {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Upstream {upstream} failed: {source}")]
    UpstreamError {
        upstream: SocketAddr,
        source: std::io::Error,
    },
    #[error("Upstream {0} timed out")]
    UpstreamTimeout(SocketAddr),
    #[error("No upstream answered")]
    NoUpstream,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Forwarding and harvesting logic shared by all in-flight queries
pub struct Relay {
    upstreams: Vec<SocketAddr>,
    upstream_timeout: Duration,
    matcher: BypassMatcher,
    tracker: Arc<BypassTracker>,
}

impl Relay {
    pub fn new(
        upstreams: Vec<SocketAddr>,
        upstream_timeout: Duration,
        matcher: BypassMatcher,
        tracker: Arc<BypassTracker>,
    ) -> Self {
        Self {
            upstreams,
            upstream_timeout,
            matcher,
            tracker,
        }
    }

    /// Answer one query: the first upstream's response, or a synthesized
    /// server failure. `None` if the query is too malformed to answer.
    pub async fn resolve(&self, query: &[u8]) -> Option<Vec<u8>> {
        if let Err(e) = wire::message_id(query) {
            debug!("Dropping malformed query: {}", e);
            return None;
        }

        match self.forward(query).await {
            Ok(response) => {
                self.harvest(query, &response).await;
                Some(response)
            }
            Err(e) => {
                warn!("{}, answering SERVFAIL", e);
                wire::server_failure(query).ok()
            }
        }
    }

    /// Try each upstream once, in order
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, ProxyError> {
        for upstream in &self.upstreams {
            match exchange(*upstream, query, self.upstream_timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => warn!("Failed to forward query: {}", e),
            }
        }
        Err(ProxyError::NoUpstream)
    }

    async fn harvest(&self, query: &[u8], response: &[u8]) {
        let Ok(name) = wire::question_name(query) else {
            return;
        };
        if !self.matcher.is_match(&name) {
            return;
        }

        match wire::answer_ipv4s(response) {
            Ok(ips) if ips.is_empty() => debug!("Bypass domain {} has no IPv4 answers", name),
            Ok(ips) => {
                let added = self.tracker.observe(&ips).await;
                info!("Bypass domain {}: {} address(es), {} new", name, ips.len(), added);
            }
            Err(e) => warn!("Cannot inspect answer for {}: {}", name, e),
        }
    }
}

/// One query/answer round-trip on a fresh socket connected to `upstream`.
/// Datagrams with a different id are ignored until the timeout.
pub async fn exchange(
    upstream: SocketAddr,
    query: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, ProxyError> {
    let id = wire::message_id(query)?;
    let io_err = |source| ProxyError::UpstreamError { upstream, source };

    let local: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await.map_err(io_err)?;
    socket.connect(upstream).await.map_err(io_err)?;
    socket.send(query).await.map_err(io_err)?;

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; MAX_MESSAGE];
    loop {
        let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(upstream))?
            .map_err(io_err)?;

        if wire::message_id(&buf[..len]) == Ok(id) {
            buf.truncate(len);
            return Ok(buf);
        }
        debug!("Ignoring reply from {} with unexpected id", upstream);
    }
}

/// UDP DNS listener
pub struct DnsProxy {
    socket: Arc<UdpSocket>,
    relay: Arc<Relay>,
    grace: Duration,
}

impl DnsProxy {
    pub async fn bind(addr: SocketAddr, relay: Relay) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ProxyError::BindError { addr, source })?;
        Ok(Self {
            socket: Arc::new(socket),
            relay: Arc::new(relay),
            grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// How long in-flight queries may run after shutdown is requested
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until cancelled, then give in-flight queries the grace period
    pub async fn serve(self, token: CancellationToken) {
        match self.socket.local_addr() {
            Ok(addr) => info!("DNS proxy listening on {}", addr),
            Err(_) => info!("DNS proxy listening"),
        }

        let mut inflight = JoinSet::new();
        let mut buf = vec![0u8; MAX_MESSAGE];

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        let query = buf[..len].to_vec();
                        let relay = self.relay.clone();
                        let socket = self.socket.clone();
                        inflight.spawn(async move {
                            let Some(response) = relay.resolve(&query).await else {
                                return;
                            };
                            if let Err(e) = socket.send_to(&response, peer).await {
                                warn!("Failed to answer {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("DNS receive error: {}", e),
                },
                Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = done {
                        warn!("DNS query task failed: {}", e);
                    }
                }
            }
        }

        let pending = inflight.len();
        if pending > 0 {
            info!("DNS proxy stopping, waiting for {} in-flight query(ies)", pending);
        }
        let drain = async { while inflight.join_next().await.is_some() {} };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!("Abandoning {} DNS query(ies) after grace period", inflight.len());
            inflight.abort_all();
        }
        info!("DNS proxy stopped");
    }
}
