//! Per-link health monitoring
//!
//! Each link is probed through its own egress, one probe at a time, cycling
//! through the ping targets after each failure. A link goes unavailable only
//! after more than [`FAILURE_THRESHOLD`] consecutive failed probes and comes
//! back on the first success.

use super::chain::ChainHandle;
use super::{Link, LinkStatus};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive failures tolerated before a link is marked unavailable
pub const FAILURE_THRESHOLD: u32 = 2;

pub const FAILURE_BACKOFF: Duration = Duration::from_secs(2);

/// Upper bound on how long start-up waits for a link's first probe
pub const INITIAL_PROBE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to run probe: {0}")]
    SpawnError(#[from] std::io::Error),
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Status with failure hysteresis
#[derive(Debug, Clone, Default)]
pub struct Hysteresis {
    status: LinkStatus,
    failures: u32,
}

impl Hysteresis {
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the new status if this sample caused a transition
    pub fn record_success(&mut self) -> Option<LinkStatus> {
        self.failures = 0;
        self.transition(LinkStatus::Available)
    }

    /// Returns the new status if this sample caused a transition
    pub fn record_failure(&mut self) -> Option<LinkStatus> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > FAILURE_THRESHOLD {
            self.transition(LinkStatus::Unavailable)
        } else {
            None
        }
    }

    fn transition(&mut self, to: LinkStatus) -> Option<LinkStatus> {
        if self.status == to {
            return None;
        }
        self.status = to;
        Some(to)
    }
}

/// Reachability probe bound to one link's egress
#[async_trait]
pub trait Prober: Send + Sync {
    /// `Ok(true)` if at least one successful sample was observed
    async fn probe(&self, interface: &str, target: &str, timeout: Duration)
    -> Result<bool, ProbeError>;
}

static PING_REPLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+ bytes from .+: icmp_seq=\d+ ttl=\d+ time=.+ ms").expect("valid regex")
});

/// Whether a line of `ping` output reports a reply
pub fn is_ping_success(line: &str) -> bool {
    (line.contains("bytes from") && line.contains("time=")) || PING_REPLY.is_match(line)
}

/// Probes with the system `ping`, bound to the interface with `-I`
pub struct PingProber;

impl PingProber {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(
        &self,
        interface: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<bool, ProbeError> {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let child = Command::new("ping")
            .args(["-n", "-c", "1", "-W", wait_secs.as_str(), "-I", interface, target])
            .kill_on_drop(true)
            .output();

        // Dropping the future on expiry kills the ping process
        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| ProbeError::Timeout(timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut success = false;
        for line in stdout.lines() {
            if is_ping_success(line) {
                success = true;
            } else if !line.trim().is_empty() {
                debug!("ping {} via {}: {}", target, interface, line);
            }
        }
        Ok(success)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub targets: Vec<String>,
    pub probe_timeout: Duration,
    /// Pause after a successful probe
    pub probe_interval: Duration,
    /// Pause after a failed probe, before moving to the next target
    pub backoff: Duration,
}

impl MonitorSettings {
    pub fn new(targets: Vec<String>, probe_timeout: Duration, probe_interval: Duration) -> Self {
        Self {
            targets,
            probe_timeout,
            probe_interval,
            backoff: FAILURE_BACKOFF,
        }
    }
}

/// Health monitor for one link
pub struct LinkMonitor {
    link: Link,
    prober: Arc<dyn Prober>,
    settings: Arc<MonitorSettings>,
    status: watch::Sender<LinkStatus>,
    chain: ChainHandle,
    token: CancellationToken,
}

/// A running monitor and its start-up gate
pub struct MonitorHandle {
    pub task: JoinHandle<()>,
    ready: oneshot::Receiver<()>,
}

impl MonitorHandle {
    /// Wait until the first probe resolved or `deadline` passed
    pub async fn wait_ready(&mut self, deadline: Instant) {
        let _ = tokio::time::timeout_at(deadline, &mut self.ready).await;
    }
}

impl LinkMonitor {
    pub fn new(
        link: Link,
        prober: Arc<dyn Prober>,
        settings: Arc<MonitorSettings>,
        status: watch::Sender<LinkStatus>,
        chain: ChainHandle,
        token: CancellationToken,
    ) -> Self {
        Self {
            link,
            prober,
            settings,
            status,
            chain,
            token,
        }
    }

    /// Start probing; the handle's gate opens after the first probe
    pub fn spawn(self) -> MonitorHandle {
        let (ready_tx, ready) = oneshot::channel();
        let task = tokio::spawn(self.run(ready_tx));
        MonitorHandle { task, ready }
    }

    async fn run(self, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut hysteresis = Hysteresis::default();
        let mut cursor = 0usize;
        let targets = &self.settings.targets;

        if targets.is_empty() {
            warn!("Link {}: no ping targets, monitor idle", self.link.name);
            return;
        }

        info!("Monitoring link {} ({})", self.link.name, self.link.role);

        while !self.token.is_cancelled() {
            let target = targets[cursor].as_str();
            let outcome = tokio::select! {
                _ = self.token.cancelled() => break,
                outcome = self.prober.probe(&self.link.name, target, self.settings.probe_timeout) => outcome,
            };

            let success = match outcome {
                Ok(true) => true,
                Ok(false) => {
                    debug!("Link {}: no reply from {}", self.link.name, target);
                    false
                }
                Err(e) => {
                    warn!("Link {}: probe to {} failed: {}", self.link.name, target, e);
                    false
                }
            };

            let (transition, pause) = if success {
                (hysteresis.record_success(), self.settings.probe_interval)
            } else {
                cursor = (cursor + 1) % targets.len();
                (hysteresis.record_failure(), self.settings.backoff)
            };

            if let Some(status) = transition {
                self.publish(status);
            }
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        debug!("Link {}: monitor stopped", self.link.name);
    }

    fn publish(&self, status: LinkStatus) {
        info!("Link {} is now {}", self.link.name, status);
        self.status.send_replace(status);
        self.chain.notify(self.link.id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hysteresis_needs_more_than_two_failures() {
        let mut h = Hysteresis::default();
        assert_eq!(h.status(), LinkStatus::Available);
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), Some(LinkStatus::Unavailable));
        assert_eq!(h.failures(), 3);
        // Further failures don't re-announce
        assert_eq!(h.record_failure(), None);
    }

    #[test]
    fn test_hysteresis_recovers_on_first_success() {
        let mut h = Hysteresis::default();
        for _ in 0..5 {
            h.record_failure();
        }
        assert_eq!(h.status(), LinkStatus::Unavailable);
        assert_eq!(h.record_success(), Some(LinkStatus::Available));
        assert_eq!(h.failures(), 0);
        assert_eq!(h.record_success(), None);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut h = Hysteresis::default();
        h.record_failure();
        h.record_failure();
        h.record_success();
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.status(), LinkStatus::Available);
    }

    #[test]
    fn test_ping_success_detection() {
        assert!(is_ping_success(
            "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms"
        ));
        assert!(!is_ping_success("PING 8.8.8.8 (8.8.8.8) from 10.0.0.2 wg0: 56(84) bytes of data."));
        assert!(!is_ping_success("1 packets transmitted, 0 received, 100% packet loss, time 0ms"));
        assert!(!is_ping_success("ping: connect: Network is unreachable"));
        // ICMP errors carry a sequence number but are not replies
        assert!(!is_ping_success(
            "From 10.8.0.1 icmp_seq=1 Destination Host Unreachable"
        ));
    }

    #[test]
    fn test_monitor_settings_default_backoff() {
        let settings = MonitorSettings::new(
            vec!["8.8.8.8".to_string()],
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        assert_eq!(settings.backoff, FAILURE_BACKOFF);
    }
}
