//! Steering integration tests.
//!
//! Drives the router and the engine against a simulated kernel and scripted
//! probes: idempotent provisioning with exact rollback, hysteresis as seen
//! through the programmed chains, and fail-closed/fail-open behaviour.

mod common;

use async_trait::async_trait;
use common::{FakeKernel, KernelState};
use parking_lot::Mutex;
use shieldlink::config::{Config, LinkConfig, LinksConfig};
use shieldlink::steering::health::ProbeError;
use shieldlink::steering::{
    Firewall, LinkRegistry, LinkStatus, PolicyRouter, Prober, RouteLedger, SteeringEngine,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn link(name: &str, weight: i64) -> LinkConfig {
    LinkConfig {
        name: name.to_string(),
        weight,
    }
}

fn links() -> LinksConfig {
    LinksConfig {
        vpn: vec![link("wg0", 1), link("wg1", 3)],
        wan: vec![link("eth0", 1), link("eth1", 1)],
        ..LinksConfig::default()
    }
}

fn config() -> Config {
    Config {
        links: links(),
        ..Config::default()
    }
}

/// Kernel with pre-existing state the crate must leave alone
fn preexisting() -> KernelState {
    let mut state = KernelState::default();
    state.routes.insert(("main".to_string(), "eth0".to_string()));
    state.rules.push(("0x1".to_string(), "100".to_string()));
    state
}

/// Per-interface probe outcomes; the last outcome repeats forever
struct ScriptedProber {
    script: Mutex<HashMap<String, VecDeque<bool>>>,
}

impl ScriptedProber {
    fn new(script: &[(&str, Vec<bool>)]) -> Self {
        Self {
            script: Mutex::new(
                script
                    .iter()
                    .map(|(iface, outcomes)| (iface.to_string(), outcomes.iter().copied().collect()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, interface: &str, _: &str, _: Duration) -> Result<bool, ProbeError> {
        let mut script = self.script.lock();
        let Some(outcomes) = script.get_mut(interface) else {
            return Ok(true);
        };
        let outcome = if outcomes.len() > 1 {
            outcomes.pop_front().unwrap_or(true)
        } else {
            outcomes.front().copied().unwrap_or(true)
        };
        if outcome {
            Ok(true)
        } else {
            Err(ProbeError::Timeout(Duration::from_secs(5)))
        }
    }
}

async fn start(kernel: &Arc<FakeKernel>, prober: ScriptedProber) -> SteeringEngine {
    let firewall = Arc::new(Firewall::new(kernel.clone()));
    SteeringEngine::start(
        &config(),
        kernel.clone(),
        Arc::new(prober),
        firewall,
        &CancellationToken::new(),
    )
    .await
    .expect("engine starts")
}

fn status_of(engine: &SteeringEngine, name: &str) -> LinkStatus {
    engine
        .statuses()
        .into_iter()
        .find(|(link, _)| link.name == name)
        .map(|(_, status)| status)
        .expect("link exists")
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reprovision_then_single_teardown_restores_kernel() {
    let kernel = Arc::new(FakeKernel::with_state(preexisting()));
    let firewall = Firewall::new(kernel.clone());
    firewall.install(&["lan0".to_string()]).await.unwrap();
    let before = KernelState {
        table: false,
        sets: Default::default(),
        ..kernel.state()
    };

    let registry = LinkRegistry::from_config(&links());
    let router = PolicyRouter::new(kernel.clone());
    let mut ledger = RouteLedger::new();
    router.provision(&registry, &mut ledger).await.unwrap();
    router.provision(&registry, &mut ledger).await.unwrap();

    let provisioned = kernel.state();
    assert_eq!(provisioned.routes.len(), 5);
    // The stale-rule removal keeps exactly one rule per link
    assert_eq!(provisioned.rules.len(), 5);
    assert!(provisioned.rules.contains(&("0x3e9".to_string(), "1001".to_string())));
    assert!(provisioned.rules.contains(&("0x3ec".to_string(), "1004".to_string())));

    let report = router.teardown(ledger, &firewall).await;
    assert_eq!(report.failed, 0);
    assert_eq!(kernel.state(), before);
}

#[tokio::test]
async fn teardown_continues_past_failures() {
    let kernel = Arc::new(FakeKernel::new());
    let firewall = Firewall::new(kernel.clone());
    firewall.install(&[]).await.unwrap();

    let router = PolicyRouter::new(kernel.clone());
    let mut ledger = RouteLedger::new();
    router
        .provision(&LinkRegistry::from_config(&links()), &mut ledger)
        .await
        .unwrap();

    kernel.fail_matching("dev wg1");
    let report = router.teardown(ledger, &firewall).await;

    assert_eq!(report.attempted, 9);
    assert_eq!(report.failed, 1);
    let state = kernel.state();
    assert_eq!(
        state.routes.iter().collect::<Vec<_>>(),
        vec![&("1002".to_string(), "wg1".to_string())]
    );
    assert!(state.rules.is_empty());
    assert!(!state.table);
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn healthy_links_get_weighted_split() {
    let kernel = Arc::new(FakeKernel::new());
    let engine = start(&kernel, ScriptedProber::new(&[])).await;

    let vpn = kernel.chain("vpn").expect("vpn chain programmed");
    assert!(vpn.contains("ct state established,related meta mark set ct mark"));
    assert!(vpn.contains("numgen random mod 100 map { 0-25 : 0x3e9, 26-100 : 0x3ea }"));

    let wan = kernel.chain("wan").expect("wan chain programmed");
    assert!(wan.contains("map { 0-50 : 0x3eb, 51-100 : 0x3ec }"));

    engine.shutdown().await;
    assert_eq!(kernel.state(), KernelState::default());
}

#[tokio::test(start_paused = true)]
async fn link_drops_after_three_failures_and_recovers_on_first_success() {
    let kernel = Arc::new(FakeKernel::new());
    // Probes at t=0, 2, 4 fail (2s backoff), t=6 succeeds
    let prober = ScriptedProber::new(&[("wg1", vec![false, false, false, true])]);
    let engine = start(&kernel, prober).await;

    tokio::time::sleep(Duration::from_millis(3000)).await;
    // Two failures are tolerated
    assert_eq!(status_of(&engine, "wg1"), LinkStatus::Available);

    tokio::time::sleep(Duration::from_millis(2000)).await;
    engine.recompute().await;
    assert_eq!(status_of(&engine, "wg1"), LinkStatus::Unavailable);
    let vpn = kernel.chain("vpn").unwrap();
    assert!(vpn.contains("add rule ip shieldlink vpn meta mark set 0x3e9\n"));
    assert!(!vpn.contains("numgen"));

    tokio::time::sleep(Duration::from_millis(2000)).await;
    engine.recompute().await;
    assert_eq!(status_of(&engine, "wg1"), LinkStatus::Available);
    assert!(kernel.chain("vpn").unwrap().contains("0-25 : 0x3e9, 26-100 : 0x3ea"));

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_chains_fail_closed_for_vpn_and_open_for_wan() {
    let kernel = Arc::new(FakeKernel::new());
    let prober = ScriptedProber::new(&[
        ("wg0", vec![false]),
        ("wg1", vec![false]),
        ("eth0", vec![false]),
        ("eth1", vec![false]),
    ]);
    let engine = start(&kernel, prober).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    engine.recompute().await;

    assert!(engine
        .statuses()
        .iter()
        .all(|(_, status)| *status == LinkStatus::Unavailable));
    assert_eq!(
        kernel.chain("vpn").unwrap(),
        "flush chain ip shieldlink vpn\nadd rule ip shieldlink vpn reject\n"
    );
    assert_eq!(kernel.chain("wan").unwrap(), "flush chain ip shieldlink wan\n");

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_chain_program_is_retried_on_next_transition() {
    let kernel = Arc::new(FakeKernel::new());
    kernel.fail_matching("numgen");
    let prober = ScriptedProber::new(&[("wg0", vec![false, false, false, false, true])]);
    let engine = start(&kernel, prober).await;

    // Both initial splits are rejected; start-up still succeeds
    assert!(kernel.chain("vpn").is_none());
    assert!(kernel.chain("wan").is_none());

    // wg0 goes down at t=4 and the transition reprograms the chain
    kernel.clear_failures();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let vpn = kernel.chain("vpn").expect("reprogrammed after transition");
    assert!(vpn.contains("meta mark set 0x3ea"));

    engine.shutdown().await;
}
