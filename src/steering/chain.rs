//! Per-chain serializer
//!
//! Link monitors never program the firewall directly. They send transition
//! events to the worker owning their chain, and that worker is the only
//! writer of the chain's program, so recompiles for one chain never overlap.

use super::firewall::Firewall;
use super::rules::{self, ChainPlan, WeightedMark};
use super::{LinkId, LinkStatus, TrafficChain};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ChainEvent {
    Transition { link: LinkId, status: LinkStatus },
    /// Recompute now; the sender is notified once the program was applied
    Recompute { done: Option<oneshot::Sender<()>> },
}

/// A link belonging to a chain, with its live status
#[derive(Debug, Clone)]
pub struct ChainMember {
    pub link: LinkId,
    pub mark: u32,
    pub weight: u32,
    pub status: watch::Receiver<LinkStatus>,
}

#[derive(Debug, Clone)]
pub struct ChainHandle {
    events: mpsc::UnboundedSender<ChainEvent>,
}

impl ChainHandle {
    pub fn new(events: mpsc::UnboundedSender<ChainEvent>) -> Self {
        Self { events }
    }

    pub fn notify(&self, link: LinkId, status: LinkStatus) {
        if self.events.send(ChainEvent::Transition { link, status }).is_err() {
            debug!("Chain worker gone, dropping transition of {:?}", link);
        }
    }

    /// Request a recompute and wait until it has been applied
    pub async fn recompute(&self) {
        let (done, applied) = oneshot::channel();
        if self
            .events
            .send(ChainEvent::Recompute { done: Some(done) })
            .is_ok()
        {
            let _ = applied.await;
        }
    }
}

pub struct ChainWorker {
    chain: TrafficChain,
    members: Vec<ChainMember>,
    firewall: Arc<Firewall>,
    events: mpsc::UnboundedReceiver<ChainEvent>,
    last: Option<ChainPlan>,
}

impl ChainWorker {
    /// Spawn the worker; it runs until every handle is dropped
    pub fn spawn(
        chain: TrafficChain,
        members: Vec<ChainMember>,
        firewall: Arc<Firewall>,
    ) -> (ChainHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            chain,
            members,
            firewall,
            events: rx,
            last: None,
        };
        (ChainHandle::new(tx), tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            let mut waiters = Vec::new();
            self.absorb(event, &mut waiters);
            // Coalesce a burst of transitions into one recompute
            while let Ok(event) = self.events.try_recv() {
                self.absorb(event, &mut waiters);
            }

            self.recompute().await;
            for done in waiters {
                let _ = done.send(());
            }
        }
        debug!("Chain {} worker stopped", self.chain.name());
    }

    fn absorb(&self, event: ChainEvent, waiters: &mut Vec<oneshot::Sender<()>>) {
        match event {
            ChainEvent::Transition { link, status } => {
                debug!("Chain {}: {:?} is {}", self.chain.name(), link, status);
            }
            ChainEvent::Recompute { done } => waiters.extend(done),
        }
    }

    /// Currently available members, in declaration order
    fn available(&self) -> Vec<WeightedMark> {
        self.members
            .iter()
            .filter(|m| *m.status.borrow() == LinkStatus::Available)
            .map(|m| WeightedMark {
                mark: m.mark,
                weight: m.weight,
            })
            .collect()
    }

    async fn recompute(&mut self) {
        let plan = rules::plan(self.chain.when_empty, &self.available());
        let script = rules::render(self.firewall.table(), self.chain.name(), &plan);

        match self.firewall.apply_chain(script).await {
            Ok(()) => {
                if self.last.as_ref() != Some(&plan) {
                    info!("Chain {} programmed: {}", self.chain.name(), describe(&plan));
                }
                self.last = Some(plan);
            }
            Err(e) => {
                // Retried implicitly on the next transition
                warn!("Failed to program chain {}: {}", self.chain.name(), e);
                self.last = None;
            }
        }
    }
}

fn describe(plan: &ChainPlan) -> String {
    match plan {
        ChainPlan::Reject => "reject (no available links)".to_string(),
        ChainPlan::PassThrough => "pass-through (no available links)".to_string(),
        ChainPlan::Single { mark } => format!("all traffic -> {}", super::format_mark(*mark)),
        ChainPlan::Split(buckets) => buckets
            .iter()
            .map(|b| format!("{}-{} -> {}", b.start, b.end, super::format_mark(b.mark)))
            .collect::<Vec<_>>()
            .join(", "),
    }
}
