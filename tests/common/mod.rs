//! Simulated kernel shared by the integration tests.
//!
//! Interprets the `ip` and `nft` commands the crate issues and keeps the
//! resulting routing, rule and firewall state, failing the same way the real
//! tools do when asked to remove something that is not there.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use shieldlink::platform::{Effector, PlatformError, SystemCommand};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    /// (table, device) default routes
    pub routes: BTreeSet<(String, String)>,
    /// (mark, table) rules; duplicates are allowed like the real rule list
    pub rules: Vec<(String, String)>,
    pub table: bool,
    pub sets: BTreeMap<String, BTreeSet<String>>,
    /// Last program applied to each chain
    pub chains: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct FakeKernel {
    state: Mutex<KernelState>,
    failing: Mutex<Vec<String>>,
    log: Mutex<Vec<String>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: KernelState) -> Self {
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub fn state(&self) -> KernelState {
        self.state.lock().clone()
    }

    pub fn set(&self, name: &str) -> BTreeSet<String> {
        self.state.lock().sets.get(name).cloned().unwrap_or_default()
    }

    pub fn chain(&self, name: &str) -> Option<String> {
        self.state.lock().chains.get(name).cloned()
    }

    pub fn fail_matching(&self, needle: &str) {
        self.failing.lock().push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn apply(&self, command: &SystemCommand) -> Result<(), String> {
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        let mut state = self.state.lock();

        match (command.program.as_str(), args.as_slice()) {
            ("ip", ["route", "replace", "default", "dev", dev, "table", table]) => {
                state.routes.insert((table.to_string(), dev.to_string()));
            }
            ("ip", ["route", "del", "default", "dev", dev, "table", table]) => {
                if !state.routes.remove(&(table.to_string(), dev.to_string())) {
                    return Err("RTNETLINK answers: No such process".to_string());
                }
            }
            ("ip", ["rule", "add", "fwmark", mark, "lookup", table]) => {
                state.rules.push((mark.to_string(), table.to_string()));
            }
            ("ip", ["rule", "del", "fwmark", mark, "lookup", table]) => {
                let key = (mark.to_string(), table.to_string());
                match state.rules.iter().position(|r| *r == key) {
                    Some(idx) => {
                        state.rules.remove(idx);
                    }
                    None => return Err("RTNETLINK answers: No such file or directory".to_string()),
                }
            }
            ("nft", ["-f", "-"]) => {
                let script = command.stdin.clone().unwrap_or_default();
                if script.contains("delete table ip shieldlink") {
                    state.table = true;
                    state.chains.clear();
                    state.sets.clear();
                    state.sets.insert("bypass_domain_ip".to_string(), BTreeSet::new());
                    state.sets.insert("bypass_static".to_string(), BTreeSet::new());
                } else if let Some(chain) = script
                    .lines()
                    .next()
                    .and_then(|l| l.strip_prefix("flush chain ip shieldlink "))
                {
                    if !state.table {
                        return Err("Error: No such file or directory".to_string());
                    }
                    state.chains.insert(chain.to_string(), script.clone());
                } else {
                    return Err(format!("unsupported script: {}", script));
                }
            }
            ("nft", [verb @ ("add" | "delete"), "element", "ip", "shieldlink", set, list]) => {
                if !state.table {
                    return Err("Error: No such file or directory".to_string());
                }
                let elements: Vec<String> = list
                    .trim_matches(|c| c == '{' || c == '}' || c == ' ')
                    .split(", ")
                    .map(str::to_string)
                    .collect();
                let members = state.sets.entry(set.to_string()).or_default();
                if *verb == "delete" && elements.iter().any(|e| !members.contains(e)) {
                    return Err("Error: Could not process rule: No such file or directory".to_string());
                }
                for element in elements {
                    if *verb == "add" {
                        members.insert(element);
                    } else {
                        members.remove(&element);
                    }
                }
            }
            ("nft", ["flush", "set", "ip", "shieldlink", set]) => {
                if !state.table {
                    return Err("Error: No such file or directory".to_string());
                }
                state.sets.entry(set.to_string()).or_default().clear();
            }
            ("nft", ["delete", "table", "ip", "shieldlink"]) => {
                if !state.table {
                    return Err("Error: No such file or directory".to_string());
                }
                state.table = false;
                state.sets.clear();
                state.chains.clear();
            }
            _ => return Err(format!("unsupported command: {}", command)),
        }
        Ok(())
    }
}

#[async_trait]
impl Effector for FakeKernel {
    async fn run(&self, command: &SystemCommand) -> Result<String, PlatformError> {
        let described = command.describe();
        self.log.lock().push(described.clone());

        if self.failing.lock().iter().any(|n| described.contains(n)) {
            return Err(PlatformError::CommandFailed {
                command: described,
                output: "injected failure".to_string(),
            });
        }
        self.apply(command)
            .map(|()| String::new())
            .map_err(|output| PlatformError::CommandFailed {
                command: command.to_string(),
                output,
            })
    }
}
