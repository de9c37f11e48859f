//! shieldlink - multi-uplink traffic steering for router-class hosts
//!
//! Keeps VPN and WAN uplinks under health observation, splits new flows
//! across the healthy ones by weight, and lets traffic for configured
//! domains bypass the VPN by harvesting addresses from DNS answers.
//!
//! # Architecture
//!
//! - `config`: Configuration file handling (TOML)
//! - `platform`: Kernel command execution (`nft`, `ip`) behind an effector
//! - `steering`: Link health, weighted split compilation, policy routing
//! - `dns`: Forwarding DNS relay and the bypass address cache
//! - `service`: Start-up, signal handling and ordered shutdown
//!
//! # Usage
//!
//! ```bash
//! shieldlink init
//! sudo shieldlink run
//! ```

pub mod config;
pub mod dns;
pub mod platform;
pub mod service;
pub mod steering;

pub use config::Config;
pub use service::{RunOptions, Service, ServiceError};
pub use steering::SteeringEngine;
