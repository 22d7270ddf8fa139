//! # Meshgate - Field Gateway for Meshtastic Repeaters
//!
//! Meshgate runs next to a Meshtastic repeater node and gives it a little intelligence: it
//! announces the site on a schedule without overrunning the regulatory airtime budget, keeps a
//! durable record of every node the mesh has carried, and answers a handful of slash commands.
//!
//! ## Features
//!
//! - **Duty-Cycle-Aware Beacons**: periodic broadcast held back while our transmit duty cycle is above 3%.
//! - **Emergency Preemption**: an emergency message replaces the beacon and ignores the airtime ceiling.
//! - **Node Registry**: sled-backed copy of the radio's node table plus an activity log of every packet heard.
//! - **Commands**: `/info`, `/signal`, `/users`, `/distance`, `/admin` answered directly to the sender.
//! - **Live Configuration**: broadcast and emergency toggles are picked up on the next tick.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshgate::config::{Config, ConfigHandle};
//! use meshgate::gateway::Gateway;
//! use meshgate::meshtastic::DisconnectedRadio;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigHandle::new(Config::load("meshgate.toml").await?);
//!     let gateway = Arc::new(Gateway::open(config, Arc::new(DisconnectedRadio))?);
//!     let (_packets, inbound) = tokio::sync::mpsc::unbounded_channel();
//!     gateway.run(inbound).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - scheduler, presence tracker, command dispatcher, shared state and wiring
//! - [`meshtastic`] - radio collaborator contract and test doubles
//! - [`storage`] - durable node registry and activity log
//! - [`config`] - configuration file, validation and live-update handle
//! - [`metrics`] - process counters
//! - [`logutil`] - log line helpers

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod storage;
