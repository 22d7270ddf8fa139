//! # Gateway Core
//!
//! The four cooperating components of the field gateway plus the [`server::Gateway`] that wires
//! them together:
//!
//! - [`shared`] - Shared State Store: counter, weather, position and message log slots
//! - [`scheduler`] - duty-cycle-aware beacon scheduler with emergency preemption
//! - [`presence`] - durable node registry sync and "recently heard" queries
//! - [`commands`] - `/info`, `/signal`, `/users`, `/distance`, `/admin`
//!
//! No component reaches another through a global; every handle is passed in at construction.

pub mod commands;
pub mod geo;
pub mod presence;
pub mod scheduler;
pub mod server;
pub mod shared;

pub use commands::{CommandDispatcher, GatewayCommand};
pub use presence::PresenceTracker;
pub use scheduler::{BroadcastMode, BroadcastScheduler, SchedulerStatus, TickOutcome};
pub use server::Gateway;
pub use shared::SharedState;
