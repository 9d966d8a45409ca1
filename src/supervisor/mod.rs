//! Supervisor role
//!
//! - `node`:       one fleet member and its RemoteClient
//! - `history`:    bounded fleet price history
//! - `controller`: node registry, sweep loop, fleet aggregation and the
//!   operations the control channel dispatches to

pub mod controller;
pub mod history;
pub mod node;

pub use controller::{FleetChange, NodeOp, SupervisorController, SupervisorError, SupervisorSettings, SweepOutcome};
pub use history::FleetPriceHistory;
pub use node::{LightNode, RemoteNode};
