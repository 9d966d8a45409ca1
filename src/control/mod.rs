//! Operator control channel
//!
//! Authenticated WebSocket surface of the supervisor:
//! - `auth`:      HS256 bearer token verification
//! - `broadcast`: fan-out of state, node list and notifications
//! - `channel`:   socket server, handshake, per-socket loop
//! - `dispatch`:  command table
//!
//! WIRE:
//! - Every frame in both directions is `{ "event": name, "payload": ... }`
//! - The first client frame must be `authenticate { token }`, within
//!   `auth_timeout_secs`

pub mod auth;
pub mod broadcast;
pub mod channel;
pub mod dispatch;

pub use auth::{AuthError, Claims, issue_token, verify_token};
pub use broadcast::{ControlBroadcaster, ControlPush};
pub use channel::{ControlChannel, OperatorSession};
