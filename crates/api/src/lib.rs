//! Control-channel message definitions for Zonewall.
//!
//! The control plane (root) and its clients (the operator CLI and the
//! unprivileged API plane) speak a small request/response protocol over a
//! local stream socket.  This crate defines that protocol: the framed
//! envelope, the closed operation taxonomy, the closed error taxonomy, the
//! capability tokens authorizing each operation, and the domain events
//! delivered to subscribers.
//!
//! Nothing here performs I/O; framing lives with the daemon and the client.

pub use crate::error::ApiError;
pub use crate::event::Event;
pub use crate::msg::{Op, OpResult, Request, Response, ResponseBody};
pub use crate::token::{CapabilityToken, Permission, Resource, Verb};

pub mod codec;
pub mod error;
pub mod event;
pub mod msg;
pub mod token;

/// The control socket's file name under the run directory.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";

/// The placeholder substituted for sensitive fields before configuration
/// leaves the control plane.
pub const REDACTED: &str = "<redacted>";
