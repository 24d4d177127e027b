//! The long-lived units of the control plane.

pub mod control;
pub mod integrity;
pub mod netconf;
pub mod setmgr;
pub mod svc;
