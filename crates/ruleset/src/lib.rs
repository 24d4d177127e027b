//! The object graph and ruleset compiler for Zonewall.
//!
//! This crate is the pure heart of the firewall: it defines the canonical
//! in-memory representation of a validated configuration (the *object
//! graph*) and lowers it into a concrete nftables ruleset.  It provides:
//!
//! - The entity model: zones, interfaces, policies, rules, NAT, address
//!   sets, routes and route groups.
//! - The [`Graph`]: an ordered, label-keyed arena over those entities with a
//!   stable iteration order.
//! - [`Graph::diff`]: a component-classified change set between two
//!   generations, consumed by the reloaders.
//! - [`Graph::fingerprint`]: a stable, order-independent digest; equal
//!   fingerprints guarantee byte-identical compiled output.
//! - [`compile`]: the lowering to nftables text plus a manifest of the
//!   dynamic sets the ruleset references.
//!
//! Everything in this crate is deliberately free of I/O and clocks.  Turning
//! a [`CompiledRuleset`] into kernel state is the daemon's job.

pub use crate::caps::{Capabilities, Feature};
pub use crate::compile::{compile, CompileError, CompiledRuleset, SetManifest};
pub use crate::diff::{ChangeSet, ServiceChange, SetChanges};
pub use crate::graph::{Fingerprint, Graph};

pub mod caps;
pub mod compile;
pub mod diff;
mod emit;
pub mod graph;
pub mod model;
