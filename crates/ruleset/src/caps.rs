//! Kernel capability description.
//!
//! The compiler is pure and never talks to the kernel; the daemon probes the
//! running kernel once and passes the result in.  When the document uses a
//! construct the kernel cannot express, compilation refuses rather than
//! silently emitting a weaker ruleset.

use std::fmt;

use serde::{Deserialize, Serialize};

//----------- Capabilities -----------------------------------------------------

/// What the running kernel's nftables implementation supports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `meta hour`/`meta day` matches for time-of-day rules.
    pub time_windows: bool,

    /// `limit rate` expressions.
    pub rate_limit: bool,

    /// Named counter objects.
    pub named_counters: bool,
}

impl Capabilities {
    /// A kernel supporting everything the compiler can emit.
    pub const FULL: Self = Self {
        time_windows: true,
        rate_limit: true,
        named_counters: true,
    };
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::FULL
    }
}

//----------- Feature ----------------------------------------------------------

/// A kernel feature the compiler may depend on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    TimeWindows,
    RateLimit,
    NamedCounters,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TimeWindows => "time-of-day matches",
            Self::RateLimit => "rate limits",
            Self::NamedCounters => "named counters",
        })
    }
}
