//! The error taxonomy.
//!
//! Every failure a request can experience is one of these variants; request
//! handlers have exactly one exit path per kind.  The taxonomy is closed:
//! new failure modes get a new variant, not a stringly-typed escape hatch.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::token::{Resource, Verb};

//----------- ApiError ---------------------------------------------------------

/// A structured failure, returned to the requesting client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiError {
    /// The document does not parse.
    Parse {
        /// 1-based line of the failure.
        line: usize,
        /// 1-based column of the failure.
        column: usize,
        /// What the parser expected to see.
        expected: String,
    },

    /// The document parses but violates a model invariant.
    Validate {
        /// The path of the offending entity, e.g. `policy[lan->wan].rule[3]`.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The compiler cannot express a construct on this kernel.
    Capability {
        /// The missing kernel feature.
        feature: String,
    },

    /// The kernel rejected the ruleset swap; the prior generation is intact.
    Apply {
        /// The kernel's own description of the failure.
        kernel_reason: String,
    },

    /// The apply would sever the management path the requesting client is
    /// using; pass `override_lockout` to proceed anyway.
    Lockout {
        /// The management path that would be lost.
        path: String,
    },

    /// Another apply is in progress, or a pending apply awaits confirmation.
    ///
    /// Retriable.
    Conflict {
        /// What is holding the applier.
        reason: String,
    },

    /// The capability token does not grant the required permission.
    Forbidden {
        /// The required verb.
        verb: Verb,
        /// The required resource.
        resource: Resource,
    },

    /// The request's deadline passed before the work completed.
    Timeout,

    /// The subscriber's event queue overflowed and the subscription was
    /// dropped.
    Backpressure,

    /// An internal invariant was violated.  This is a bug; the daemon logs
    /// full context and lets the supervisor classify the failure.
    Internal {
        /// A terse description for the client.
        reason: String,
    },
}

impl ApiError {
    /// The process exit code a CLI should use for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Parse { .. } | Self::Validate { .. } | Self::Capability { .. } => 2,
            Self::Forbidden { .. } => 3,
            Self::Conflict { .. } => 4,
            Self::Timeout => 124,
            _ => 1,
        }
    }
}

impl std::error::Error for ApiError {}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse {
                line,
                column,
                expected,
            } => {
                write!(f, "parse error at line {line}, column {column}: expected {expected}")
            }
            Self::Validate { path, reason } => write!(f, "invalid configuration at {path}: {reason}"),
            Self::Capability { feature } => {
                write!(f, "this kernel does not support {feature}")
            }
            Self::Apply { kernel_reason } => {
                write!(f, "the kernel rejected the ruleset: {kernel_reason}")
            }
            Self::Lockout { path } => write!(
                f,
                "refusing to apply: it would sever your management path ({path}); \
                 pass override_lockout to proceed"
            ),
            Self::Conflict { reason } => write!(f, "another apply is in the way: {reason}"),
            Self::Forbidden { verb, resource } => {
                write!(f, "not permitted: {verb}:{resource} is required")
            }
            Self::Timeout => f.write_str("the request deadline passed"),
            Self::Backpressure => f.write_str("event queue overflowed; subscription dropped"),
            Self::Internal { reason } => write!(f, "internal error: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_mirror_shell_semantics() {
        let parse = ApiError::Parse {
            line: 1,
            column: 2,
            expected: "a table".into(),
        };
        assert_eq!(parse.exit_code(), 2);
        assert_eq!(
            ApiError::Forbidden {
                verb: Verb::Write,
                resource: Resource::Config
            }
            .exit_code(),
            3
        );
        assert_eq!(ApiError::Timeout.exit_code(), 124);
        assert_eq!(
            ApiError::Apply {
                kernel_reason: "x".into()
            }
            .exit_code(),
            1
        );
    }
}
