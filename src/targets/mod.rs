//! Targets: sinks at the end of the update flow.

pub mod central_command;
