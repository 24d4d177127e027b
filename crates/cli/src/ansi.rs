//! ANSI escape codes for the CLI's output.
//!
//! Emitted through `anstream`, which strips them when the terminal does
//! not want color.

pub const RED: &str = "\x1b[0;31m";
pub const GREEN: &str = "\x1b[0;32m";
pub const YELLOW: &str = "\x1b[0;33m";
pub const GRAY: &str = "\x1b[38;5;248m";
pub const RESET: &str = "\x1b[0m";
