//! Command-line interface
//!
//! Argument definitions and command handlers for the `knockgate` binary.

pub mod args;
pub mod commands;
