//! `knockgate` - port-knocking access gate
//!
//! Listens on a set of knock ports and opens a protected port, through a
//! firewall gateway, for any source address that connects to the knock ports
//! in the configured order within the configured window.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod firewall;
pub mod knock;
pub mod listener;
pub mod observability;
pub mod server;
