//! revtun CLI library
//!
//! Daemon hosting, IPC plumbing and configuration for the `revtun` binary.

#[cfg(not(unix))]
compile_error!("revtun supervises ssh processes over Unix sockets and only builds on Unix");

pub mod config;
pub mod daemon;
pub mod ipc;
