//! FluxLoRA command line front end
//!
//! Wires the `fluxlora` library to the outside world:
//! - the `fluxlora` binary and its subcommands
//! - tool settings layered from file and environment
//! - the HTTP image server

pub mod cli;

/// Current version of the FluxLoRA CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
