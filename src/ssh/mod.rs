//! Embedded SSH server.
//!
//! Accepts SSH connections from git clients, authenticates them by public
//! key against an authorized-keys file, and runs each `exec` request through
//! the command gateway.

pub mod keys;
pub mod server;
pub mod session;

pub use server::start_ssh_server;
