//! Git command wrappers used by the repository store.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.

pub mod commands;

pub use commands::{git_checkout_tree, git_for_each_ref, git_most_recent_branch};
