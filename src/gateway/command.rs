//! Parser for the command string an SSH client asks to execute.
//!
//! Exactly two forms are accepted:
//!
//! ```text
//! git-upload-pack '<repo>'
//! git-receive-pack '<repo>'
//! ```
//!
//! The argument must be single-quoted, must not contain a quote, and nothing
//! may follow it.  Anything else is rejected; there is no shell fallback.

use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// The two git services the gateway exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `git-upload-pack`: clone and fetch.
    Fetch,
    /// `git-receive-pack`: push.
    Push,
}

impl Operation {
    /// Program name as sent by git clients.
    pub fn program(self) -> &'static str {
        match self {
            Self::Fetch => "git-upload-pack",
            Self::Push => "git-receive-pack",
        }
    }

    /// `git` subcommand implementing the service.
    pub fn service(self) -> &'static str {
        match self {
            Self::Fetch => "upload-pack",
            Self::Push => "receive-pack",
        }
    }

    fn from_program(program: &str) -> Option<Self> {
        match program {
            "git-upload-pack" => Some(Self::Fetch),
            "git-receive-pack" => Some(Self::Push),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// A parsed, not yet authorized, git command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    pub operation: Operation,
    /// Raw repository argument, unquoted but otherwise untouched.
    pub repo: String,
}

impl FromStr for GitCommand {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || GatewayError::InvalidCommand(raw.to_string());

        let (program, rest) = raw
            .split_once(|c: char| c == ' ' || c == '\t')
            .ok_or_else(invalid)?;
        let operation = Operation::from_program(program).ok_or_else(invalid)?;

        let quoted = rest.trim_start_matches([' ', '\t']);
        let repo = quoted
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .ok_or_else(invalid)?;

        if repo.is_empty() || repo.contains('\'') {
            return Err(invalid());
        }

        Ok(Self {
            operation,
            repo: repo.to_string(),
        })
    }
}
