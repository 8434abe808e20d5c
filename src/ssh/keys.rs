//! Public-key identity: the authorized-keys file and key fingerprints.
//!
//! The file uses the OpenSSH `authorized_keys` line format.  The comment
//! field names the user the key belongs to:
//!
//! ```text
//! ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA... alice
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Fingerprint -> username.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    users: HashMap<String, String>,
}

impl AuthorizedKeys {
    /// Parse file contents.  Malformed lines are logged and skipped.
    pub fn parse(contents: &str) -> Self {
        let mut users = HashMap::new();

        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(_key_type), Some(blob), Some(user)) =
                (fields.next(), fields.next(), fields.next())
            else {
                warn!(line = idx + 1, "authorized key without a username; skipping");
                continue;
            };

            if let Err(e) = russh_keys::parse_public_key_base64(blob) {
                warn!(line = idx + 1, error = %e, "unparseable authorized key; skipping");
                continue;
            }
            let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(blob) else {
                warn!(line = idx + 1, "authorized key is not valid base64; skipping");
                continue;
            };

            users.insert(fingerprint_of_blob(&raw), user.to_string());
        }

        Self { users }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read authorized keys: {}", path.display()))?;
        Ok(Self::parse(&contents))
    }

    /// User owning the key with this fingerprint.
    pub fn user_for(&self, fingerprint: &str) -> Option<&str> {
        self.users.get(fingerprint).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Fingerprint helper
// ---------------------------------------------------------------------------

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used by
/// `ssh-keygen -l`).
pub fn fingerprint_of(key: &PublicKey) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64().as_bytes())
        .unwrap_or_default();
    fingerprint_of_blob(&blob)
}

fn fingerprint_of_blob(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}
