//! Process-wide bearer token.
//!
//! A fresh 32-byte token is generated from a CSPRNG on every start and
//! written hex-encoded to a well-known file in the OS temp directory with
//! owner-only permissions, where same-machine consumers (the browser
//! extension's launcher page, the tool server) pick it up. Tokens are
//! deliberately not persisted across restarts: a stale page must not be
//! able to reconnect to a new broker instance.
//!
//! The in-memory token is authoritative; a failed file write is logged and
//! tolerated. The token value itself is never logged.

// Rust guideline compliant 2026-02

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use data_encoding::HEXLOWER;
use rand::RngCore;

use crate::constants::TOKEN_FILE_NAME;

/// Number of random bytes behind the token (64 hex chars on the wire).
const TOKEN_BYTES: usize = 32;

/// Holds the process token and the path of its on-disk copy.
#[derive(Clone)]
pub struct TokenStore {
    token: String,
    path: PathBuf,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the token value, even in debug output.
        f.debug_struct("TokenStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Generate a fresh token and write it to the default location.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_at(std::env::temp_dir().join(TOKEN_FILE_NAME))
    }

    /// Generate a fresh token and write it to `path`.
    #[must_use]
    pub fn generate_at(path: PathBuf) -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let token = HEXLOWER.encode(&bytes);

        let store = Self { token, path };
        if let Err(e) = store.write_file() {
            log::warn!(
                "[auth] could not write token file {}: {e:#}",
                store.path.display()
            );
        } else {
            log::info!("[auth] token written to {}", store.path.display());
        }
        store
    }

    /// Write the token file with mode `0o600`, replacing any previous one.
    fn write_file(&self) -> Result<()> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        // The file may predate this process with looser permissions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .context("set token file permissions")?;
        }
        file.write_all(self.token.as_bytes()).context("write token")?;
        Ok(())
    }

    /// The token value for embedding in responses.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Where the on-disk copy lives.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Validate a presented token.
    ///
    /// Full-string equality: a truncated or padded candidate never passes.
    #[must_use]
    pub fn validate(&self, candidate: &str) -> bool {
        candidate == self.token
    }

    /// Remove the on-disk copy (shutdown hygiene).
    pub fn remove_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::debug!("[auth] could not remove token file: {e}");
            }
        }
    }
}
