//! Broker runtime configuration.
//!
//! The broker persists nothing but its auth token, so configuration is
//! assembled from CLI flags with `TABZ_*` environment overrides — no config
//! file. Defaults are chosen so `tabz-broker` with no arguments serves the
//! browser extension on the loopback interface.

use std::path::PathBuf;

use serde::Serialize;

/// Default TCP port the broker listens on.
pub const DEFAULT_PORT: u16 = 8129;

/// Runtime configuration for one broker process.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerConfig {
    /// TCP port bound on 127.0.0.1.
    pub port: u16,
    /// Skip session recovery and tear down any surviving PTY children.
    pub force_clean: bool,
    /// Also adopt sessions named with legacy prefixes during recovery.
    pub legacy_prefixes: bool,
    /// Shell used for terminals that do not attach to the multiplexer.
    pub shell: String,
    /// Home directory used as the working-dir fallback.
    pub home_dir: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            force_clean: false,
            legacy_prefixes: false,
            shell: default_shell(),
            home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
        }
    }
}

impl BrokerConfig {
    /// Apply `TABZ_*` environment overrides on top of the current values.
    ///
    /// Recognized variables: `TABZ_PORT`, `TABZ_FORCE_CLEAN`,
    /// `TABZ_LEGACY_PREFIXES`, `TABZ_SHELL`. Unparseable values are
    /// ignored with a log line rather than failing startup.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("TABZ_PORT") {
            match port.parse() {
                Ok(p) => self.port = p,
                Err(_) => log::warn!("Ignoring unparseable TABZ_PORT={port}"),
            }
        }
        if env_flag("TABZ_FORCE_CLEAN") {
            self.force_clean = true;
        }
        if env_flag("TABZ_LEGACY_PREFIXES") {
            self.legacy_prefixes = true;
        }
        if let Ok(shell) = std::env::var("TABZ_SHELL") {
            if !shell.is_empty() {
                self.shell = shell;
            }
        }
    }

    /// The loopback socket address this broker binds.
    #[must_use]
    pub fn bind_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from(([127, 0, 0, 1], self.port))
    }
}

/// True when the variable is set to a truthy value (`1`, `true`, `yes`).
fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Pick the default interactive shell: `$SHELL` if set, else `bash`.
fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.force_clean);
        assert!(!config.legacy_prefixes);
        assert!(!config.shell.is_empty());
    }

    #[test]
    fn test_bind_addr_is_loopback() {
        let config = BrokerConfig::default();
        assert!(config.bind_addr().ip().is_loopback());
        assert_eq!(config.bind_addr().port(), DEFAULT_PORT);
    }
}
