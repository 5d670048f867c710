//! Application-wide constants for tabz-broker.
//!
//! This module centralizes all magic numbers and configuration constants
//! to improve maintainability and discoverability. Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Naming**: session id prefixes
//! - **Timeouts**: multiplexer and shutdown deadlines
//! - **Windows**: debounce, dedup, grace, and rate-limit windows
//! - **Telemetry**: background broadcast intervals

use std::time::Duration;

// ============================================================================
// Naming
// ============================================================================

/// Prefix for every multiplexer session this broker owns.
///
/// Session names are `ctt-<slug>-<shortId>`; the recovery service only
/// re-adopts sessions carrying this prefix, so user sessions are never
/// touched.
pub const SESSION_PREFIX: &str = "ctt-";

/// Legacy session prefixes honored during recovery when the operator opts
/// in with `--legacy-prefixes`. Older releases named sessions with these.
pub const LEGACY_SESSION_PREFIXES: &[&str] = &["tt-", "terminal-tabs-"];

/// File name of the auth token artifact inside the OS temp directory.
pub const TOKEN_FILE_NAME: &str = "tabz-auth-token";

// ============================================================================
// Timeouts
// ============================================================================

/// Upper bound on any single multiplexer CLI invocation.
///
/// A hung tmux binary must never block a connection task; expiry surfaces
/// as a distinct error kind instead.
pub const MUX_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard deadline for graceful shutdown. If closing clients and PTYs has
/// not finished within this window the process force-exits.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// How long `cleanup_with_grace(force: false)` waits for PTY children to
/// exit on their own before killing them.
pub const PTY_EXIT_GRACE: Duration = Duration::from_millis(1500);

// ============================================================================
// Windows
// ============================================================================

/// Per-terminal resize debounce. A burst of resize requests applies only
/// the final `(cols, rows)` pair once this window has elapsed.
pub const RESIZE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Spawn request dedup window keyed on `requestId`. A second spawn with
/// the same id inside this window is dropped.
pub const SPAWN_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Grace period between a client disappearing and its terminals' PTYs
/// being detached. A `reconnect` inside this window cancels the teardown.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(4);

/// Sliding window for the malformed-message rate limit.
pub const MALFORMED_WINDOW: Duration = Duration::from_secs(60);

/// Maximum malformed messages tolerated per connection inside
/// [`MALFORMED_WINDOW`] before the connection is terminated.
pub const MAX_MALFORMED_PER_MINUTE: usize = 10;

/// Delay after spawn before an optional startup command is injected into
/// the shell. Shells need a moment to print their first prompt.
pub const COMMAND_WARMUP_DELAY: Duration = Duration::from_millis(1000);

/// Pause between injected command text and the `Enter` that runs it.
///
/// Hard contract: shorter delays make shells swallow the newline before
/// the full text is buffered on long prompts.
pub const COMMAND_ENTER_DELAY: Duration = Duration::from_millis(300);

/// Delay before a `connecting` terminal is promoted to `connected` when
/// no output has arrived yet.
pub const CONNECT_WARMUP: Duration = Duration::from_millis(1500);

/// Delay before the recovery service enumerates surviving sessions, so
/// early clients have time to connect and observe the broadcast.
pub const RECOVERY_STARTUP_DELAY: Duration = Duration::from_millis(2500);

// ============================================================================
// Telemetry & sweeps
// ============================================================================

/// Interval between `memory-stats` broadcasts to all clients.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between ownership-map sweeps for dead clients.
pub const OWNERSHIP_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// Capacity of each client's outbound message queue. A client that lets
/// this many frames pile up is dropped rather than allowed to stall PTY
/// output routing.
pub const CLIENT_OUTBOUND_BUFFER: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_are_reasonable() {
        // Dedup must be at least the 5 seconds the protocol promises
        assert!(SPAWN_DEDUP_WINDOW >= Duration::from_secs(5));

        // Grace must be long enough for a browser reload to reconnect
        assert!(DISCONNECT_GRACE >= Duration::from_secs(1));
        assert!(DISCONNECT_GRACE <= Duration::from_secs(30));

        // Enter delay is a hard contract at roughly 300 ms
        assert_eq!(COMMAND_ENTER_DELAY, Duration::from_millis(300));
    }

    #[test]
    fn test_prefixes() {
        assert!(SESSION_PREFIX.ends_with('-'));
        for p in LEGACY_SESSION_PREFIXES {
            assert!(p.ends_with('-'));
            assert_ne!(*p, SESSION_PREFIX);
        }
    }
}
