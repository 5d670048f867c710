//! Terminal records and session naming.
//!
//! A [`TerminalRecord`] is the registry's authoritative description of one
//! terminal. For multiplexer-backed terminals the record id doubles as the
//! session name, always shaped `ctt-<slug>-<shortId>` so the recovery
//! service can tell broker sessions apart from user sessions.

// Rust guideline compliant 2026-02

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{LEGACY_SESSION_PREFIXES, SESSION_PREFIX};

/// Lifecycle state of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    /// Created; waiting for the first PTY output or the warmup timer.
    Connecting,
    /// Live and streaming.
    Connected,
    /// Owner vanished; the grace timer is running.
    Disconnecting,
    /// Grace expired; teardown is imminent.
    Disconnected,
    /// Removed (or about to be removed) from the registry.
    Closed,
}

/// Authoritative description of one terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
    /// Stable identifier, `ctt-<slug>-<shortId>`. Equals the multiplexer
    /// session name for sessions this broker owns.
    pub id: String,
    /// Human label shown in the tab UI.
    pub name: String,
    /// Opaque type tag; selects the advertised environment and nothing else.
    pub terminal_type: String,
    /// Absolute path the PTY was spawned in. Recovery may rewrite this to
    /// the session's reported pane path.
    pub working_dir: String,
    /// Optional startup command injected after the shell warms up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Whether the PTY attaches to a multiplexer session.
    pub use_multiplexer: bool,
    /// Multiplexer session name; equals `id` for broker-owned sessions.
    pub session_name: String,
    /// Lifecycle state.
    pub state: TerminalState,
    /// Last acknowledged dimensions; absent before the first resize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Last acknowledged dimensions; absent before the first resize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent output, input, or lifecycle change.
    pub last_activity: DateTime<Utc>,
    /// Host platform tag; `local` is the only implemented value.
    pub platform: String,
    /// UI flag carried for `update-embedded`; the broker stores and echoes
    /// it without attaching behavior.
    #[serde(default)]
    pub embedded: bool,
}

impl TerminalRecord {
    /// Create a record in the `connecting` state.
    #[must_use]
    pub fn new(
        id: String,
        name: String,
        terminal_type: String,
        working_dir: String,
        command: Option<String>,
        session_name: String,
        use_multiplexer: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            terminal_type,
            working_dir,
            command,
            use_multiplexer,
            session_name,
            state: TerminalState::Connecting,
            cols: None,
            rows: None,
            created_at: now,
            last_activity: now,
            platform: "local".to_string(),
            embedded: false,
        }
    }

    /// Bump the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Generate a fresh broker-owned terminal id: `ctt-<slug>-<shortId>`.
#[must_use]
pub fn new_terminal_id(name: &str) -> String {
    format!("{}{}-{}", SESSION_PREFIX, slugify(name), short_id())
}

/// Reduce a display name to a session-safe slug.
///
/// Lowercase alphanumerics with single dashes; empty input becomes `term`.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    let mut slug: String = slug.chars().take(24).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "term".to_string()
    } else {
        slug
    }
}

/// Random 8-character lowercase hex suffix.
fn short_id() -> String {
    let mut rng = rand::rng();
    (0..8)
        .map(|_| {
            let v: u8 = rng.random_range(0..16);
            char::from_digit(u32::from(v), 16).unwrap_or('0')
        })
        .collect()
}

/// Whether a session name carries the broker prefix (optionally including
/// the legacy prefixes older releases used).
#[must_use]
pub fn has_broker_prefix(session_name: &str, include_legacy: bool) -> bool {
    if session_name.starts_with(SESSION_PREFIX) {
        return true;
    }
    include_legacy
        && LEGACY_SESSION_PREFIXES
            .iter()
            .any(|p| session_name.starts_with(p))
}

/// Derive a display name from a recovered session name.
///
/// `ctt-build-logs-ab12cd34` becomes `build logs`; the prefix and the
/// trailing short id are dropped when present.
#[must_use]
pub fn display_name_from_session(session_name: &str) -> String {
    let stripped = session_name
        .strip_prefix(SESSION_PREFIX)
        .or_else(|| {
            LEGACY_SESSION_PREFIXES
                .iter()
                .find_map(|p| session_name.strip_prefix(p))
        })
        .unwrap_or(session_name);

    let parts: Vec<&str> = stripped.split('-').collect();
    let words: &[&str] = match parts.split_last() {
        Some((last, rest))
            if !rest.is_empty()
                && last.len() == 8
                && last.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            rest
        }
        _ => &parts,
    };
    let name = words.join(" ").trim().to_string();
    if name.is_empty() {
        stripped.to_string()
    } else {
        name
    }
}
