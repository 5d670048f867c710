//! Client WebSocket protocol types.
//!
//! One JSON object per text frame, discriminated by the `type` field
//! (kebab-case), with camelCase payload fields. [`ClientMessage`] covers
//! everything the broker accepts; [`ServerMessage`] everything it produces.
//!
//! Parsing is two-stage at the connection layer: a frame that is not JSON
//! at all terminates the connection, while JSON that fails to match these
//! shapes only costs the sender a malformed-message tick and an `error`
//! frame.

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};

use crate::registry::TerminalRecord;

/// What a connection claims to be via `identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// The browser side-panel UI. Counts toward multi-window warnings.
    Sidebar,
    /// The dashboard page.
    WebPage,
    /// Anything that has not identified itself.
    Unknown,
}

impl ClientKind {
    /// Map the wire `clientType` string to a kind; unrecognized values
    /// stay `Unknown` rather than failing the message.
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value {
            "sidebar" => Self::Sidebar,
            "web-page" => Self::WebPage,
            _ => Self::Unknown,
        }
    }
}

/// Spawn request configuration, shared by the WebSocket `spawn` message
/// and `POST /api/spawn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnConfig {
    /// Opaque type tag; defaults to `bash`.
    #[serde(default = "default_terminal_type")]
    pub terminal_type: String,
    /// Human label for the tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Working directory; defaults to the user home.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Startup command injected after the shell warms up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Whether the terminal attaches to the multiplexer. Broker-owned
    /// terminals always do; the flag exists for parity with the client.
    #[serde(default = "default_true")]
    pub use_multiplexer: bool,
    /// Set by the extension's programmatic spawn path; carried, not acted on.
    #[serde(default)]
    pub is_chrome: bool,
}

fn default_terminal_type() -> String {
    "bash".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            terminal_type: default_terminal_type(),
            name: None,
            working_dir: None,
            command: None,
            use_multiplexer: true,
            is_chrome: false,
        }
    }
}

/// Nested payload form some clients use for `reconnect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPayload {
    /// Terminal to reconnect to.
    pub terminal_id: String,
}

/// Messages the broker accepts from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Tag the connection with a client kind.
    Identify {
        /// `sidebar`, `web-page`, …
        client_type: String,
    },
    /// Request the registry snapshot.
    ListTerminals,
    /// Orchestrate a spawn.
    Spawn {
        /// Spawn parameters.
        #[serde(default)]
        config: SpawnConfig,
        /// Dedup key; requests sharing one inside the window collapse.
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Raw terminal input. Never logged.
    Command {
        /// Target terminal.
        terminal_id: String,
        /// Input bytes as a string.
        command: String,
    },
    /// Send literal text to an arbitrary pane, bypassing the PTY.
    TargetedPaneSend {
        /// Fully qualified pane reference or session name.
        tmux_pane: String,
        /// Text to type.
        #[serde(default)]
        text: Option<String>,
        /// Follow up with `Enter` after the injection delay.
        #[serde(default)]
        send_enter: Option<bool>,
    },
    /// Same as `targeted-pane-send`, addressed by session name only.
    TmuxSessionSend {
        /// Session name (current pane).
        session_name: String,
        /// Text to type.
        #[serde(default)]
        text: Option<String>,
        /// Follow up with `Enter` after the injection delay.
        #[serde(default)]
        send_enter: Option<bool>,
    },
    /// Resize a terminal. Also grants ownership (legacy compatibility).
    Resize {
        /// Target terminal.
        terminal_id: String,
        /// New width.
        cols: u16,
        /// New height.
        rows: u16,
    },
    /// Non-destructive close: the PTY dies, the session survives.
    Detach {
        /// Target terminal.
        terminal_id: String,
    },
    /// Destructive close: PTY and multiplexer session both die.
    Close {
        /// Target terminal.
        terminal_id: String,
    },
    /// Acquire ownership of a terminal after a WebSocket reconnect.
    Reconnect {
        /// Terminal id, top-level form.
        #[serde(default)]
        terminal_id: Option<String>,
        /// Terminal id, nested form (`data.terminalId`).
        #[serde(default)]
        data: Option<ReconnectPayload>,
    },
    /// Request the broker-prefixed session list.
    QueryTmuxSessions,
    /// Update the `embedded` UI flag on a record.
    UpdateEmbedded {
        /// Target terminal.
        terminal_id: String,
        /// New flag value.
        embedded: bool,
    },
}

impl ClientMessage {
    /// The terminal id a `reconnect` addresses, accepting both forms.
    #[must_use]
    pub fn reconnect_terminal_id(&self) -> Option<&str> {
        match self {
            Self::Reconnect { terminal_id, data } => terminal_id
                .as_deref()
                .or_else(|| data.as_ref().map(|d| d.terminal_id.as_str())),
            _ => None,
        }
    }
}

/// Messages the broker produces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Registry snapshot; response to `list-terminals` and the recovery
    /// broadcast.
    Terminals {
        /// Broker-prefixed records.
        terminals: Vec<TerminalRecord>,
        /// Number of identified sidebar connections.
        connection_count: usize,
        /// Whether startup recovery has finished.
        recovery_complete: bool,
    },
    /// Broadcast after a successful spawn.
    TerminalSpawned {
        /// The new record.
        terminal: TerminalRecord,
        /// Echo of the spawn's dedup key for correlation.
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Point response when a spawn fails.
    SpawnError {
        /// Human-readable reason.
        error: String,
        /// Echo of the dedup key.
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Echo of the requested type tag.
        terminal_type: String,
        /// Echo of the requested name.
        terminal_name: String,
    },
    /// Owner-routed PTY output.
    TerminalOutput {
        /// Source terminal.
        terminal_id: String,
        /// Output bytes, lossily decoded.
        data: String,
    },
    /// Broadcast when a terminal is removed.
    TerminalClosed {
        /// The removed terminal.
        terminal_id: String,
    },
    /// Point response to a successful `reconnect`.
    TerminalReconnected {
        /// The reclaimed record.
        terminal: TerminalRecord,
    },
    /// Point response to a failed `reconnect`.
    ReconnectFailed {
        /// The terminal that could not be reclaimed.
        terminal_id: String,
        /// Human-readable reason.
        error: String,
    },
    /// Response to `query-tmux-sessions`.
    TmuxSessionsList {
        /// Broker-prefixed session names.
        sessions: Vec<String>,
    },
    /// Periodic telemetry; purely informational.
    MemoryStats {
        /// Resident set size in MiB.
        rss_mb: f64,
        /// Heap in MiB (best effort; mirrors rss when unavailable).
        heap_used_mb: f64,
        /// Active WebSocket connections.
        connection_count: usize,
        /// Live terminals.
        terminal_count: usize,
    },
    /// Validation failure for a structurally bad message.
    Error {
        /// What was wrong.
        message: String,
    },
}

impl ServerMessage {
    /// Serialize for the wire. Protocol types never fail to serialize; a
    /// broken invariant here is a bug worth surfacing loudly.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("[protocol] serialize failed: {e}");
            r#"{"type":"error","message":"internal serialization failure"}"#.to_string()
        })
    }
}
