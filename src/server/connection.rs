//! WebSocket connection handling.
//!
//! Each accepted socket gets a bounded outbound queue and two halves: a
//! writer task draining the queue into the socket, and the read loop that
//! parses and dispatches inbound frames. The [`ConnectionManager`] tracks
//! every live connection so the router and broadcasts can reach them.
//!
//! # Teardown
//!
//! When a socket closes (client vanished, rate limit, shutdown), the
//! connection is dropped from every ownership set; terminals left with no
//! owner at all enter the registry's disconnect grace period, so a browser
//! reload has a few seconds to reclaim them before their PTYs detach.
//!
//! # Rate limiting
//!
//! Structurally invalid messages cost a tick in a sliding one-minute
//! window; exceeding [`MAX_MALFORMED_PER_MINUTE`] terminates the
//! connection. A frame that is not JSON at all terminates it immediately —
//! a real client never produces one.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::constants::{
    CLIENT_OUTBOUND_BUFFER, COMMAND_ENTER_DELAY, MALFORMED_WINDOW, MAX_MALFORMED_PER_MINUTE,
};
use crate::server::protocol::{ClientKind, ClientMessage, ServerMessage};
use crate::server::Broker;

/// Connection identifier, unique for the process lifetime.
pub type ConnId = u64;

/// Handle to one live connection: identity, kind, and outbound queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Connection id.
    pub id: ConnId,
    /// What the connection identified itself as.
    pub kind: ClientKind,
    tx: mpsc::Sender<String>,
}

impl ClientHandle {
    /// Queue a serialized frame without waiting. `false` means the client
    /// is dead (queue full or writer gone) and should be pruned.
    #[must_use]
    pub fn try_send(&self, frame: String) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

/// Registry of live WebSocket connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnId, ClientHandle>>,
}

impl ConnectionManager {
    /// Empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back its id.
    pub fn register(&self, tx: mpsc::Sender<String>, kind: ClientKind) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut connections = self.connections.lock().expect("connections lock poisoned");
        connections.insert(id, ClientHandle { id, kind, tx });
        id
    }

    /// Update a connection's identified kind.
    pub fn set_kind(&self, id: ConnId, kind: ClientKind) {
        let mut connections = self.connections.lock().expect("connections lock poisoned");
        if let Some(handle) = connections.get_mut(&id) {
            handle.kind = kind;
        }
    }

    /// Look up a connection's handle.
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<ClientHandle> {
        let connections = self.connections.lock().expect("connections lock poisoned");
        connections.get(&id).cloned()
    }

    /// Drop a connection.
    pub fn remove(&self, id: ConnId) {
        let mut connections = self.connections.lock().expect("connections lock poisoned");
        connections.remove(&id);
    }

    /// Whether a connection is still live.
    #[must_use]
    pub fn contains(&self, id: ConnId) -> bool {
        let connections = self.connections.lock().expect("connections lock poisoned");
        connections.contains_key(&id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .len()
    }

    /// Number of connections identified as the sidebar UI.
    #[must_use]
    pub fn sidebar_count(&self) -> usize {
        let connections = self.connections.lock().expect("connections lock poisoned");
        connections
            .values()
            .filter(|h| h.kind == ClientKind::Sidebar)
            .count()
    }

    /// Serialize once and queue to every live connection, pruning any
    /// whose queue rejects the frame.
    pub fn broadcast(&self, message: &ServerMessage) {
        let frame = message.to_json();
        let targets: Vec<ClientHandle> = {
            let connections = self.connections.lock().expect("connections lock poisoned");
            connections.values().cloned().collect()
        };
        for handle in targets {
            if !handle.try_send(frame.clone()) {
                log::warn!("[conn] dropping unresponsive client {}", handle.id);
                self.remove(handle.id);
            }
        }
    }

    /// Queue one message to one connection. `false` when it is gone.
    pub fn send_to(&self, id: ConnId, message: &ServerMessage) -> bool {
        match self.get(id) {
            Some(handle) => handle.try_send(message.to_json()),
            None => false,
        }
    }
}

/// Sliding-window counter for malformed messages.
#[derive(Debug, Default)]
pub struct MalformedWindow {
    ticks: VecDeque<Instant>,
}

impl MalformedWindow {
    /// Record one malformed message at `now`; returns `true` when the
    /// connection has exceeded its budget and must be terminated.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(front) = self.ticks.front() {
            if now.duration_since(*front) > MALFORMED_WINDOW {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
        self.ticks.push_back(now);
        self.ticks.len() > MAX_MALFORMED_PER_MINUTE
    }
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, serde::Deserialize)]
pub struct WsQuery {
    /// Bearer token; must match the process token.
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket upgrade handler for `/`.
///
/// The token is checked before any message handling; a bad one gets a
/// policy-violation close (1008) right after the upgrade completes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(broker): State<Arc<Broker>>,
) -> Response {
    let authorized = query
        .token
        .as_deref()
        .is_some_and(|t| broker.auth.validate(t));

    if authorized {
        ws.on_upgrade(move |socket| handle_socket(socket, broker))
    } else {
        log::warn!("[conn] rejecting WebSocket with invalid token");
        ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: Utf8Bytes::from_static("invalid token"),
                })))
                .await;
        })
    }
}

/// Drive one authenticated connection to completion.
async fn handle_socket(socket: WebSocket, broker: Arc<Broker>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_OUTBOUND_BUFFER);
    let conn_id = broker.connections.register(tx, ClientKind::Unknown);
    log::info!("[conn] client {conn_id} connected");

    // Immediate telemetry snapshot so the UI can render health at once.
    let _ = broker
        .connections
        .send_to(conn_id, &broker.memory_stats_message());

    // Writer half: drain the queue into the socket until the queue closes
    // or shutdown asks for a clean 1000 close.
    let mut shutdown_rx = broker.subscribe_shutdown();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: Utf8Bytes::from_static("shutting down"),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut malformed = MalformedWindow::default();
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if !handle_frame(&broker, conn_id, text.as_str(), &mut malformed).await {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Binary frames are not part of the protocol; ping/pong is
            // handled by the transport.
            Ok(_) => {}
        }
    }

    writer.abort();
    teardown(&broker, conn_id).await;
    log::info!("[conn] client {conn_id} disconnected");
}

/// Parse and dispatch one text frame. Returns `false` when the connection
/// must be terminated.
async fn handle_frame(
    broker: &Arc<Broker>,
    conn_id: ConnId,
    text: &str,
    malformed: &mut MalformedWindow,
) -> bool {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            // Not JSON at all: tick and terminate outright.
            malformed.record(Instant::now());
            log::warn!("[conn] client {conn_id} sent unparseable frame: {e}");
            return false;
        }
    };

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => {
            dispatch(broker, conn_id, message).await;
            true
        }
        Err(e) => {
            let exceeded = malformed.record(Instant::now());
            if exceeded {
                log::warn!("[conn] client {conn_id} exceeded malformed-message budget");
                return false;
            }
            let _ = broker.connections.send_to(
                conn_id,
                &ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                },
            );
            true
        }
    }
}

/// Dispatch one well-formed client message.
async fn dispatch(broker: &Arc<Broker>, conn_id: ConnId, message: ClientMessage) {
    match message {
        ClientMessage::Identify { client_type } => {
            let kind = ClientKind::from_wire(&client_type);
            broker.connections.set_kind(conn_id, kind);
            if kind == ClientKind::Sidebar && broker.connections.sidebar_count() > 1 {
                log::warn!(
                    "[conn] {} sidebar windows connected",
                    broker.connections.sidebar_count()
                );
            }
        }

        ClientMessage::ListTerminals => {
            let _ = broker
                .connections
                .send_to(conn_id, &broker.terminals_message());
        }

        ClientMessage::Spawn { config, request_id } => {
            broker
                .spawner
                .spawn_from_client(broker, Some(conn_id), config, request_id)
                .await;
        }

        ClientMessage::Command {
            terminal_id,
            command,
        } => {
            // Terminal input: forwarded, never logged.
            broker.registry.send_command(&terminal_id, command.as_bytes());
        }

        ClientMessage::TargetedPaneSend {
            tmux_pane,
            text,
            send_enter,
        } => {
            send_to_pane(broker, tmux_pane, text, send_enter);
        }

        ClientMessage::TmuxSessionSend {
            session_name,
            text,
            send_enter,
        } => {
            send_to_pane(broker, session_name, text, send_enter);
        }

        ClientMessage::Resize {
            terminal_id,
            cols,
            rows,
        } => {
            broker.registry.resize_terminal(&terminal_id, cols, rows);
            // Legacy clients resize before ever sending reconnect; treat
            // the resize as an ownership claim so they still get output.
            if broker.registry.get_terminal(&terminal_id).is_some() {
                broker.router.add_owner(&terminal_id, conn_id);
            }
        }

        ClientMessage::Detach { terminal_id } => {
            broker.router.remove_owner(&terminal_id, conn_id);
            match broker.registry.close_terminal(&terminal_id, false).await {
                Ok(_) => {}
                Err(e) => {
                    let _ = broker.connections.send_to(
                        conn_id,
                        &ServerMessage::Error {
                            message: format!("detach failed: {e}"),
                        },
                    );
                }
            }
        }

        ClientMessage::Close { terminal_id } => {
            broker.router.remove_owner(&terminal_id, conn_id);
            match broker.registry.close_terminal(&terminal_id, true).await {
                Ok(_) => {}
                // A detach may have already dropped the record while its
                // session lives on; a close for that id still destroys
                // the session.
                Err(_) if crate::registry::has_broker_prefix(&terminal_id, true) => {
                    if let Err(e) = broker.mux.kill_session(&terminal_id).await {
                        log::warn!("[conn] kill of detached session {terminal_id} failed: {e}");
                    }
                    broker
                        .connections
                        .broadcast(&ServerMessage::TerminalClosed {
                            terminal_id: terminal_id.clone(),
                        });
                }
                Err(e) => {
                    let _ = broker.connections.send_to(
                        conn_id,
                        &ServerMessage::Error {
                            message: format!("close failed: {e}"),
                        },
                    );
                }
            }
        }

        message @ ClientMessage::Reconnect { .. } => {
            let Some(terminal_id) = message.reconnect_terminal_id().map(str::to_string) else {
                let _ = broker.connections.send_to(
                    conn_id,
                    &ServerMessage::Error {
                        message: "reconnect requires terminalId".to_string(),
                    },
                );
                return;
            };
            match broker.registry.reconnect_to_terminal(&terminal_id).await {
                Ok(record) => {
                    broker.router.add_owner(&terminal_id, conn_id);
                    let _ = broker
                        .connections
                        .send_to(conn_id, &ServerMessage::TerminalReconnected { terminal: record });
                }
                Err(e) => {
                    let _ = broker.connections.send_to(
                        conn_id,
                        &ServerMessage::ReconnectFailed {
                            terminal_id,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }

        ClientMessage::QueryTmuxSessions => {
            let include_legacy = broker.config.legacy_prefixes;
            let sessions: Vec<String> = broker
                .mux
                .list_sessions()
                .await
                .into_iter()
                .filter(|name| crate::registry::has_broker_prefix(name, include_legacy))
                .collect();
            let _ = broker
                .connections
                .send_to(conn_id, &ServerMessage::TmuxSessionsList { sessions });
        }

        ClientMessage::UpdateEmbedded {
            terminal_id,
            embedded,
        } => {
            if let Err(e) = broker.registry.set_embedded(&terminal_id, embedded) {
                let _ = broker.connections.send_to(
                    conn_id,
                    &ServerMessage::Error {
                        message: format!("update-embedded failed: {e}"),
                    },
                );
            }
        }
    }
}

/// Literal text (and optional delayed `Enter`) to a pane or session,
/// bypassing any PTY. Runs detached so the injection delay never stalls
/// the sender's dispatch loop.
fn send_to_pane(
    broker: &Arc<Broker>,
    target: String,
    text: Option<String>,
    send_enter: Option<bool>,
) {
    let broker = Arc::clone(broker);
    tokio::spawn(async move {
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            if let Err(e) = broker.mux.send_literal(&target, &text).await {
                crate::server::log_background_error(
                    "conn",
                    &format!("send to pane {target} failed: {e}"),
                );
                return;
            }
        }
        if send_enter == Some(true) {
            tokio::time::sleep(COMMAND_ENTER_DELAY).await;
            if let Err(e) = broker.mux.send_key(&target, "Enter").await {
                crate::server::log_background_error(
                    "conn",
                    &format!("Enter to pane {target} failed: {e}"),
                );
            }
        }
    });
}

/// Remove every trace of a connection and start grace periods for
/// terminals nobody owns anymore.
async fn teardown(broker: &Arc<Broker>, conn_id: ConnId) {
    broker.connections.remove(conn_id);
    let orphaned = broker.router.remove_client(conn_id);
    for terminal_id in orphaned {
        broker.registry.disconnect_terminal(&terminal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::config::BrokerConfig;
    use crate::mux::{MuxResult, Multiplexer};
    use crate::registry::TerminalState;

    /// In-memory multiplexer so dispatch tests run without tmux.
    #[derive(Debug, Default)]
    struct StubMux {
        sessions: std::sync::Mutex<std::collections::HashSet<String>>,
    }

    #[async_trait]
    impl Multiplexer for StubMux {
        async fn list_sessions(&self) -> Vec<String> {
            self.sessions.lock().unwrap().iter().cloned().collect()
        }
        async fn session_exists(&self, name: &str) -> bool {
            self.sessions.lock().unwrap().contains(name)
        }
        async fn create_session(
            &self,
            name: &str,
            _working_dir: &std::path::Path,
            _command: Option<&str>,
        ) -> MuxResult<()> {
            self.sessions.lock().unwrap().insert(name.to_string());
            Ok(())
        }
        async fn kill_session(&self, name: &str) -> MuxResult<()> {
            self.sessions.lock().unwrap().remove(name);
            Ok(())
        }
        async fn send_literal(&self, _target: &str, _text: &str) -> MuxResult<()> {
            Ok(())
        }
        async fn send_key(&self, _target: &str, _key: &str) -> MuxResult<()> {
            Ok(())
        }
        async fn pane_current_path(&self, _name: &str) -> Option<std::path::PathBuf> {
            None
        }
        async fn server_alive(&self) -> bool {
            true
        }
        fn attach_argv(&self, _session_name: &str) -> Vec<String> {
            vec!["sh".to_string()]
        }
    }

    fn test_broker() -> Arc<Broker> {
        let (broker, _events) =
            Broker::with_mux(BrokerConfig::default(), Arc::new(StubMux::default()));
        broker
    }

    /// Register a fake client and return its id plus outbound queue.
    fn fake_client(broker: &Broker) -> (ConnId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let id = broker.connections.register(tx, ClientKind::Unknown);
        (id, rx)
    }

    fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = rx.try_recv().expect("expected a queued frame");
        serde_json::from_str(&frame).expect("frame is JSON")
    }

    async fn spawn_test_terminal(broker: &Arc<Broker>) -> String {
        let spec = crate::registry::TerminalSpec {
            name: Some("dispatch test".to_string()),
            terminal_type: "bash".to_string(),
            working_dir: None,
            command: None,
            session_name: None,
            use_multiplexer: true,
        };
        broker
            .registry
            .register_terminal(spec)
            .await
            .expect("register terminal")
            .id
    }

    #[tokio::test]
    async fn test_dispatch_list_terminals_sends_snapshot() {
        let broker = test_broker();
        let (conn, mut rx) = fake_client(&broker);
        let id = spawn_test_terminal(&broker).await;

        dispatch(&broker, conn, ClientMessage::ListTerminals).await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "terminals");
        let terminals = frame["terminals"].as_array().expect("array");
        assert!(terminals.iter().any(|t| t["id"] == id.as_str()));
        assert_eq!(frame["recoveryComplete"], false);

        let _ = broker.registry.close_terminal(&id, true).await;
    }

    #[tokio::test]
    async fn test_dispatch_resize_grants_ownership() {
        let broker = test_broker();
        let (conn, _rx) = fake_client(&broker);
        let id = spawn_test_terminal(&broker).await;

        dispatch(
            &broker,
            conn,
            ClientMessage::Resize {
                terminal_id: id.clone(),
                cols: 120,
                rows: 40,
            },
        )
        .await;

        assert!(broker.router.is_owner(&id, conn));
        let _ = broker.registry.close_terminal(&id, true).await;
    }

    #[tokio::test]
    async fn test_dispatch_reconnect_acquires_ownership_and_responds() {
        let broker = test_broker();
        let (conn, mut rx) = fake_client(&broker);
        let id = spawn_test_terminal(&broker).await;

        dispatch(
            &broker,
            conn,
            ClientMessage::Reconnect {
                terminal_id: Some(id.clone()),
                data: None,
            },
        )
        .await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "terminal-reconnected");
        assert_eq!(frame["terminal"]["id"], id.as_str());
        assert_eq!(frame["terminal"]["state"], "connected");
        assert!(broker.router.is_owner(&id, conn));

        let _ = broker.registry.close_terminal(&id, true).await;
    }

    #[tokio::test]
    async fn test_dispatch_reconnect_unknown_fails() {
        let broker = test_broker();
        let (conn, mut rx) = fake_client(&broker);

        dispatch(
            &broker,
            conn,
            ClientMessage::Reconnect {
                terminal_id: Some("ctt-ghost-00000000".to_string()),
                data: None,
            },
        )
        .await;

        let frame = next_frame(&mut rx);
        assert_eq!(frame["type"], "reconnect-failed");
        assert!(!broker.router.is_owner("ctt-ghost-00000000", conn));
    }

    #[tokio::test]
    async fn test_dispatch_detach_removes_record() {
        let broker = test_broker();
        let (conn, _rx) = fake_client(&broker);
        let id = spawn_test_terminal(&broker).await;
        broker.router.add_owner(&id, conn);

        dispatch(
            &broker,
            conn,
            ClientMessage::Detach {
                terminal_id: id.clone(),
            },
        )
        .await;

        assert!(broker.registry.get_terminal(&id).is_none());
        assert!(!broker.router.is_owner(&id, conn));
        // Detach leaves the session alive for recovery.
        assert!(broker.mux.session_exists(&id).await);

        let _ = broker.mux.kill_session(&id).await;
    }

    #[tokio::test]
    async fn test_dispatch_update_embedded_sets_flag() {
        let broker = test_broker();
        let (conn, _rx) = fake_client(&broker);
        let id = spawn_test_terminal(&broker).await;

        dispatch(
            &broker,
            conn,
            ClientMessage::UpdateEmbedded {
                terminal_id: id.clone(),
                embedded: true,
            },
        )
        .await;

        assert_eq!(
            broker.registry.get_terminal(&id).map(|r| r.embedded),
            Some(true)
        );
        let _ = broker.registry.close_terminal(&id, true).await;
    }

    #[tokio::test]
    async fn test_teardown_starts_grace_for_orphans() {
        let broker = test_broker();
        let (conn, _rx) = fake_client(&broker);
        let id = spawn_test_terminal(&broker).await;
        broker.router.add_owner(&id, conn);

        teardown(&broker, conn).await;

        assert!(!broker.connections.contains(conn));
        assert_eq!(
            broker.registry.get_terminal(&id).map(|r| r.state),
            Some(TerminalState::Disconnecting)
        );

        let _ = broker.registry.close_terminal(&id, true).await;
    }

    #[test]
    fn test_malformed_window_allows_budget() {
        let mut window = MalformedWindow::default();
        let now = Instant::now();
        for _ in 0..MAX_MALFORMED_PER_MINUTE {
            assert!(!window.record(now));
        }
        // The (N+1)th tick inside the window trips the limit.
        assert!(window.record(now));
    }

    #[test]
    fn test_malformed_window_slides() {
        let mut window = MalformedWindow::default();
        let start = Instant::now();
        for _ in 0..MAX_MALFORMED_PER_MINUTE {
            assert!(!window.record(start));
        }
        // Same ticks a window later have expired.
        let later = start + MALFORMED_WINDOW + Duration::from_secs(1);
        assert!(!window.record(later));
    }

    #[test]
    fn test_connection_manager_register_and_remove() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = manager.register(tx, ClientKind::Unknown);

        assert!(manager.contains(id));
        assert_eq!(manager.active_count(), 1);
        manager.remove(id);
        assert!(!manager.contains(id));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_sidebar_count_tracks_identify() {
        let manager = ConnectionManager::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_b, _rx_b) = mpsc::channel(4);
        let a = manager.register(tx_a, ClientKind::Unknown);
        let _b = manager.register(tx_b, ClientKind::Unknown);

        assert_eq!(manager.sidebar_count(), 0);
        manager.set_kind(a, ClientKind::Sidebar);
        assert_eq!(manager.sidebar_count(), 1);
    }

    #[test]
    fn test_broadcast_prunes_dead_clients() {
        let manager = ConnectionManager::new();
        let (tx_live, mut rx_live) = mpsc::channel(4);
        let live = manager.register(tx_live, ClientKind::Unknown);
        let (tx_dead, rx_dead) = mpsc::channel(4);
        let dead = manager.register(tx_dead, ClientKind::Unknown);
        drop(rx_dead);

        manager.broadcast(&ServerMessage::Error {
            message: "ping".to_string(),
        });

        assert!(rx_live.try_recv().is_ok());
        assert!(manager.contains(live));
        assert!(!manager.contains(dead));
    }

    #[test]
    fn test_send_to_unknown_connection_is_false() {
        let manager = ConnectionManager::new();
        assert!(!manager.send_to(
            999,
            &ServerMessage::Error {
                message: "x".to_string()
            }
        ));
    }
}
