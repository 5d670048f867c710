//! Authoritative terminal registry and per-terminal state machine.
//!
//! The registry owns every [`TerminalRecord`], coordinates the multiplexer
//! adapter and the PTY supervisor, and serializes all state transitions for
//! a terminal under one lock (never held across await points).
//!
//! # State machine
//!
//! ```text
//!         register_terminal           first output / warmup timer
//! [none] ─────────────────► connecting ──────────────► connected
//!                                                        │
//!                    disconnect_terminal                 │
//!                               ▼                        │
//!                         disconnecting                  │
//!                      (grace timer running)             │
//!                               │ cancel_disconnect      │
//!                               ├──────────────────────► connected
//!                               │
//!                               ▼ grace expired
//!                         disconnected ──► close_terminal ──► closed ──► [removed]
//! ```
//!
//! Output and lifecycle changes leave the registry as [`RegistryEvent`]s;
//! the server's event pump turns them into routed `terminal-output` frames
//! and `terminal-closed` broadcasts.

// Rust guideline compliant 2026-02

pub mod record;

pub use record::{
    display_name_from_session, has_broker_prefix, new_terminal_id, slugify, TerminalRecord,
    TerminalState,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::constants::{
    COMMAND_ENTER_DELAY, COMMAND_WARMUP_DELAY, CONNECT_WARMUP, DISCONNECT_GRACE,
};
use crate::mux::Multiplexer;
use crate::pty::{PtyEvent, PtySpawnParams, PtySupervisor};

/// Events emitted by the registry for the server to route or broadcast.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// PTY output for one terminal, in read order.
    Output {
        /// Terminal the bytes belong to.
        id: String,
        /// Raw output chunk.
        data: Vec<u8>,
    },
    /// A terminal was removed from the registry.
    Closed {
        /// The removed terminal's id.
        id: String,
    },
}

/// Request to create (or re-adopt) a terminal.
#[derive(Debug, Clone)]
pub struct TerminalSpec {
    /// Human label; defaults to `Terminal`.
    pub name: Option<String>,
    /// Opaque type tag (`bash` unless a preset says otherwise).
    pub terminal_type: String,
    /// Working directory; defaults to the user home.
    pub working_dir: Option<String>,
    /// Startup command injected once the shell has warmed up.
    pub command: Option<String>,
    /// Pre-existing session to attach to (recovery path). When set the
    /// registry attaches instead of creating a new session.
    pub session_name: Option<String>,
    /// Whether the terminal attaches to the multiplexer.
    pub use_multiplexer: bool,
}

impl TerminalSpec {
    /// Spec for a fresh multiplexer-backed terminal.
    #[must_use]
    pub fn new(terminal_type: impl Into<String>) -> Self {
        Self {
            name: None,
            terminal_type: terminal_type.into(),
            working_dir: None,
            command: None,
            session_name: None,
            use_multiplexer: true,
        }
    }
}

/// One registry slot: the record plus its pending timers.
struct TerminalEntry {
    record: TerminalRecord,
    disconnect_timer: Option<JoinHandle<()>>,
    warmup_timer: Option<JoinHandle<()>>,
}

impl TerminalEntry {
    fn abort_timers(&mut self) {
        if let Some(t) = self.disconnect_timer.take() {
            t.abort();
        }
        if let Some(t) = self.warmup_timer.take() {
            t.abort();
        }
    }
}

/// Authoritative in-memory registry of live terminals.
pub struct TerminalRegistry {
    terminals: Mutex<HashMap<String, TerminalEntry>>,
    mux: Arc<dyn Multiplexer>,
    supervisor: Arc<PtySupervisor>,
    events_tx: UnboundedSender<RegistryEvent>,
    shell: String,
    home_dir: PathBuf,
}

impl std::fmt::Debug for TerminalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalRegistry")
            .field("terminals", &self.get_active_terminal_count())
            .finish_non_exhaustive()
    }
}

impl TerminalRegistry {
    /// Create a registry wired to the given collaborators.
    #[must_use]
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        supervisor: Arc<PtySupervisor>,
        events_tx: UnboundedSender<RegistryEvent>,
        shell: String,
        home_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            terminals: Mutex::new(HashMap::new()),
            mux,
            supervisor,
            events_tx,
            shell,
            home_dir,
        })
    }

    /// Consume PTY events for the lifetime of the broker.
    ///
    /// First output promotes `connecting → connected`; a child exit closes
    /// the terminal non-destructively (the session, if any, survives).
    pub fn start_event_pump(
        self: &Arc<Self>,
        mut pty_rx: UnboundedReceiver<PtyEvent>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = pty_rx.recv().await {
                match event {
                    PtyEvent::Output { id, data } => {
                        registry.on_output(&id);
                        let _ = registry.events_tx.send(RegistryEvent::Output { id, data });
                    }
                    PtyEvent::Exited { id } => {
                        log::info!("[registry] PTY exited for terminal {id}");
                        if registry.get_terminal(&id).is_some() {
                            if let Err(e) = registry.close_terminal(&id, false).await {
                                log::debug!("[registry] close after exit: {e}");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Record activity and promote a connecting terminal on first output.
    fn on_output(&self, id: &str) {
        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        if let Some(entry) = terminals.get_mut(id) {
            entry.record.touch();
            if entry.record.state == TerminalState::Connecting {
                entry.record.state = TerminalState::Connected;
                if let Some(t) = entry.warmup_timer.take() {
                    t.abort();
                }
            }
        }
    }

    /// Create a terminal: ensure its multiplexer session exists (creating
    /// one unless `spec.session_name` re-adopts a survivor), spawn the PTY,
    /// insert the record, and schedule warmup plus optional command
    /// injection.
    pub async fn register_terminal(self: &Arc<Self>, spec: TerminalSpec) -> Result<TerminalRecord> {
        let name = spec
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Terminal".to_string());

        let (id, adopting) = match &spec.session_name {
            Some(existing) => (existing.clone(), true),
            None => (new_terminal_id(&name), false),
        };
        let session_name = id.clone();

        let working_dir = spec
            .working_dir
            .clone()
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
            .unwrap_or_else(|| self.home_dir.clone());

        {
            let terminals = self.terminals.lock().expect("terminals lock poisoned");
            if terminals.contains_key(&id) {
                bail!("terminal id collision: {id}");
            }
        }

        let mut created_session = false;
        if spec.use_multiplexer && !self.mux.session_exists(&session_name).await {
            if adopting {
                bail!("session {session_name} no longer exists");
            }
            self.mux
                .create_session(&session_name, &working_dir, None)
                .await
                .with_context(|| format!("failed to create session {session_name}"))?;
            created_session = true;
        }

        let argv = if spec.use_multiplexer {
            self.mux.attach_argv(&session_name)
        } else {
            vec![self.shell.clone()]
        };
        let params = PtySpawnParams {
            id: id.clone(),
            argv,
            terminal_type: spec.terminal_type.clone(),
            name: name.clone(),
            working_dir: working_dir.clone(),
            cols: None,
            rows: None,
        };
        if let Err(e) = self.supervisor.spawn(&params) {
            // Don't leak a session nobody will ever attach to.
            if created_session {
                let _ = self.mux.kill_session(&session_name).await;
            }
            return Err(e.context(format!("failed to spawn PTY for {id}")));
        }

        let record = TerminalRecord::new(
            id.clone(),
            name,
            spec.terminal_type,
            working_dir.to_string_lossy().into_owned(),
            spec.command.clone().filter(|c| !c.is_empty()),
            session_name.clone(),
            spec.use_multiplexer,
        );

        let warmup = {
            let registry = Arc::clone(self);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CONNECT_WARMUP).await;
                registry.on_output(&id);
            })
        };

        {
            let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
            terminals.insert(
                id.clone(),
                TerminalEntry {
                    record: record.clone(),
                    disconnect_timer: None,
                    warmup_timer: Some(warmup),
                },
            );
        }

        if let Some(command) = record.command.clone() {
            self.schedule_command_injection(&record, command);
        }

        log::info!("[registry] registered terminal {id} (session {session_name})");
        Ok(record)
    }

    /// Inject the startup command once the shell has had time to print its
    /// prompt, with the mandatory pause before `Enter`.
    fn schedule_command_injection(self: &Arc<Self>, record: &TerminalRecord, command: String) {
        let registry = Arc::clone(self);
        let id = record.id.clone();
        let session = record.session_name.clone();
        let via_mux = record.use_multiplexer;
        tokio::spawn(async move {
            tokio::time::sleep(COMMAND_WARMUP_DELAY).await;
            if via_mux {
                if let Err(e) = registry.mux.send_literal(&session, &command).await {
                    log::warn!("[registry] command injection for {id} failed: {e}");
                    return;
                }
                tokio::time::sleep(COMMAND_ENTER_DELAY).await;
                if let Err(e) = registry.mux.send_key(&session, "Enter").await {
                    log::warn!("[registry] Enter injection for {id} failed: {e}");
                }
            } else {
                registry.supervisor.write(&id, command.as_bytes());
                tokio::time::sleep(COMMAND_ENTER_DELAY).await;
                registry.supervisor.write(&id, b"\r");
            }
        });
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn get_terminal(&self, id: &str) -> Option<TerminalRecord> {
        let terminals = self.terminals.lock().expect("terminals lock poisoned");
        terminals.get(id).map(|e| e.record.clone())
    }

    /// Snapshot of every record, oldest first.
    #[must_use]
    pub fn get_all_terminals(&self) -> Vec<TerminalRecord> {
        let terminals = self.terminals.lock().expect("terminals lock poisoned");
        let mut records: Vec<TerminalRecord> =
            terminals.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Number of live terminals.
    #[must_use]
    pub fn get_active_terminal_count(&self) -> usize {
        self.terminals.lock().expect("terminals lock poisoned").len()
    }

    /// Forward input bytes to a terminal's PTY.
    pub fn send_command(&self, id: &str, data: &[u8]) {
        {
            let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
            if let Some(entry) = terminals.get_mut(id) {
                entry.record.touch();
            }
        }
        self.supervisor.write(id, data);
    }

    /// Resize a terminal (debounced downstream).
    ///
    /// Unknown terminals fail silently; resize races registry insertion
    /// during startup and the client retries on its own cadence.
    pub fn resize_terminal(self: &Arc<Self>, id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            log::debug!("[registry] ignoring degenerate resize {cols}x{rows} for {id}");
            return;
        }
        match self.supervisor.resize(id, cols, rows) {
            Ok((cols, rows)) => {
                let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
                if let Some(entry) = terminals.get_mut(id) {
                    entry.record.cols = Some(cols);
                    entry.record.rows = Some(rows);
                    entry.record.touch();
                }
            }
            Err(e) => log::debug!("[registry] {e}"),
        }
    }

    /// Remove a terminal. `force` also destroys the multiplexer session;
    /// otherwise only the PTY dies and the session lives on for recovery.
    pub async fn close_terminal(self: &Arc<Self>, id: &str, force: bool) -> Result<TerminalRecord> {
        let entry = {
            let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
            terminals.remove(id)
        };
        let Some(mut entry) = entry else {
            bail!("terminal not found: {id}");
        };
        entry.abort_timers();
        entry.record.state = TerminalState::Closed;

        self.supervisor.kill(id, force);

        if force && entry.record.use_multiplexer {
            if let Err(e) = self.mux.kill_session(&entry.record.session_name).await {
                log::warn!(
                    "[registry] failed to kill session {}: {e}",
                    entry.record.session_name
                );
            }
        }

        let _ = self.events_tx.send(RegistryEvent::Closed { id: id.to_string() });
        log::info!("[registry] closed terminal {id} (force={force})");
        Ok(entry.record)
    }

    /// Begin the disconnect grace period for a terminal.
    ///
    /// If no `cancel_disconnect` (or successful reconnect) arrives before
    /// the timer fires, the terminal is closed non-destructively. Calling
    /// again restarts the timer; each invocation fires at most once.
    pub fn disconnect_terminal(self: &Arc<Self>, id: &str) {
        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        let Some(entry) = terminals.get_mut(id) else {
            return;
        };
        if matches!(
            entry.record.state,
            TerminalState::Disconnected | TerminalState::Closed
        ) {
            return;
        }
        entry.record.state = TerminalState::Disconnecting;
        if let Some(t) = entry.disconnect_timer.take() {
            t.abort();
        }
        let registry = Arc::clone(self);
        let id_owned = id.to_string();
        entry.disconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_GRACE).await;
            registry.grace_expired(&id_owned).await;
        }));
        log::debug!("[registry] grace period started for {id}");
    }

    /// Grace timer body: tear down unless something reconnected meanwhile.
    async fn grace_expired(self: &Arc<Self>, id: &str) {
        {
            let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
            match terminals.get_mut(id) {
                Some(entry) if entry.record.state == TerminalState::Disconnecting => {
                    entry.record.state = TerminalState::Disconnected;
                }
                _ => return,
            }
        }
        log::info!("[registry] grace expired for {id}, detaching");
        if let Err(e) = self.close_terminal(id, false).await {
            log::debug!("[registry] grace close: {e}");
        }
    }

    /// Cancel a pending disconnect, restoring `connected`.
    pub fn cancel_disconnect(&self, id: &str) {
        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        if let Some(entry) = terminals.get_mut(id) {
            if let Some(t) = entry.disconnect_timer.take() {
                t.abort();
            }
            if entry.record.state == TerminalState::Disconnecting {
                entry.record.state = TerminalState::Connected;
            }
        }
    }

    /// Validate that a terminal still exists (and its session is alive)
    /// and mark it connected. Used by clients after a WebSocket reconnect.
    pub async fn reconnect_to_terminal(self: &Arc<Self>, id: &str) -> Result<TerminalRecord> {
        let (session_name, use_multiplexer) = {
            let terminals = self.terminals.lock().expect("terminals lock poisoned");
            let Some(entry) = terminals.get(id) else {
                bail!("terminal not found: {id}");
            };
            (
                entry.record.session_name.clone(),
                entry.record.use_multiplexer,
            )
        };

        if use_multiplexer && !self.mux.session_exists(&session_name).await {
            // Session died underneath us; drop the stale record.
            let _ = self.close_terminal(id, false).await;
            bail!("session {session_name} no longer exists");
        }

        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        let Some(entry) = terminals.get_mut(id) else {
            bail!("terminal not found: {id}");
        };
        if let Some(t) = entry.disconnect_timer.take() {
            t.abort();
        }
        entry.record.state = TerminalState::Connected;
        entry.record.touch();
        Ok(entry.record.clone())
    }

    /// Store the `embedded` UI flag on a record.
    pub fn set_embedded(&self, id: &str, embedded: bool) -> Result<()> {
        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        let Some(entry) = terminals.get_mut(id) else {
            bail!("terminal not found: {id}");
        };
        entry.record.embedded = embedded;
        Ok(())
    }

    /// Rewrite a record's working directory (recovery pane-path fixup).
    pub fn set_working_dir(&self, id: &str, working_dir: &str) {
        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        if let Some(entry) = terminals.get_mut(id) {
            entry.record.working_dir = working_dir.to_string();
        }
    }

    /// Drop records that share a session name, keeping the most recently
    /// active one per session.
    pub async fn cleanup_duplicates(self: &Arc<Self>) {
        let losers: Vec<String> = {
            let terminals = self.terminals.lock().expect("terminals lock poisoned");
            let mut best: HashMap<&str, (&str, chrono::DateTime<chrono::Utc>)> = HashMap::new();
            let mut losers = Vec::new();
            for (id, entry) in terminals.iter() {
                let session = entry.record.session_name.as_str();
                match best.get(session) {
                    Some(&(winner_id, winner_at)) => {
                        if entry.record.last_activity > winner_at {
                            losers.push(winner_id.to_string());
                            best.insert(session, (id, entry.record.last_activity));
                        } else {
                            losers.push(id.clone());
                        }
                    }
                    None => {
                        best.insert(session, (id, entry.record.last_activity));
                    }
                }
            }
            losers
        };
        for id in losers {
            log::warn!("[registry] removing duplicate record {id}");
            let _ = self.close_terminal(&id, false).await;
        }
    }

    /// Shutdown: kill managed PTYs, preserve multiplexer sessions.
    pub fn cleanup(&self) {
        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        for (_, entry) in terminals.iter_mut() {
            entry.abort_timers();
        }
        terminals.clear();
        drop(terminals);
        self.supervisor.cleanup_with_grace(false);
    }

    /// Force-clean startup: tear down any surviving PTYs immediately and
    /// flush the registry.
    pub fn flush(&self) {
        let mut terminals = self.terminals.lock().expect("terminals lock poisoned");
        for (_, entry) in terminals.iter_mut() {
            entry.abort_timers();
        }
        terminals.clear();
        drop(terminals);
        self.supervisor.cleanup_with_grace(true);
    }
}
