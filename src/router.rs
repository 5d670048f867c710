//! Ownership routing for terminal output.
//!
//! The router holds the `terminalId → set<client>` map and is the sole
//! authority on who receives `terminal-output`. Ownership is explicit: a
//! client appears here only after sending `reconnect` (or `resize`, for
//! legacy clients) or by originating the spawn that created the terminal.
//! New connections own nothing.
//!
//! Earlier revisions of this system auto-registered every new connection as
//! owner of every terminal, which duplicated output and corrupted escape
//! sequences across windows. Implicit ownership stays forbidden.
//!
//! Delivery serializes the event once and `try_send`s the same frame to
//! each owner. A client whose outbound queue is full (or gone) is treated
//! as dead and pruned rather than awaited: a slow client must never stall
//! the PTY output path.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::server::connection::{ConnId, ConnectionManager};
use crate::server::protocol::ServerMessage;

/// Owner map for routed terminal output.
#[derive(Debug, Default)]
pub struct OwnershipRouter {
    owners: Mutex<HashMap<String, HashSet<ConnId>>>,
}

impl OwnershipRouter {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `conn` ownership of `terminal_id`.
    pub fn add_owner(&self, terminal_id: &str, conn: ConnId) {
        let mut owners = self.owners.lock().expect("owners lock poisoned");
        owners
            .entry(terminal_id.to_string())
            .or_default()
            .insert(conn);
    }

    /// Revoke one client's ownership of one terminal.
    pub fn remove_owner(&self, terminal_id: &str, conn: ConnId) {
        let mut owners = self.owners.lock().expect("owners lock poisoned");
        if let Some(set) = owners.get_mut(terminal_id) {
            set.remove(&conn);
            if set.is_empty() {
                owners.remove(terminal_id);
            }
        }
    }

    /// Drop a client from every ownership set. Returns the terminals whose
    /// sets became empty (candidates for the disconnect grace period).
    pub fn remove_client(&self, conn: ConnId) -> Vec<String> {
        let mut owners = self.owners.lock().expect("owners lock poisoned");
        let mut orphaned = Vec::new();
        owners.retain(|terminal_id, set| {
            set.remove(&conn);
            if set.is_empty() {
                orphaned.push(terminal_id.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }

    /// Forget a terminal entirely (it was closed).
    pub fn remove_terminal(&self, terminal_id: &str) {
        let mut owners = self.owners.lock().expect("owners lock poisoned");
        owners.remove(terminal_id);
    }

    /// Whether this client currently owns this terminal.
    #[must_use]
    pub fn is_owner(&self, terminal_id: &str, conn: ConnId) -> bool {
        let owners = self.owners.lock().expect("owners lock poisoned");
        owners
            .get(terminal_id)
            .is_some_and(|set| set.contains(&conn))
    }

    /// Number of owners for a terminal.
    #[must_use]
    pub fn owner_count(&self, terminal_id: &str) -> usize {
        let owners = self.owners.lock().expect("owners lock poisoned");
        owners.get(terminal_id).map_or(0, HashSet::len)
    }

    /// Terminals a client owns, for connection teardown.
    #[must_use]
    pub fn terminals_of(&self, conn: ConnId) -> Vec<String> {
        let owners = self.owners.lock().expect("owners lock poisoned");
        owners
            .iter()
            .filter(|(_, set)| set.contains(&conn))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Route one event to the owners of `terminal_id`.
    ///
    /// No owners means no delivery — the event is dropped, not broadcast.
    /// Dead owners discovered during the send are pruned here and removed
    /// from the active connection set.
    pub fn deliver(
        &self,
        connections: &ConnectionManager,
        terminal_id: &str,
        message: &ServerMessage,
    ) {
        let targets: Vec<ConnId> = {
            let owners = self.owners.lock().expect("owners lock poisoned");
            match owners.get(terminal_id) {
                Some(set) if !set.is_empty() => set.iter().copied().collect(),
                _ => return,
            }
        };

        let frame = message.to_json();
        let mut dead = Vec::new();
        for conn in targets {
            match connections.get(conn) {
                Some(handle) if handle.try_send(frame.clone()) => {}
                _ => dead.push(conn),
            }
        }

        for conn in dead {
            log::warn!("[router] dropping dead client {conn} from terminal {terminal_id}");
            self.remove_owner(terminal_id, conn);
            connections.remove(conn);
        }
    }

    /// Remove map entries for clients that are no longer connected.
    pub fn sweep(&self, connections: &ConnectionManager) {
        let mut owners = self.owners.lock().expect("owners lock poisoned");
        owners.retain(|_, set| {
            set.retain(|conn| connections.contains(*conn));
            !set.is_empty()
        });
    }

    /// Periodic sweep task for the broker's lifetime.
    pub fn start_sweep_task(
        self: &Arc<Self>,
        connections: Arc<ConnectionManager>,
    ) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(crate::constants::OWNERSHIP_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                router.sweep(&connections);
            }
        })
    }
}
