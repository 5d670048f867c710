//! Spawn orchestration.
//!
//! Validates spawn requests, collapses duplicates by `requestId`, asks the
//! registry for a terminal, and announces the result. Dedup keys on request
//! identity alone: two spawns with identical payloads but different ids are
//! two terminals, and a repeated id inside the window is dropped without a
//! `spawn-error` because the first attempt already answered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;

use crate::constants::SPAWN_DEDUP_WINDOW;
use crate::registry::{TerminalRecord, TerminalSpec};
use crate::server::connection::ConnId;
use crate::server::protocol::{ServerMessage, SpawnConfig};
use crate::server::Broker;

/// Longest accepted terminal name.
const MAX_NAME_LEN: usize = 64;
/// Longest accepted type tag.
const MAX_TYPE_LEN: usize = 32;

/// What became of an accepted spawn request.
#[derive(Debug)]
pub enum SpawnOutcome {
    /// A terminal was created and broadcast.
    Spawned(TerminalRecord),
    /// The `requestId` was seen inside the dedup window; dropped silently.
    Duplicate,
}

/// Deduplicating spawn front end.
#[derive(Debug, Default)]
pub struct SpawnOrchestrator {
    dedup: Mutex<HashMap<String, Instant>>,
}

impl SpawnOrchestrator {
    /// Empty orchestrator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, dedup, create, and broadcast. The originating connection
    /// (when there is one) becomes the new terminal's owner; failures go
    /// back to it as `spawn-error`.
    pub async fn spawn_from_client(
        &self,
        broker: &Arc<Broker>,
        origin: Option<ConnId>,
        config: SpawnConfig,
        request_id: Option<String>,
    ) {
        match self.spawn(broker, origin, &config, request_id.clone()).await {
            Ok(_) => {}
            Err(e) => {
                log::warn!("[spawn] failed: {e:#}");
                if let Some(conn) = origin {
                    let _ = broker.connections.send_to(
                        conn,
                        &ServerMessage::SpawnError {
                            error: e.to_string(),
                            request_id,
                            terminal_type: config.terminal_type.clone(),
                            terminal_name: config.name.clone().unwrap_or_default(),
                        },
                    );
                }
            }
        }
    }

    /// Core spawn path, shared by the WebSocket message and `POST
    /// /api/spawn`.
    pub async fn spawn(
        &self,
        broker: &Arc<Broker>,
        origin: Option<ConnId>,
        config: &SpawnConfig,
        request_id: Option<String>,
    ) -> Result<SpawnOutcome> {
        validate_config(config).map_err(anyhow::Error::msg)?;

        if let Some(id) = request_id.as_deref().filter(|id| !id.is_empty()) {
            if self.is_duplicate(id) {
                log::warn!("[spawn] dropping duplicate request {id}");
                return Ok(SpawnOutcome::Duplicate);
            }
        }

        let spec = TerminalSpec {
            name: config.name.clone(),
            terminal_type: config.terminal_type.clone(),
            working_dir: config.working_dir.clone(),
            command: config.command.clone(),
            session_name: None,
            use_multiplexer: config.use_multiplexer,
        };
        let record = broker.registry.register_terminal(spec).await?;

        if let Some(conn) = origin {
            broker.router.add_owner(&record.id, conn);
        }

        broker.connections.broadcast(&ServerMessage::TerminalSpawned {
            terminal: record.clone(),
            request_id,
        });

        Ok(SpawnOutcome::Spawned(record))
    }

    /// Check-and-insert for the dedup window. Expired entries are pruned
    /// on the way through.
    fn is_duplicate(&self, request_id: &str) -> bool {
        let now = Instant::now();
        let mut dedup = self.dedup.lock().expect("dedup lock poisoned");
        dedup.retain(|_, inserted| now.duration_since(*inserted) < SPAWN_DEDUP_WINDOW);
        if dedup.contains_key(request_id) {
            return true;
        }
        dedup.insert(request_id.to_string(), now);
        false
    }
}

/// Shape checks on a spawn config. Only the tag's shape is constrained;
/// its value stays opaque to the broker.
fn validate_config(config: &SpawnConfig) -> Result<(), String> {
    let tag = config.terminal_type.trim();
    if tag.is_empty() || tag.len() > MAX_TYPE_LEN {
        return Err(format!("invalid terminalType: {:?}", config.terminal_type));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!("invalid terminalType: {:?}", config.terminal_type));
    }

    if let Some(name) = &config.name {
        if name.len() > MAX_NAME_LEN || name.chars().any(char::is_control) {
            return Err("invalid terminal name".to_string());
        }
    }

    if let Some(dir) = &config.working_dir {
        if dir.is_empty() || !dir.starts_with('/') {
            return Err(format!("workingDir must be an absolute path: {dir:?}"));
        }
    }

    Ok(())
}
