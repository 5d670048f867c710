//! Startup session recovery.
//!
//! The multiplexer outlives the broker, so sessions created by a previous
//! process are still running when this one starts. Shortly after startup
//! (late enough for early clients to connect and observe the result), the
//! recovery service enumerates sessions carrying the broker prefix and
//! re-registers each as a terminal, attaching to the existing session
//! rather than creating a new one.
//!
//! `--force-clean` skips adoption entirely: surviving PTYs are torn down
//! and the registry flushed, leaving a blank slate.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::constants::RECOVERY_STARTUP_DELAY;
use crate::registry::{display_name_from_session, has_broker_prefix, TerminalSpec};
use crate::server::Broker;

/// One-shot recovery runner with a per-session in-flight guard.
#[derive(Debug, Default)]
pub struct RecoveryService {
    in_flight: Mutex<HashSet<String>>,
}

impl RecoveryService {
    /// Idle service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait out the startup delay, adopt surviving sessions (or flush,
    /// under force-clean), then broadcast the terminal list with
    /// `recoveryComplete` so clients can proceed either way.
    pub async fn run(self: Arc<Self>, broker: Arc<Broker>) {
        tokio::time::sleep(RECOVERY_STARTUP_DELAY).await;

        if broker.config.force_clean {
            log::info!("[recovery] force-clean set; flushing instead of recovering");
            broker.registry.flush();
        } else {
            self.recover_all(&broker).await;
            // Adoption can race a client-driven spawn for the same session.
            broker.registry.cleanup_duplicates().await;
        }

        broker.mark_recovery_complete();
        broker.connections.broadcast(&broker.terminals_message());
    }

    /// Enumerate and adopt every broker-prefixed session.
    async fn recover_all(&self, broker: &Arc<Broker>) {
        let include_legacy = broker.config.legacy_prefixes;
        let sessions: Vec<String> = broker
            .mux
            .list_sessions()
            .await
            .into_iter()
            .filter(|name| has_broker_prefix(name, include_legacy))
            .collect();

        if sessions.is_empty() {
            log::info!("[recovery] no surviving sessions");
            return;
        }
        log::info!("[recovery] found {} surviving session(s)", sessions.len());

        for session in sessions {
            if let Err(e) = self.recover_session(broker, &session).await {
                log::warn!("[recovery] skipping session {session}: {e:#}");
            }
        }
    }

    /// Adopt one session, unless it is already registered or another
    /// recovery of the same name is mid-flight.
    async fn recover_session(&self, broker: &Arc<Broker>, session: &str) -> anyhow::Result<()> {
        if broker.registry.get_terminal(session).is_some() {
            log::debug!("[recovery] session {session} already registered");
            return Ok(());
        }
        {
            let mut in_flight = self.in_flight.lock().expect("in_flight lock poisoned");
            if !in_flight.insert(session.to_string()) {
                log::debug!("[recovery] session {session} already recovering");
                return Ok(());
            }
        }

        let result = self.adopt(broker, session).await;

        let mut in_flight = self.in_flight.lock().expect("in_flight lock poisoned");
        in_flight.remove(session);
        result
    }

    async fn adopt(&self, broker: &Arc<Broker>, session: &str) -> anyhow::Result<()> {
        let working_dir = broker
            .mux
            .pane_current_path(session)
            .await
            .unwrap_or_else(|| broker.config.home_dir.clone());

        let spec = TerminalSpec {
            name: Some(display_name_from_session(session)),
            terminal_type: "bash".to_string(),
            working_dir: Some(working_dir.to_string_lossy().into_owned()),
            command: None,
            session_name: Some(session.to_string()),
            use_multiplexer: true,
        };

        let record = broker.registry.register_terminal(spec).await?;
        // The session's pane knows better than the spec default where the
        // user actually was.
        broker
            .registry
            .set_working_dir(&record.id, &working_dir.to_string_lossy());
        log::info!("[recovery] re-attached session {session}");
        Ok(())
    }
}
