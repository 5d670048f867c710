//! Broker assembly and HTTP/WebSocket serving.
//!
//! [`Broker`] wires the components together: multiplexer adapter, PTY
//! supervisor, terminal registry, connection manager, ownership router,
//! and spawn orchestrator. [`run`] serves the axum application on the
//! loopback interface until a signal arrives, then closes clients with a
//! normal close code, kills managed PTYs (multiplexer sessions survive),
//! and force-exits if the graceful path overruns its deadline.

pub mod connection;
pub mod http;
pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::auth::TokenStore;
use crate::config::BrokerConfig;
use crate::constants::{SHUTDOWN_DEADLINE, TELEMETRY_INTERVAL};
use crate::mux::{Multiplexer, TmuxAdapter};
use crate::pty::PtySupervisor;
use crate::recovery::RecoveryService;
use crate::registry::{has_broker_prefix, RegistryEvent, TerminalRegistry};
use crate::router::OwnershipRouter;
use crate::server::connection::ConnectionManager;
use crate::server::protocol::ServerMessage;
use crate::spawn::SpawnOrchestrator;

/// Aggregate state shared by every connection task and background loop.
pub struct Broker {
    /// Runtime configuration.
    pub config: BrokerConfig,
    /// Process bearer token.
    pub auth: TokenStore,
    /// Multiplexer adapter.
    pub mux: Arc<dyn Multiplexer>,
    /// PTY supervisor.
    pub supervisor: Arc<PtySupervisor>,
    /// Terminal registry.
    pub registry: Arc<TerminalRegistry>,
    /// Live WebSocket connections.
    pub connections: Arc<ConnectionManager>,
    /// Terminal output ownership map.
    pub router: Arc<OwnershipRouter>,
    /// Spawn front end.
    pub spawner: SpawnOrchestrator,
    recovery_complete: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("port", &self.config.port)
            .field("terminals", &self.registry.get_active_terminal_count())
            .field("connections", &self.connections.active_count())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Build a broker against the real tmux adapter.
    ///
    /// Returns the broker and the registry event stream [`run`] consumes.
    #[must_use]
    pub fn new(config: BrokerConfig) -> (Arc<Self>, UnboundedReceiver<RegistryEvent>) {
        Self::with_mux(config, Arc::new(TmuxAdapter::new()))
    }

    /// Build a broker against a caller-supplied multiplexer.
    #[must_use]
    pub fn with_mux(
        config: BrokerConfig,
        mux: Arc<dyn Multiplexer>,
    ) -> (Arc<Self>, UnboundedReceiver<RegistryEvent>) {
        let auth = TokenStore::generate();

        let (pty_tx, pty_rx) = unbounded_channel();
        let supervisor = Arc::new(PtySupervisor::new(pty_tx));

        let (registry_tx, registry_rx) = unbounded_channel();
        let registry = TerminalRegistry::new(
            Arc::clone(&mux),
            Arc::clone(&supervisor),
            registry_tx,
            config.shell.clone(),
            config.home_dir.clone(),
        );
        registry.start_event_pump(pty_rx);

        let (shutdown_tx, _) = broadcast::channel(4);

        let broker = Arc::new(Self {
            config,
            auth,
            mux,
            supervisor,
            registry,
            connections: Arc::new(ConnectionManager::new()),
            router: Arc::new(OwnershipRouter::new()),
            spawner: SpawnOrchestrator::new(),
            recovery_complete: AtomicBool::new(false),
            shutdown_tx,
        });
        (broker, registry_rx)
    }

    /// Subscribe to the shutdown broadcast.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Ask every connection task to close and the server to stop.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Flag startup recovery as finished.
    pub fn mark_recovery_complete(&self) {
        self.recovery_complete.store(true, Ordering::Relaxed);
    }

    /// The registry snapshot message clients receive.
    ///
    /// Records are filtered to the broker's naming prefix so clients only
    /// see sessions this broker manages.
    #[must_use]
    pub fn terminals_message(&self) -> ServerMessage {
        let include_legacy = self.config.legacy_prefixes;
        let terminals = self
            .registry
            .get_all_terminals()
            .into_iter()
            .filter(|r| has_broker_prefix(&r.session_name, include_legacy))
            .collect();
        ServerMessage::Terminals {
            terminals,
            connection_count: self.connections.sidebar_count(),
            recovery_complete: self.recovery_complete.load(Ordering::Relaxed),
        }
    }

    /// Current telemetry snapshot.
    #[must_use]
    pub fn memory_stats_message(&self) -> ServerMessage {
        let (rss_mb, heap_used_mb) = memory_usage_mb();
        ServerMessage::MemoryStats {
            rss_mb,
            heap_used_mb,
            connection_count: self.connections.active_count(),
            terminal_count: self.registry.get_active_terminal_count(),
        }
    }
}

/// Serve the broker until shutdown completes.
pub async fn run(
    broker: Arc<Broker>,
    registry_events: UnboundedReceiver<RegistryEvent>,
) -> Result<()> {
    let pump = tokio::spawn(event_pump(Arc::clone(&broker), registry_events));
    let sweep = broker
        .router
        .start_sweep_task(Arc::clone(&broker.connections));
    let telemetry = tokio::spawn(telemetry_loop(Arc::clone(&broker)));
    tokio::spawn(Arc::new(RecoveryService::new()).run(Arc::clone(&broker)));

    let addr = broker.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("[server] listening on http://{addr}");

    let app = build_router(Arc::clone(&broker));
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(Arc::clone(&broker)))
        .await
        .context("serve")?;

    pump.abort();
    sweep.abort();
    telemetry.abort();

    // Kill managed PTYs; multiplexer sessions are preserved for recovery
    // by the next broker instance.
    let registry = Arc::clone(&broker.registry);
    let _ = tokio::task::spawn_blocking(move || registry.cleanup()).await;
    broker.auth.remove_file();
    log::info!("[server] shutdown complete");
    Ok(())
}

/// The axum application: WebSocket upgrade at `/` plus the narrow JSON API.
fn build_router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/", get(connection::ws_handler))
        .route("/api/auth/token", get(http::token_handler))
        .route("/api/spawn", post(http::spawn_handler))
        .with_state(broker)
}

/// Resolve when the broker should stop serving.
///
/// Signals are the only normal termination path. Once one arrives, client
/// tasks are told to close (code 1000) and a force-exit timer is armed in
/// case the graceful path wedges.
async fn wait_for_shutdown(broker: Arc<Broker>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut external = broker.subscribe_shutdown();

    tokio::select! {
        _ = term.recv() => log::info!("[server] SIGTERM received"),
        _ = int.recv() => log::info!("[server] SIGINT received"),
        _ = external.recv() => log::info!("[server] shutdown requested"),
    }

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        log::warn!("[server] graceful shutdown overran its deadline, exiting");
        std::process::exit(0);
    });

    broker.signal_shutdown();
}

/// Turn registry events into routed output and broadcasts.
async fn event_pump(broker: Arc<Broker>, mut events: UnboundedReceiver<RegistryEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::Output { id, data } => {
                let message = ServerMessage::TerminalOutput {
                    terminal_id: id.clone(),
                    data: String::from_utf8_lossy(&data).into_owned(),
                };
                broker.router.deliver(&broker.connections, &id, &message);
            }
            RegistryEvent::Closed { id } => {
                broker.router.remove_terminal(&id);
                broker
                    .connections
                    .broadcast(&ServerMessage::TerminalClosed { terminal_id: id });
            }
        }
    }
}

/// Periodic `memory-stats` broadcast. Informational only; clients must not
/// infer disconnection from its absence.
async fn telemetry_loop(broker: Arc<Broker>) {
    let mut interval = tokio::time::interval(TELEMETRY_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        broker.connections.broadcast(&broker.memory_stats_message());
    }
}

/// Process memory in MiB: `(rss, heap)`, best effort.
fn memory_usage_mb() -> (f64, f64) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let field = |name: &str| -> Option<f64> {
                status
                    .lines()
                    .find(|l| l.starts_with(name))?
                    .split_whitespace()
                    .nth(1)?
                    .parse::<f64>()
                    .ok()
                    .map(|kb| kb / 1024.0)
            };
            let rss = field("VmRSS:").unwrap_or(0.0);
            let heap = field("VmData:").unwrap_or(rss);
            return (rss, heap);
        }
    }
    (0.0, 0.0)
}

/// Whether a collaborator error message is known transient network noise.
///
/// Same-machine collaborator services (the TTS cache, DNS lookups they
/// trigger) time out routinely; those failures are demoted to debug logs
/// by substring match rather than alarming anyone. This is policy, not an
/// oversight — the broker itself never exits on an internal error.
#[must_use]
pub fn is_expected_network_error(message: &str) -> bool {
    const EXPECTED: &[&str] = &[
        "ETIMEDOUT",
        "ECONNRESET",
        "ENOTFOUND",
        "EAI_AGAIN",
        "getaddrinfo",
        "timed out",
    ];
    EXPECTED.iter().any(|needle| message.contains(needle))
}

/// Log a background failure at the right level for its kind.
pub(crate) fn log_background_error(context: &str, message: &str) {
    if is_expected_network_error(message) {
        log::debug!("[{context}] expected network error: {message}");
    } else {
        log::warn!("[{context}] {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_network_errors_match_by_substring() {
        assert!(is_expected_network_error(
            "request to http://localhost:5002/api/tts failed, reason: connect ETIMEDOUT"
        ));
        assert!(is_expected_network_error("getaddrinfo EAI_AGAIN tts.local"));
        assert!(is_expected_network_error("socket ECONNRESET"));
        assert!(!is_expected_network_error("terminal id collision: ctt-a-1"));
        assert!(!is_expected_network_error("permission denied"));
    }

    #[test]
    fn test_memory_usage_is_sane() {
        let (rss, heap) = memory_usage_mb();
        assert!(rss >= 0.0);
        assert!(heap >= 0.0);
        #[cfg(target_os = "linux")]
        assert!(rss > 0.0, "a running process has nonzero RSS");
    }

    #[tokio::test]
    async fn test_terminals_message_reports_recovery_flag() {
        let (broker, _events) = Broker::with_mux(
            crate::config::BrokerConfig::default(),
            Arc::new(crate::mux::TmuxAdapter::with_binary("missing-mux")),
        );
        match broker.terminals_message() {
            ServerMessage::Terminals {
                terminals,
                connection_count,
                recovery_complete,
            } => {
                assert!(terminals.is_empty());
                assert_eq!(connection_count, 0);
                assert!(!recovery_complete);
            }
            other => panic!("unexpected: {other:?}"),
        }

        broker.mark_recovery_complete();
        match broker.terminals_message() {
            ServerMessage::Terminals {
                recovery_complete, ..
            } => assert!(recovery_complete),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
