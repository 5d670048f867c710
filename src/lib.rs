//! tabz-broker library.
//!
//! A loopback-only backend that brokers interactive terminals for browser
//! clients: it owns PTY children attached to persistent tmux sessions,
//! fans their output out over WebSockets to explicitly-subscribed owners,
//! and survives restarts by re-adopting sessions the multiplexer kept
//! alive.

// Library modules
pub mod auth;
pub mod config;
pub mod constants;
pub mod mux;
pub mod pty;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod server;
pub mod spawn;

// Re-export commonly used types
pub use auth::TokenStore;
pub use config::BrokerConfig;
pub use mux::{Multiplexer, MuxError, TmuxAdapter};
pub use pty::{PtyEvent, PtySupervisor};
pub use registry::{RegistryEvent, TerminalRecord, TerminalRegistry, TerminalState};
pub use router::OwnershipRouter;
pub use server::protocol::{ClientKind, ClientMessage, ServerMessage, SpawnConfig};
pub use server::Broker;
pub use spawn::{SpawnOrchestrator, SpawnOutcome};
