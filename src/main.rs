//! tabz-broker binary entry point.
//!
//! Parses flags, initializes logging, assembles the [`Broker`], and serves
//! until a signal arrives. See the `tabz_broker` library for the core.

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use tabz_broker::{config::DEFAULT_PORT, server, Broker, BrokerConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Terminal session broker for browser terminal tabs.
#[derive(Debug, Parser)]
#[command(name = "tabz-broker")]
#[command(about = "Loopback terminal session broker for browser terminal tabs")]
struct Cli {
    /// Port to bind on 127.0.0.1.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Skip session recovery; tear down any surviving PTYs instead.
    #[arg(long)]
    force_clean: bool,

    /// Also adopt sessions named with legacy prefixes during recovery.
    #[arg(long)]
    legacy_prefixes: bool,

    /// Shell for terminals that do not attach to the multiplexer.
    #[arg(long)]
    shell: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let mut config = BrokerConfig {
        port: cli.port,
        force_clean: cli.force_clean,
        legacy_prefixes: cli.legacy_prefixes,
        ..BrokerConfig::default()
    };
    if let Some(shell) = cli.shell {
        config.shell = shell;
    }
    config.apply_env_overrides();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (broker, registry_events) = Broker::new(config);
        log::info!(
            "tabz-broker starting on 127.0.0.1:{} (force_clean={})",
            broker.config.port,
            broker.config.force_clean
        );
        server::run(broker, registry_events).await
    })
}
