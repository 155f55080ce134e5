use std::sync::Arc;

use clap::Parser;

use ferrofs_config::{Config, ConfigManager};
use ferrofs_logging::LogConfig;
use ferrofs_mds::stubs::{
    MemoryJournalBackend, StubBalancer, StubCache, StubLocker, StubMessenger, StubMigrator,
    StubMonitorClient, StubObjectClient, StubRankDispatcher, StubServer, StubSnapClient,
    StubSnapServer,
};
use ferrofs_mds::subsystems::ExecRespawn;
use ferrofs_mds::{Mds, MdsConfig, SharedClients, Subsystems};
use ferrofs_proto::DaemonState;

/// ferrofs Metadata Server
#[derive(Parser, Debug)]
#[command(name = "ferrofs-mds-server", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mds-server.toml")]
    config: String,

    /// Monitor-assigned global id for this instance
    #[arg(long, default_value_t = 1)]
    global_id: u64,

    /// Start in this state (boot or dne)
    #[arg(long, default_value = "boot")]
    initial_state: String,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,

    /// Directory for log files (console only if unset)
    #[arg(long)]
    log_dir: Option<std::path::PathBuf>,
}

async fn wait_for_shutdown_signal() -> i32 {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => { tracing::info!("received CTRL+C"); libc::SIGINT }
        _ = sigterm.recv() => { tracing::info!("received SIGTERM"); libc::SIGTERM }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let orig_argv: Vec<String> = std::env::args().collect();
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", MdsConfig::default().render());
        return Ok(());
    }

    let _log_guard = ferrofs_logging::init_logging(&LogConfig {
        log_dir: args.log_dir.clone(),
        ..LogConfig::default()
    });

    let config = ConfigManager::<MdsConfig>::load_or_default(&args.config)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {}", args.config, e))?;
    let config = Arc::new(config);

    let cfg = config.snapshot();
    tracing::info!(
        name = %cfg.name,
        global_id = args.global_id,
        config = %args.config,
        "starting ferrofs metadata server"
    );

    // Until the real sub-systems land, the daemon runs against the
    // in-memory implementations.
    let subsystems = Subsystems {
        mdcache: Box::new(StubCache::new()),
        migrator: Box::new(StubMigrator::new()),
        balancer: Box::new(StubBalancer::new()),
        snap_server: Box::new(StubSnapServer::new()),
        snap_client: Box::new(StubSnapClient::new()),
        locker: Box::new(StubLocker::new()),
        server: Box::new(StubServer::new()),
        rank_dispatcher: Box::new(StubRankDispatcher::new()),
    };
    let clients = SharedClients {
        monc: Arc::new(StubMonitorClient::new()),
        objecter: Arc::new(StubObjectClient::new()),
        messenger: Arc::new(StubMessenger::new()),
        journal_backend: Arc::new(MemoryJournalBackend::new()),
        process: Arc::new(ExecRespawn { argv: orig_argv }),
    };

    let mds = Mds::new(
        ferrofs_types::GlobalId(args.global_id),
        config,
        subsystems,
        clients,
    );

    let initial_state = match args.initial_state.as_str() {
        "dne" => DaemonState::Dne,
        _ => DaemonState::Boot,
    };
    mds.init(initial_state)
        .await
        .map_err(|e| anyhow::anyhow!("init failed: {}", e))?;

    tracing::info!("mds initialization complete");
    let signum = wait_for_shutdown_signal().await;
    mds.handle_signal(signum).await;
    tracing::info!("mds shut down");

    Ok(())
}
