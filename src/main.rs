//! Utility-node overlay daemon.
//!
//! Wires the collaborator boundary (SPEC_FULL.md §1/§6 — chain, mempool,
//! wallet, peer transport are external services this crate consumes, not
//! owns) and drives the timer loop (`ThreadUtilityNodeTimers`, SPEC_FULL.md
//! §5): `SyncServiceNodeList` every 20s, `UpdateServiceNodeList` every 60s,
//! and — for a service node — `Ping` every 5 minutes.
//!
//! The real `ChainView`/`MempoolView`/`WalletView`/`PeerTransport`
//! implementations are host integration, out of scope per §1; this binary
//! wires the in-memory collaborators from `services` so the overlay itself
//! is runnable and observable end to end (see DESIGN.md).

use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use utilitynode::config::{self, Args, Role};
use utilitynode::node::control::ControlNode;
use utilitynode::node::service::ServiceNode;
use utilitynode::node::UtilityNode;
use utilitynode::rpc::{NodeHandle, RpcHandler};
use utilitynode::services::{
    InMemoryChain, InMemoryMempool, InMemoryTransport, InMemoryWallet, OverlayParams, Services,
    SystemClock,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("utilitynode=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    if let Err(err) = run(args).await {
        error!(%err, "utilitynode exited with an error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&args.data_dir)?;

    let chain_params = args.chain_params();
    let listen_address = args.listen_address();
    info!(
        role = ?args.role,
        network = if args.testnet { "testnet" } else { "mainnet" },
        %listen_address,
        "starting utility-node overlay"
    );

    let params = OverlayParams::new(chain_params);
    let services = Services {
        params,
        clock: Arc::new(SystemClock),
        chain: Arc::new(InMemoryChain::new()),
        mempool: Arc::new(InMemoryMempool::new()),
        wallet: Arc::new(InMemoryWallet::new()),
        transport: Arc::new(InMemoryTransport::new()),
    };

    let handle = match args.role {
        Role::Utility => NodeHandle::Utility(Arc::new(UtilityNode::new(services))),
        Role::Service => {
            let wif = args
                .shared_key
                .as_deref()
                .ok_or("--shared-key is required for role=service")?;
            let keypair = utilitynode::crypto::Keypair::from_wif(wif)?;
            let node = Arc::new(ServiceNode::new(services, keypair, listen_address));
            NodeHandle::Service(node)
        }
        Role::Control => {
            let node = ControlNode::new(services);
            if let Some(path) = &args.slaves_file {
                let slaves = config::load_slaves(path)?;
                info!(count = slaves.len(), "loaded slave configuration");
                node.load_slaves(slaves).await?;
            }
            NodeHandle::Control(Arc::new(node))
        }
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_timers(handle.clone(), shutdown_tx.subscribe());

    let rpc = RpcHandler::new(handle);
    if let Role::Control = args.role {
        info!(result = %rpc.test().await?, "control node ready");
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    let _ = shutdown_tx.send(());
    Ok(())
}

/// `ThreadUtilityNodeTimers`: one background task per cadence, matching the
/// host crate's `tokio::spawn` status-printer/event-loop pattern. Each loop
/// exits cooperatively on the shutdown broadcast (SPEC_FULL.md §5).
fn spawn_timers(handle: NodeHandle, mut shutdown: broadcast::Receiver<()>) {
    let sync_handle = handle.clone();
    let mut sync_shutdown = shutdown.resubscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(20));
        loop {
            tokio::select! {
                _ = interval.tick() => sync_handle.base().sync_service_node_list().await,
                _ = sync_shutdown.recv() => break,
            }
        }
    });

    let maintenance_handle = handle.clone();
    let mut maintenance_shutdown = shutdown.resubscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => run_maintenance(&maintenance_handle).await,
                _ = maintenance_shutdown.recv() => break,
            }
        }
    });

    if let NodeHandle::Service(node) = &handle {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = interval.tick() => { node.ping().await; }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}

async fn run_maintenance(handle: &NodeHandle) {
    match handle {
        NodeHandle::Utility(node) => node.update_service_node_list(&utilitynode::node::BaseHooks).await,
        NodeHandle::Service(node) => node.base.update_service_node_list(node.as_ref()).await,
        NodeHandle::Control(node) => node.base.update_service_node_list(node.as_ref()).await,
    }
}
