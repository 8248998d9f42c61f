//! KV server binary
//!
//! Runs one node of a replicated KV cluster, with separate listeners for
//! Raft RPC between nodes and for the client API.
//!
//! Example for a 3-node cluster:
//!   kv-server --id 1 --raft-addr 127.0.0.1:8001 --api-addr 127.0.0.1:9001 \
//!     --data-dir /tmp/kv1 --peer 2=127.0.0.1:8002 --peer 3=127.0.0.1:8003
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use raft_kv::api::create_client_router;
use raft_kv::core::{RaftConfig, RaftCore, RaftServer};
use raft_kv::state_machine::{KvConfig, KvServer};
use raft_kv::storage::FileStorage;
use raft_kv::transport::http::create_router;
use raft_kv::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(version, about = "Run one node of a replicated key-value store")]
struct Args {
    /// Node ID, unique in the cluster
    #[arg(long)]
    id: u64,

    /// Listen address for Raft RPC from peers
    #[arg(long)]
    raft_addr: SocketAddr,

    /// Listen address for the client API
    #[arg(long)]
    api_addr: SocketAddr,

    /// Directory for persisted state and snapshots
    #[arg(long)]
    data_dir: PathBuf,

    /// Peer as ID=ADDR; repeat for each peer
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(u64, String)>,

    /// Snapshot once persisted raft state reaches this many bytes
    #[arg(long)]
    max_raft_state: Option<usize>,

    #[arg(long, default_value_t = 100)]
    heartbeat_ms: u64,

    /// Per-call timeout for peer RPCs
    #[arg(long, default_value_t = 500)]
    rpc_timeout_ms: u64,
}

fn parse_peer(s: &str) -> Result<(u64, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got {:?}", s))?;
    let id = id
        .parse()
        .map_err(|e| format!("invalid peer id {:?}: {}", id, e))?;
    if addr.is_empty() {
        return Err(format!("missing address for peer {}", id));
    }
    Ok((id, addr.to_string()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let peers: HashMap<u64, String> = args.peers.into_iter().collect();
    if peers.contains_key(&args.id) {
        anyhow::bail!("--peer must not list this node ({})", args.id);
    }
    info!(node = args.id, ?peers, data_dir = %args.data_dir.display(), "starting");

    let storage = FileStorage::new(&args.data_dir)
        .with_context(|| format!("opening data dir {}", args.data_dir.display()))?;
    let transport = HttpTransport::new(peers.clone(), Duration::from_millis(args.rpc_timeout_ms))?;
    let core = RaftCore::new(args.id, peers.keys().copied().collect(), Box::new(storage))
        .context("loading persisted state")?;

    let raft_config =
        RaftConfig::default().with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms));
    let kv_config = KvConfig {
        max_raft_state: args.max_raft_state,
        ..KvConfig::default()
    };

    let (raft, apply_rx) = RaftServer::with_config(core, transport, raft_config);
    let raft_router = create_router(raft.rpc_handler());
    let kv = KvServer::start(raft, apply_rx, kv_config);
    let client_router = create_client_router(kv);

    let raft_listener = TcpListener::bind(args.raft_addr)
        .await
        .with_context(|| format!("binding {}", args.raft_addr))?;
    info!(node = args.id, addr = %args.raft_addr, "raft rpc listening");
    let raft_server = tokio::spawn(async move { axum::serve(raft_listener, raft_router).await });

    let api_listener = TcpListener::bind(args.api_addr)
        .await
        .with_context(|| format!("binding {}", args.api_addr))?;
    info!(node = args.id, addr = %args.api_addr, "client api listening");
    axum::serve(api_listener, client_router).await?;

    raft_server.await??;
    Ok(())
}
