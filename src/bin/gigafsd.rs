//! GigaFS metadata server daemon.
//!
//! Usage:
//!   gigafsd --listen 0.0.0.0:50128 --db /data/gigafs
//!   gigafsd --config server.toml --srv-id 1 --peer host0:50128 --peer host1:50128

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use gigafs::config::ServerConfig;
use gigafs::db::{FjallDb, DB_ENV_PREFIX};
use gigafs::logging;
use gigafs::rpc::client::{server_stubs, RpcClient, RpcClientOptions};
use gigafs::rpc::server::RpcServer;
use gigafs::server::MetadataEngine;

/// GigaFS metadata server
#[derive(Parser)]
#[command(name = "gigafsd")]
#[command(about = "GigaFS metadata server daemon")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Store directory (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// This server's id (overrides config)
    #[arg(long)]
    srv_id: Option<u32>,

    /// Peer server addresses in server-id order, this server included.
    /// Required for multi-server deployments so partition splits can ship
    /// records to their new owner.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.node.listen_addr = listen;
    }
    if let Some(db) = args.db {
        config.node.db_path = db;
    }
    if let Some(srv_id) = args.srv_id {
        config.fs.srv_id = srv_id;
    }
    if let Some(level) = args.log_level {
        config.node.log_level = level;
    }
    if !args.peers.is_empty() {
        config.fs.dir_index.num_servers = args.peers.len() as u32;
        if config.fs.dir_index.num_virtual_servers < config.fs.dir_index.num_servers {
            config.fs.dir_index.num_virtual_servers = config.fs.dir_index.num_servers;
        }
    }
    config.validate()?;

    logging::init_for_server(&config.node.log_level, config.fs.srv_id);
    tracing::info!(
        srv_id = config.fs.srv_id,
        db = %config.node.db_path.display(),
        "starting metadata server"
    );

    let mut db_options = config.db.clone();
    db_options.read_from_env(DB_ENV_PREFIX);
    std::fs::create_dir_all(&config.node.db_path)?;
    let db = Arc::new(FjallDb::open(&config.node.db_path, &db_options)?);
    let engine = MetadataEngine::open(db, config.fs.clone())?;

    if !args.peers.is_empty() {
        let rpc = RpcClient::new(args.peers, RpcClientOptions::default());
        engine.set_peers(server_stubs(&rpc));
    }

    let server = RpcServer::bind(&config.node.listen_addr, engine.clone())?;
    tracing::info!(addr = %server.local_addr()?, "serving");
    let result = server.serve();
    engine.flush()?;
    Ok(result?)
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("gigafsd: {e}");
        std::process::exit(1);
    }
}
