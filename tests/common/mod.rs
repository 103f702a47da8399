//! Shared harness: in-process metadata servers on loopback TCP.

use std::sync::Arc;

use gigafs::db::{MemDb, MetaDb};
use gigafs::rpc::client::{server_stubs, RpcClient, RpcClientOptions};
use gigafs::rpc::server::{RpcServer, RpcServerHandle};
use gigafs::server::{FilesystemOptions, MetadataEngine};

pub struct TestServer {
    pub engine: Arc<MetadataEngine>,
    pub handle: RpcServerHandle,
    pub db: Arc<dyn MetaDb>,
}

impl TestServer {
    pub fn addr(&self) -> String {
        self.handle.addr().to_string()
    }
}

/// Start one server with the given options on an ephemeral port.
pub fn start_server(options: FilesystemOptions) -> TestServer {
    start_server_on(Arc::new(MemDb::new()), options)
}

pub fn start_server_on(db: Arc<dyn MetaDb>, options: FilesystemOptions) -> TestServer {
    let engine = MetadataEngine::open(db.clone(), options).expect("open engine");
    let server = RpcServer::bind("127.0.0.1:0", engine.clone()).expect("bind");
    let handle = server.spawn().expect("spawn server");
    TestServer { engine, handle, db }
}

/// Start `n` servers sharing one geometry and wire them as peers.
pub fn start_cluster(mut options: FilesystemOptions, n: u32) -> Vec<TestServer> {
    options.dir_index.num_servers = n;
    if options.dir_index.num_virtual_servers < n {
        options.dir_index.num_virtual_servers = n;
    }
    let servers: Vec<TestServer> = (0..n)
        .map(|srv_id| {
            start_server(FilesystemOptions {
                srv_id,
                ..options.clone()
            })
        })
        .collect();
    let addrs: Vec<String> = servers.iter().map(|s| s.addr()).collect();
    for server in &servers {
        let rpc = RpcClient::new(addrs.clone(), RpcClientOptions::default());
        server.engine.set_peers(server_stubs(&rpc));
    }
    servers
}
