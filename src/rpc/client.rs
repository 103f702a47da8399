//! RPC client: pooled connections and per-server filesystem stubs.
//!
//! One TCP connection per server, created lazily and serialized by a
//! per-connection mutex; a failed exchange drops the connection so the next
//! call reconnects. Calls carry a timeout and surface `Timeout` without
//! retrying; there is no in-flight cancellation.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{FsError, FsResult};
use crate::rpc::message::{
    decode_lookupstat_resp, decode_mkfls_resp, decode_stat_resp, decode_unit_resp, Request,
    RequestFrame,
};
use crate::rpc::{read_frame, write_frame};
use crate::server::{Filesystem, MkflsRet};
use crate::types::{LookupStat, Stat, User};

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    /// Per-call deadline covering connect, send, and receive.
    pub rpc_timeout: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

pub struct RpcClient {
    addrs: Vec<String>,
    options: RpcClientOptions,
    conns: Mutex<HashMap<u32, Arc<Mutex<TcpStream>>>>,
}

impl RpcClient {
    pub fn new(addrs: Vec<String>, options: RpcClientOptions) -> Arc<Self> {
        Arc::new(Self {
            addrs,
            options,
            conns: Mutex::new(HashMap::new()),
        })
    }

    pub fn num_servers(&self) -> u32 {
        self.addrs.len() as u32
    }

    fn connect(&self, srv: u32) -> FsResult<TcpStream> {
        let uri = self
            .addrs
            .get(srv as usize)
            .ok_or_else(|| FsError::InvalidArgument(format!("no address for server {srv}")))?;
        let addr = uri
            .to_socket_addrs()
            .map_err(|e| FsError::Io(format!("resolve {uri}: {e}")))?
            .next()
            .ok_or_else(|| FsError::Io(format!("{uri} resolves to nothing")))?;
        let stream = TcpStream::connect_timeout(&addr, self.options.rpc_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.options.rpc_timeout))?;
        stream.set_write_timeout(Some(self.options.rpc_timeout))?;
        tracing::debug!(server = srv, %addr, "connected to metadata server");
        Ok(stream)
    }

    fn conn(&self, srv: u32) -> FsResult<Arc<Mutex<TcpStream>>> {
        let mut conns = self
            .conns
            .lock()
            .map_err(|_| FsError::Io("rpc client lock poisoned".to_string()))?;
        if let Some(conn) = conns.get(&srv) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(Mutex::new(self.connect(srv)?));
        conns.insert(srv, conn.clone());
        Ok(conn)
    }

    fn drop_conn(&self, srv: u32) {
        if let Ok(mut conns) = self.conns.lock() {
            conns.remove(&srv);
        }
    }

    /// One message pair against server `srv`.
    pub fn call(&self, srv: u32, request: &[u8]) -> FsResult<Vec<u8>> {
        let conn = self.conn(srv)?;
        let mut stream = conn
            .lock()
            .map_err(|_| FsError::Io("rpc connection lock poisoned".to_string()))?;
        let exchange = (|| -> std::io::Result<Vec<u8>> {
            write_frame(&mut *stream, request)?;
            read_frame(&mut *stream)
        })();
        match exchange {
            Ok(response) => Ok(response),
            Err(e) => {
                // A half-exchanged connection cannot be reused.
                self.drop_conn(srv);
                if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock {
                    tracing::warn!(server = srv, "rpc timed out");
                    Err(FsError::Timeout)
                } else {
                    Err(FsError::Io(format!("rpc to server {srv}: {e}")))
                }
            }
        }
    }
}

/// [`Filesystem`] stub routing every call to one server.
pub struct RpcStub {
    client: Arc<RpcClient>,
    srv: u32,
}

impl RpcStub {
    pub fn new(client: Arc<RpcClient>, srv: u32) -> Self {
        Self { client, srv }
    }

    fn exchange(&self, who: &User, parent: &LookupStat, body: Request) -> FsResult<Vec<u8>> {
        let frame = RequestFrame {
            who: *who,
            parent: *parent,
            body,
        };
        self.client.call(self.srv, &frame.encode())
    }
}

impl Filesystem for RpcStub {
    fn lokup(&self, who: &User, parent: &LookupStat, name: &str) -> FsResult<LookupStat> {
        let resp = self.exchange(
            who,
            parent,
            Request::Lokup {
                name: name.to_string(),
            },
        )?;
        decode_lookupstat_resp(&resp)
    }

    fn mkdir(&self, who: &User, parent: &LookupStat, name: &str, mode: u32) -> FsResult<Stat> {
        let resp = self.exchange(
            who,
            parent,
            Request::Mkdir {
                mode,
                name: name.to_string(),
            },
        )?;
        decode_stat_resp(&resp)
    }

    fn mkfle(&self, who: &User, parent: &LookupStat, name: &str, mode: u32) -> FsResult<Stat> {
        let resp = self.exchange(
            who,
            parent,
            Request::Mkfle {
                mode,
                name: name.to_string(),
            },
        )?;
        decode_stat_resp(&resp)
    }

    fn mkfls(
        &self,
        who: &User,
        parent: &LookupStat,
        namearr: &[u8],
        n: u32,
        mode: u32,
    ) -> FsResult<MkflsRet> {
        let resp = self.exchange(
            who,
            parent,
            Request::Mkfls {
                mode,
                n,
                namearr: namearr.to_vec(),
            },
        )?;
        decode_mkfls_resp(&resp)
    }

    fn bukin(&self, who: &User, parent: &LookupStat, dir: &str) -> FsResult<()> {
        let resp = self.exchange(
            who,
            parent,
            Request::Bukin {
                dir: dir.to_string(),
            },
        )?;
        decode_unit_resp(&resp)
    }

    fn lstat(&self, who: &User, parent: &LookupStat, name: &str) -> FsResult<Stat> {
        let resp = self.exchange(
            who,
            parent,
            Request::Lstat {
                name: name.to_string(),
            },
        )?;
        decode_stat_resp(&resp)
    }
}

/// One stub per configured server.
pub fn server_stubs(client: &Arc<RpcClient>) -> Vec<Arc<dyn Filesystem>> {
    (0..client.num_servers())
        .map(|srv| Arc::new(RpcStub::new(client.clone(), srv)) as Arc<dyn Filesystem>)
        .collect()
}
