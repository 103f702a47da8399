//! RPC server: accept loop plus one request worker thread per connection.

use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{FsError, FsResult};
use crate::rpc::message::{
    encode_lookupstat_resp, encode_mkfls_resp, encode_stat_resp, encode_unit_resp, Request,
    RequestFrame,
};
use crate::rpc::{write_frame, MAX_FRAME_LEN};
use crate::server::Filesystem;

/// Poll interval for shutdown checks on otherwise-blocking reads.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RpcServer {
    listener: TcpListener,
    fs: Arc<dyn Filesystem>,
}

impl RpcServer {
    pub fn bind(addr: &str, fs: Arc<dyn Filesystem>) -> FsResult<Self> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| FsError::Io(format!("bind {addr}: {e}")))?;
        Ok(Self { listener, fs })
    }

    pub fn local_addr(&self) -> FsResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process exits.
    pub fn serve(self) -> FsResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        accept_loop(self.listener, self.fs, shutdown)
    }

    /// Serve on a background thread, returning a stop handle.
    pub fn spawn(self) -> FsResult<RpcServerHandle> {
        let addr = self.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name("gigafs-accept".to_string())
            .spawn(move || {
                if let Err(e) = accept_loop(self.listener, self.fs, flag) {
                    tracing::error!(error = %e, "rpc accept loop failed");
                }
            })
            .map_err(|e| FsError::Io(format!("spawn accept thread: {e}")))?;
        Ok(RpcServerHandle {
            addr,
            shutdown,
            thread: Some(thread),
        })
    }
}

pub struct RpcServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    fs: Arc<dyn Filesystem>,
    shutdown: Arc<AtomicBool>,
) -> FsResult<()> {
    listener.set_nonblocking(true)?;
    tracing::info!(addr = %listener.local_addr()?, "metadata server listening");
    let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted connection");
                let fs = fs.clone();
                let flag = shutdown.clone();
                let handle = std::thread::Builder::new()
                    .name("gigafs-conn".to_string())
                    .spawn(move || serve_conn(stream, fs, flag))
                    .map_err(|e| FsError::Io(format!("spawn worker: {e}")))?;
                if let Ok(mut workers) = workers.lock() {
                    workers.retain(|w| !w.is_finished());
                    workers.push(handle);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
    if let Ok(mut workers) = workers.lock() {
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
    Ok(())
}

fn serve_conn(mut stream: TcpStream, fs: Arc<dyn Filesystem>, shutdown: Arc<AtomicBool>) {
    if stream.set_nodelay(true).is_err() || stream.set_read_timeout(Some(POLL_INTERVAL)).is_err()
    {
        return;
    }
    loop {
        let body = match read_frame_polling(&mut stream, &shutdown) {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "connection closed");
                break;
            }
        };
        let response = dispatch(fs.as_ref(), &body);
        if let Err(e) = write_frame(&mut stream, &response) {
            tracing::debug!(error = %e, "failed to write response");
            break;
        }
    }
}

/// Read one frame, polling the shutdown flag while the connection is idle.
/// Returns `Ok(None)` on clean EOF or shutdown.
fn read_frame_polling(
    stream: &mut TcpStream,
    shutdown: &AtomicBool,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    if !fill(stream, &mut len, shutdown, true)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    if !fill(stream, &mut body, shutdown, false)? {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Fill `buf` from the stream. Read timeouts poll the shutdown flag; a clean
/// EOF is only tolerated before the first byte of a frame (`at_boundary`).
fn fill(
    stream: &mut TcpStream,
    buf: &mut [u8],
    shutdown: &AtomicBool,
    at_boundary: bool,
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if at_boundary && filled == 0 {
                    return Ok(false);
                }
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "eof inside frame",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                if shutdown.load(Ordering::SeqCst) {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn dispatch(fs: &dyn Filesystem, body: &[u8]) -> Vec<u8> {
    let frame = match RequestFrame::decode(body) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "undecodable request");
            return encode_unit_resp(&Err(e));
        }
    };
    let who = frame.who;
    let parent = frame.parent;
    match frame.body {
        Request::Lokup { name } => encode_lookupstat_resp(&fs.lokup(&who, &parent, &name)),
        Request::Mkdir { mode, name } => encode_stat_resp(&fs.mkdir(&who, &parent, &name, mode)),
        Request::Mkfle { mode, name } => encode_stat_resp(&fs.mkfle(&who, &parent, &name, mode)),
        Request::Mkfls { mode, n, namearr } => {
            encode_mkfls_resp(&fs.mkfls(&who, &parent, &namearr, n, mode))
        }
        Request::Bukin { dir } => encode_unit_resp(&fs.bukin(&who, &parent, &dir)),
        Request::Lstat { name } => encode_stat_resp(&fs.lstat(&who, &parent, &name)),
    }
}
