//! Lease-protected batched creates.
//!
//! A batch holds one write buffer per directory partition. Creates append
//! length-prefixed names to the owning buffer; a buffer that reaches the
//! configured size spills to a background flush, and commit drains the rest
//! synchronously. Flushes go out as one `mkfls` per `(partition, server)`
//! and retry the uncreated tail, so the client never round-trips per name.
//! Buffered names are invisible to lookups until the batch commits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::client::cache::Dir;
use crate::client::{DirHandle, FilesystemCli, FilesystemCliOptions};
use crate::error::{FsError, FsResult};
use crate::giga::{giga_hash, DirIndex};
use crate::keys::{get_length_prefixed, put_length_prefixed};
use crate::server::Filesystem;
use crate::types::{validate_name, LookupStat, User};

fn lock_poisoned() -> FsError {
    FsError::Io("batch lock poisoned".to_string())
}

/// Packed, length-prefixed names bound for one partition.
#[derive(Default)]
struct PackedNames {
    bytes: Vec<u8>,
    n: u32,
}

#[derive(Default)]
struct WriBuf {
    names: Mutex<PackedNames>,
}

struct BgState {
    inflight: usize,
    status: Option<FsError>,
}

/// Client-side state of one open batch.
pub(crate) struct BatchedCreates {
    who: User,
    mode: u32,
    parent: LookupStat,
    dir: Arc<Dir>,
    bufs: Vec<WriBuf>,
    done: AtomicBool,
    bg: Mutex<BgState>,
    cv: Condvar,
}

impl BatchedCreates {
    fn latch(&self, e: FsError) {
        if let Ok(mut bg) = self.bg.lock() {
            if bg.status.is_none() {
                bg.status = Some(e);
            }
        }
    }
}

/// Public handle to an open batch. Holding it keeps the batch (and its
/// parent-directory registration) alive.
pub struct BatchHandle {
    pub(crate) inner: Arc<BatchedCreates>,
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle").finish_non_exhaustive()
    }
}

impl BatchHandle {
    pub fn dir_id(&self) -> crate::types::DirId {
        self.inner.parent.id()
    }
}

/// Drop the first `k` length-prefixed names from a packed buffer.
fn drop_packed(bytes: &mut Vec<u8>, k: u32) -> FsResult<()> {
    let mut cursor = &bytes[..];
    for _ in 0..k {
        if get_length_prefixed(&mut cursor).is_none() {
            return Err(FsError::Io("server created more names than sent".to_string()));
        }
    }
    let consumed = bytes.len() - cursor.len();
    bytes.drain(..consumed);
    Ok(())
}

/// Re-group packed names by owning partition under a refreshed index.
fn rebucket(
    giga: &DirIndex,
    mut bytes: &[u8],
    n: u32,
) -> FsResult<Vec<(u32, PackedNames)>> {
    let mut groups: Vec<(u32, PackedNames)> = Vec::new();
    for _ in 0..n {
        let raw = get_length_prefixed(&mut bytes)
            .ok_or_else(|| FsError::Io("truncated batch buffer".to_string()))?;
        let name = String::from_utf8(raw)
            .map_err(|_| FsError::Io("non-utf8 name in batch buffer".to_string()))?;
        let partition = giga.partition_of(giga_hash(&name));
        let slot = match groups.iter_mut().find(|(p, _)| *p == partition) {
            Some((_, slot)) => slot,
            None => {
                groups.push((partition, PackedNames::default()));
                &mut groups.last_mut().expect("just pushed").1
            }
        };
        put_length_prefixed(&mut slot.bytes, name.as_bytes());
        slot.n += 1;
    }
    Ok(groups)
}

/// Shared flush core used by both the commit path and the background pool.
pub(crate) struct Flusher {
    stubs: Vec<Arc<dyn Filesystem>>,
    max_index_retries: u32,
}

impl Flusher {
    /// Send one buffer as `mkfls` calls until every name is created or a
    /// hard error stops the batch. Conflicting names are skipped (and the
    /// conflict latched) so the rest of the buffer still lands; an index
    /// redirect re-buckets the remainder.
    fn flush(
        &self,
        bat: &BatchedCreates,
        mut partition: u32,
        mut bytes: Vec<u8>,
        mut n: u32,
    ) -> FsResult<()> {
        let mut attempts = 0;
        while n > 0 {
            let srv = {
                let giga = bat.dir.giga.read().map_err(|_| lock_poisoned())?;
                giga.server_of(partition)
            };
            let stub = self
                .stubs
                .get(srv as usize)
                .ok_or_else(|| FsError::InvalidArgument(format!("no stub for server {srv}")))?;
            let ret = stub.mkfls(&bat.who, &bat.parent, &bytes, n, bat.mode)?;
            let created = ret.n.min(n);
            drop_packed(&mut bytes, created)?;
            n -= created;
            match ret.err {
                None => {}
                Some(FsError::AlreadyExists(name)) => {
                    tracing::warn!(%name, "batched create conflicts, skipping");
                    bat.latch(FsError::AlreadyExists(name));
                    if n > 0 {
                        drop_packed(&mut bytes, 1)?;
                        n -= 1;
                    }
                }
                Some(FsError::StaleDirIndex { snapshot }) if attempts < self.max_index_retries => {
                    attempts += 1;
                    if let Some(snapshot) = snapshot {
                        let newer = DirIndex::decode(&snapshot)?;
                        let mut giga = bat.dir.giga.write().map_err(|_| lock_poisoned())?;
                        giga.merge(&newer)?;
                    }
                    let groups = {
                        let giga = bat.dir.giga.read().map_err(|_| lock_poisoned())?;
                        rebucket(&giga, &bytes, n)?
                    };
                    if groups.len() == 1 {
                        let (p, packed) = groups.into_iter().next().expect("one group");
                        partition = p;
                        bytes = packed.bytes;
                        n = packed.n;
                    } else {
                        for (p, packed) in groups {
                            self.flush(bat, p, packed.bytes, packed.n)?;
                        }
                        return Ok(());
                    }
                }
                Some(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct FlushJob {
    bat: Arc<BatchedCreates>,
    partition: u32,
    bytes: Vec<u8>,
    n: u32,
}

fn run_job(flusher: &Flusher, job: FlushJob) {
    let result = flusher.flush(&job.bat, job.partition, job.bytes, job.n);
    if let Err(e) = result {
        tracing::warn!(error = %e, "background batch flush failed");
        job.bat.latch(e);
    }
    if let Ok(mut bg) = job.bat.bg.lock() {
        bg.inflight -= 1;
    }
    job.bat.cv.notify_all();
}

/// Small worker pool draining background flushes.
pub(crate) struct FlusherPool {
    flusher: Arc<Flusher>,
    tx: Mutex<Option<mpsc::Sender<FlushJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FlusherPool {
    pub(crate) fn start(
        stubs: Vec<Arc<dyn Filesystem>>,
        options: &FilesystemCliOptions,
    ) -> Self {
        let flusher = Arc::new(Flusher {
            stubs,
            max_index_retries: options.max_index_retries,
        });
        let (tx, rx) = mpsc::channel::<FlushJob>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..options.background_flushers.max(1))
            .map(|i| {
                let rx = rx.clone();
                let flusher = flusher.clone();
                std::thread::Builder::new()
                    .name(format!("gigafs-flush-{i}"))
                    .spawn(move || loop {
                        let job = match rx.lock() {
                            Ok(rx) => rx.recv(),
                            Err(_) => break,
                        };
                        match job {
                            Ok(job) => run_job(&flusher, job),
                            Err(_) => break,
                        }
                    })
                    .expect("spawn flusher thread")
            })
            .collect();
        Self {
            flusher,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    fn submit(&self, job: FlushJob) -> Result<(), FlushJob> {
        match self.tx.lock() {
            Ok(tx) => match tx.as_ref() {
                Some(tx) => tx.send(job).map_err(|e| e.0),
                None => Err(job),
            },
            Err(_) => Err(job),
        }
    }
}

impl Drop for FlusherPool {
    fn drop(&mut self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

impl FilesystemCli {
    /// Open a batch of creates under the directory named by `pathname`.
    /// At most one batch may be open per directory at a time.
    pub fn batch_start(
        &self,
        who: &User,
        at: Option<&DirHandle>,
        pathname: &str,
        mode: u32,
    ) -> FsResult<BatchHandle> {
        let handle = self.atdir(who, at, pathname)?;
        let lease = handle.lease;
        let id = lease.id();
        let dir = self.acquire_dir(&id, lease.zeroth_server)?;
        let mut batches = self.batches.lock().map_err(|_| lock_poisoned())?;
        batches.retain(|_, open| open.strong_count() > 0);
        if batches.contains_key(&id) {
            return Err(FsError::BatchInProgress);
        }
        let slots = self.options.dir_index.max_partitions as usize;
        let bat = Arc::new(BatchedCreates {
            who: *who,
            mode,
            parent: lease,
            dir,
            bufs: (0..slots).map(|_| WriBuf::default()).collect(),
            done: AtomicBool::new(false),
            bg: Mutex::new(BgState {
                inflight: 0,
                status: None,
            }),
            cv: Condvar::new(),
        });
        batches.insert(id, Arc::downgrade(&bat));
        tracing::debug!(dir = %id, "opened create batch");
        Ok(BatchHandle { inner: bat })
    }

    /// Buffer one create. Spills the owning buffer to a background flush
    /// once it reaches the configured batch size.
    pub fn batch_creat(&self, batch: &BatchHandle, name: &str) -> FsResult<()> {
        let bat = &batch.inner;
        if bat.done.load(Ordering::SeqCst) {
            return Err(FsError::InvalidArgument(
                "batch already committed".to_string(),
            ));
        }
        validate_name(name)?;
        let partition = {
            let giga = bat.dir.giga.read().map_err(|_| lock_poisoned())?;
            giga.partition_of(giga_hash(name))
        };
        let buf = bat
            .bufs
            .get(partition as usize)
            .ok_or_else(|| FsError::InvalidArgument(format!("partition {partition} out of range")))?;
        let spill = {
            let mut names = buf.names.lock().map_err(|_| lock_poisoned())?;
            put_length_prefixed(&mut names.bytes, name.as_bytes());
            names.n += 1;
            if names.bytes.len() >= self.options.batch_size {
                let bytes = std::mem::take(&mut names.bytes);
                let n = std::mem::replace(&mut names.n, 0);
                Some((bytes, n))
            } else {
                None
            }
        };
        if let Some((bytes, n)) = spill {
            self.spawn_flush(bat, partition, bytes, n);
        }
        Ok(())
    }

    fn spawn_flush(&self, bat: &Arc<BatchedCreates>, partition: u32, bytes: Vec<u8>, n: u32) {
        if let Ok(mut bg) = bat.bg.lock() {
            bg.inflight += 1;
        }
        let job = FlushJob {
            bat: bat.clone(),
            partition,
            bytes,
            n,
        };
        if let Err(job) = self.flushers.submit(job) {
            // Pool already shut down; flush on the caller's thread.
            run_job(&self.flushers.flusher, job);
        }
    }

    /// Drain every buffer, wait out in-flight background flushes, and mark
    /// the batch done. Returns the first flush error if any flush failed.
    pub fn batch_commit(&self, batch: &BatchHandle) -> FsResult<()> {
        let bat = &batch.inner;
        for (partition, buf) in bat.bufs.iter().enumerate() {
            let taken = {
                let mut names = buf.names.lock().map_err(|_| lock_poisoned())?;
                if names.n == 0 {
                    None
                } else {
                    let bytes = std::mem::take(&mut names.bytes);
                    let n = std::mem::replace(&mut names.n, 0);
                    Some((bytes, n))
                }
            };
            if let Some((bytes, n)) = taken {
                if let Err(e) = self.flushers.flusher.flush(bat, partition as u32, bytes, n) {
                    bat.latch(e);
                }
            }
        }
        let mut bg = bat.bg.lock().map_err(|_| lock_poisoned())?;
        while bg.inflight > 0 {
            bg = bat.cv.wait(bg).map_err(|_| lock_poisoned())?;
        }
        bat.done.store(true, Ordering::SeqCst);
        match bg.status.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close a batch, releasing its parent-directory registration. Ending a
    /// batch that buffered creates without committing is a protocol error.
    pub fn batch_end(&self, batch: BatchHandle) -> FsResult<()> {
        let bat = batch.inner;
        if !bat.done.load(Ordering::SeqCst) {
            let dirty = bat.bufs.iter().any(|buf| {
                buf.names
                    .lock()
                    .map(|names| names.n > 0)
                    .unwrap_or(true)
            });
            if dirty {
                return Err(FsError::InvalidArgument(
                    "batch ended with uncommitted creates".to_string(),
                ));
            }
        }
        if let Ok(mut batches) = self.batches.lock() {
            batches.remove(&bat.parent.id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemDb;
    use crate::server::{FilesystemOptions, MetadataEngine};

    fn who() -> User {
        User::new(1, 1)
    }

    fn local_cli(fs_options: FilesystemOptions, cli_options: FilesystemCliOptions) -> FilesystemCli {
        let engine = MetadataEngine::open(Arc::new(MemDb::new()), fs_options).unwrap();
        FilesystemCli::open_local(engine, cli_options).unwrap()
    }

    #[test]
    fn test_batch_creates_visible_after_commit() {
        let cli = local_cli(FilesystemOptions::default(), FilesystemCliOptions::default());
        cli.mkdir(&who(), None, "/bulk", 0o777).unwrap();
        let batch = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
        for i in 0..100 {
            cli.batch_creat(&batch, &format!("f{i}")).unwrap();
        }
        // Buffered names are invisible until commit.
        assert!(cli
            .lstat(&who(), None, "/bulk/f0")
            .unwrap_err()
            .is_not_found());
        cli.batch_commit(&batch).unwrap();
        cli.batch_end(batch).unwrap();
        for i in 0..100 {
            cli.lstat(&who(), None, &format!("/bulk/f{i}")).unwrap();
        }
    }

    #[test]
    fn test_background_spill() {
        // A tiny batch size forces background flushes along the way.
        let cli = local_cli(
            FilesystemOptions::default(),
            FilesystemCliOptions {
                batch_size: 32,
                ..FilesystemCliOptions::default()
            },
        );
        cli.mkdir(&who(), None, "/bulk", 0o777).unwrap();
        let batch = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
        for i in 0..500 {
            cli.batch_creat(&batch, &format!("spill{i}")).unwrap();
        }
        cli.batch_commit(&batch).unwrap();
        cli.batch_end(batch).unwrap();
        for i in 0..500 {
            cli.lstat(&who(), None, &format!("/bulk/spill{i}")).unwrap();
        }
    }

    #[test]
    fn test_second_batch_on_same_parent_rejected() {
        let cli = local_cli(FilesystemOptions::default(), FilesystemCliOptions::default());
        cli.mkdir(&who(), None, "/bulk", 0o777).unwrap();
        let first = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
        assert_eq!(
            cli.batch_start(&who(), None, "/bulk", 0o660).unwrap_err(),
            FsError::BatchInProgress
        );
        // A different parent is fine.
        cli.mkdir(&who(), None, "/other", 0o777).unwrap();
        let other = cli.batch_start(&who(), None, "/other", 0o660).unwrap();
        cli.batch_commit(&first).unwrap();
        cli.batch_end(first).unwrap();
        // Once the first batch ends, its parent is free again.
        let second = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
        cli.batch_commit(&second).unwrap();
        cli.batch_end(second).unwrap();
        cli.batch_commit(&other).unwrap();
        cli.batch_end(other).unwrap();
    }

    #[test]
    fn test_batch_end_requires_commit() {
        let cli = local_cli(FilesystemOptions::default(), FilesystemCliOptions::default());
        cli.mkdir(&who(), None, "/bulk", 0o777).unwrap();
        let batch = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
        cli.batch_creat(&batch, "pending").unwrap();
        let err = cli.batch_end(batch).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
        // An empty uncommitted batch may be ended.
        let empty = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
        cli.batch_end(empty).unwrap();
    }

    #[test]
    fn test_batch_idempotent_without_dup_checks() {
        // Committing the same create sequence twice yields the same
        // directory contents.
        let cli = local_cli(
            FilesystemOptions {
                skip_name_collision_checks: true,
                ..FilesystemOptions::default()
            },
            FilesystemCliOptions::default(),
        );
        cli.mkdir(&who(), None, "/bulk", 0o777).unwrap();
        for _ in 0..2 {
            let batch = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
            for i in 0..50 {
                cli.batch_creat(&batch, &format!("f{i}")).unwrap();
            }
            cli.batch_commit(&batch).unwrap();
            cli.batch_end(batch).unwrap();
        }
        for i in 0..50 {
            cli.lstat(&who(), None, &format!("/bulk/f{i}")).unwrap();
        }
    }

    #[test]
    fn test_batch_conflict_is_latched_but_rest_lands() {
        let cli = local_cli(FilesystemOptions::default(), FilesystemCliOptions::default());
        cli.mkdir(&who(), None, "/bulk", 0o777).unwrap();
        cli.mkfle(&who(), None, "/bulk/taken", 0o660).unwrap();
        let batch = cli.batch_start(&who(), None, "/bulk", 0o660).unwrap();
        for name in ["a", "taken", "b"] {
            cli.batch_creat(&batch, name).unwrap();
        }
        let err = cli.batch_commit(&batch).unwrap_err();
        assert!(err.is_conflict());
        cli.batch_end(batch).unwrap();
        // The conflicting name is skipped, everything else lands.
        cli.lstat(&who(), None, "/bulk/a").unwrap();
        cli.lstat(&who(), None, "/bulk/b").unwrap();
    }
}
