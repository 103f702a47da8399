//! Two-level lookup cache and the staged lookup path.
//!
//! Level one is the directory table: one control block per cached directory
//! holding its partition index. Level two is an LRU of partition control
//! blocks keyed `(DirId, partition)`; each partition owns an LRU of lookup
//! leases plus a small `busy` array that serializes concurrent lookups per
//! hash bucket, so at most one lookup RPC is in flight per `(partition,
//! bucket)` while every waiter rides on its result.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

use lru::LruCache;

use crate::client::FilesystemCli;
use crate::error::{FsError, FsResult};
use crate::giga::{giga_hash, DirIndex};
use crate::types::{now_micros, DirId, LookupStat, User};

/// Lookup buckets per partition; a power of two.
pub(crate) const KWAYS: usize = 8;

pub(crate) fn lru_cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).expect("max(1) is non-zero")
}

fn lock_poisoned() -> FsError {
    FsError::Io("client lock poisoned".to_string())
}

/// Per-directory control block.
pub(crate) struct Dir {
    pub id: DirId,
    /// Client's view of the directory's partition index; merged forward
    /// from server redirects.
    pub giga: RwLock<DirIndex>,
    /// Whether any server snapshot has been merged in yet.
    fetched: AtomicBool,
}

impl Dir {
    pub fn mark_fetched(&self) {
        self.fetched.store(true, Ordering::Release);
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched.load(Ordering::Acquire)
    }
}

pub(crate) struct PartitionState {
    /// Pathname-lookup leases, keyed by child name.
    pub leases: LruCache<String, LookupStat>,
    /// One in-flight lookup per bucket.
    pub busy: [bool; KWAYS],
}

/// Per-partition control block.
pub(crate) struct Partition {
    pub dir: Arc<Dir>,
    pub index: u32,
    pub state: Mutex<PartitionState>,
    pub cv: Condvar,
}

impl FilesystemCli {
    /// Obtain (or create) the control block for a directory.
    pub(crate) fn acquire_dir(&self, id: &DirId, zeroth_server: u32) -> FsResult<Arc<Dir>> {
        let mut dirs = self.dirs.lock().map_err(|_| lock_poisoned())?;
        if let Some(dir) = dirs.get(id) {
            return Ok(dir.clone());
        }
        let dir = Arc::new(Dir {
            id: *id,
            giga: RwLock::new(DirIndex::new(zeroth_server, &self.options.dir_index)),
            fetched: AtomicBool::new(false),
        });
        dirs.put(*id, dir.clone());
        Ok(dir)
    }

    /// Obtain (or create) the control block for one partition of `dir`.
    fn acquire_partition(&self, dir: &Arc<Dir>, index: u32) -> FsResult<Arc<Partition>> {
        let mut pars = self.pars.lock().map_err(|_| lock_poisoned())?;
        let key = (dir.id, index);
        if let Some(part) = pars.get(&key) {
            return Ok(part.clone());
        }
        let part = Arc::new(Partition {
            dir: dir.clone(),
            index,
            state: Mutex::new(PartitionState {
                leases: LruCache::new(lru_cap(self.options.per_partition_lease_lru_size)),
                busy: [false; KWAYS],
            }),
            cv: Condvar::new(),
        });
        pars.put(key, part.clone());
        Ok(part)
    }

    /// Resolve one component through the lease cache, refreshing the
    /// directory index and retrying on a redirect.
    pub(crate) fn lokup(
        &self,
        who: &User,
        parent: &LookupStat,
        name: &str,
    ) -> FsResult<LookupStat> {
        let dir = self.acquire_dir(&parent.id(), parent.zeroth_server)?;
        let mut attempts = 0;
        loop {
            match self.lokup1(who, parent, name, &dir) {
                Err(FsError::StaleDirIndex {
                    snapshot: Some(snapshot),
                }) if attempts < self.options.max_index_retries => {
                    attempts += 1;
                    self.refresh_index(&dir, &snapshot)?;
                }
                other => return other,
            }
        }
    }

    /// Pick the owning partition under the current index.
    fn lokup1(
        &self,
        who: &User,
        parent: &LookupStat,
        name: &str,
        dir: &Arc<Dir>,
    ) -> FsResult<LookupStat> {
        let hash = giga_hash(name);
        let (partition, srv) = {
            let giga = dir.giga.read().map_err(|_| lock_poisoned())?;
            let partition = giga.partition_of(hash);
            (partition, giga.server_of(partition))
        };
        let part = self.acquire_partition(dir, partition)?;
        self.lokup2(who, parent, name, hash, srv, &part)
    }

    /// Cache probe and singleflight miss path, serialized per bucket.
    fn lokup2(
        &self,
        who: &User,
        parent: &LookupStat,
        name: &str,
        hash: u32,
        srv: u32,
        part: &Arc<Partition>,
    ) -> FsResult<LookupStat> {
        let bucket = (hash as usize) & (KWAYS - 1);
        let mut state: MutexGuard<'_, PartitionState> =
            part.state.lock().map_err(|_| lock_poisoned())?;
        loop {
            let now = now_micros();
            if let Some(value) = state.leases.get(name) {
                if value.is_fresh(now) && parent.is_fresh(now) {
                    return Ok(*value);
                }
                // A stale lease is treated as absent.
                state.leases.pop(name);
            }
            if !state.busy[bucket] {
                state.busy[bucket] = true;
                break;
            }
            state = part.cv.wait(state).map_err(|_| lock_poisoned())?;
        }
        drop(state);

        tracing::debug!(
            dir = %part.dir.id,
            partition = part.index,
            name,
            fetched = part.dir.is_fetched(),
            "lookup miss"
        );
        // RPC issued without any cache lock held.
        let result = self.stub(srv).and_then(|stub| stub.lokup(who, parent, name));

        match part.state.lock() {
            Ok(mut state) => {
                state.busy[bucket] = false;
                part.cv.notify_all();
                match result {
                    Ok(value) => {
                        state.leases.put(name.to_string(), value);
                        Ok(value)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(_) => Err(lock_poisoned()),
        }
    }
}
