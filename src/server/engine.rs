//! The authoritative metadata engine.
//!
//! One engine instance serves one logical server. Per-directory state (the
//! GIGA+ index and per-partition population counts) is cached in control
//! blocks keyed by `DirId`; mutation is serialized by the control block's
//! write lock, read-only operations take no lock beyond a brief routing
//! check. Inodes are allocated from a per-server sequence persisted in
//! blocks, interleaved across servers so directory ids never collide.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use zerocopy::IntoBytes;

use crate::db::{bulk, MetaDb, WriteBatch};
use crate::error::{FsError, FsResult};
use crate::giga::{giga_hash, DirIndex};
use crate::keys::{get_length_prefixed, get_varint, put_varint, KeyCodec};
use crate::server::{Filesystem, FilesystemOptions, MkflsRet};
use crate::types::{
    check_access, now_micros, validate_name, DirId, LookupStat, Stat, User, ACCESS_W, ACCESS_X,
    LEASE_NEVER, S_IFDIR, S_IFREG,
};

/// Inodes are persisted in blocks of this many allocations.
const INODE_BLOCK: u64 = 1024;

/// Reserved key of the per-server inode sequence. Starts with 0xff so it
/// sorts after every directory prefix in use (dnode values of 2^56 and up
/// are reserved).
const INODE_COUNTER_KEY: &[u8] = b"\xffinoq";

/// Bound on chained splits performed by a single create.
const MAX_SPLITS_PER_OP: u32 = 8;

fn lock_poisoned() -> FsError {
    FsError::Io("engine lock poisoned".to_string())
}

type Predicate = Box<dyn Fn(&User, &LookupStat) -> FsResult<()> + Send + Sync>;

/// Option-gated precondition pipeline: lease freshness then permission,
/// each predicate elided at construction when its gate is set.
struct Preconditions {
    checks: Vec<Predicate>,
}

impl Preconditions {
    fn build(opts: &FilesystemOptions, want: u32) -> Self {
        let mut checks: Vec<Predicate> = Vec::new();
        if !opts.skip_lease_due_checks {
            checks.push(Box::new(|_who, parent| {
                if parent.is_fresh(now_micros()) {
                    Ok(())
                } else {
                    Err(FsError::LeaseExpired)
                }
            }));
        }
        if !opts.skip_perm_checks {
            checks.push(Box::new(move |who, parent| {
                if check_access(who, parent.uid, parent.gid, parent.dir_mode, want) {
                    Ok(())
                } else {
                    Err(FsError::PermissionDenied(format!(
                        "uid {} on directory {}",
                        who.uid,
                        parent.id()
                    )))
                }
            }));
        }
        Self { checks }
    }

    fn check(&self, who: &User, parent: &LookupStat) -> FsResult<()> {
        for check in &self.checks {
            check(who, parent)?;
        }
        Ok(())
    }
}

/// Mutable per-directory state.
struct DirState {
    giga: DirIndex,
    /// Population of each locally owned partition.
    counts: HashMap<u32, u64>,
}

struct DirCtl {
    state: RwLock<DirState>,
}

struct InodeAlloc {
    next: u64,
    limit: u64,
}

/// Metadata engine over an ordered KV store.
pub struct MetadataEngine {
    db: Arc<dyn MetaDb>,
    codec: KeyCodec,
    opts: FilesystemOptions,
    dirs: Mutex<HashMap<DirId, Arc<DirCtl>>>,
    ino: Mutex<InodeAlloc>,
    /// Stubs to every server of the deployment, indexed by server id; used
    /// to ship migrated partitions. Empty in single-server deployments.
    peers: RwLock<Vec<Arc<dyn Filesystem>>>,
    pre_read: Preconditions,
    pre_write: Preconditions,
}

impl MetadataEngine {
    pub fn open(db: Arc<dyn MetaDb>, options: FilesystemOptions) -> FsResult<Arc<Self>> {
        options.validate()?;
        let codec = KeyCodec::new(options.key_mode);

        let root_key = codec.dir_stat_key(&DirId::ROOT);
        if db.get(&root_key)?.is_none() {
            let root = Stat::new(0, 0, 0, S_IFDIR | 0o755, 0, 0, now_micros());
            db.put(&root_key, root.as_bytes())?;
            tracing::info!("formatted root directory");
        }

        let next = db
            .get(INODE_COUNTER_KEY)?
            .as_deref()
            .and_then(|mut v: &[u8]| get_varint(&mut v))
            .unwrap_or(0);

        let pre_read = Preconditions::build(&options, ACCESS_X);
        let pre_write = Preconditions::build(&options, ACCESS_W | ACCESS_X);
        Ok(Arc::new(Self {
            db,
            codec,
            opts: options,
            dirs: Mutex::new(HashMap::new()),
            ino: Mutex::new(InodeAlloc { next, limit: next }),
            peers: RwLock::new(Vec::new()),
            pre_read,
            pre_write,
        }))
    }

    /// Install stubs to peer servers for cross-server partition migration.
    pub fn set_peers(&self, peers: Vec<Arc<dyn Filesystem>>) {
        if let Ok(mut slot) = self.peers.write() {
            *slot = peers;
        }
    }

    pub fn options(&self) -> &FilesystemOptions {
        &self.opts
    }

    /// Allocate a globally unique inode: per-server sequence, interleaved
    /// across servers, persisted one block ahead of use.
    fn alloc_inode(&self) -> FsResult<u64> {
        let mut ino = self.ino.lock().map_err(|_| lock_poisoned())?;
        if ino.next >= ino.limit {
            let limit = ino.next + INODE_BLOCK;
            let mut value = Vec::new();
            put_varint(&mut value, limit);
            self.db.put(INODE_COUNTER_KEY, &value)?;
            ino.limit = limit;
        }
        let seq = ino.next;
        ino.next += 1;
        let nsrvs = self.opts.dir_index.num_servers as u64;
        Ok(seq * nsrvs + self.opts.srv_id as u64 + 1)
    }

    fn load_dir_state(&self, id: &DirId, zeroth_server: u32) -> FsResult<DirState> {
        let giga = match self.db.get(&self.codec.dir_index_key(id))? {
            Some(snapshot) => DirIndex::decode(&snapshot)?,
            None => DirIndex::new(zeroth_server, &self.opts.dir_index),
        };
        let mut counts: HashMap<u32, u64> = HashMap::new();
        for (key, value) in self.db.scan_prefix(&self.codec.dir_prefix(id))? {
            let Some((_, suffix)) = self.codec.split_key(&key) else {
                continue;
            };
            if self.codec.is_reserved_suffix(suffix) {
                continue;
            }
            let name = self.codec.entry_name(suffix, &value)?;
            let partition = giga.partition_of(giga_hash(&name));
            *counts.entry(partition).or_insert(0) += 1;
        }
        Ok(DirState { giga, counts })
    }

    fn acquire_dir(&self, id: &DirId, zeroth_server: u32) -> FsResult<Arc<DirCtl>> {
        {
            let dirs = self.dirs.lock().map_err(|_| lock_poisoned())?;
            if let Some(ctl) = dirs.get(id) {
                return Ok(ctl.clone());
            }
        }
        // Load outside the table lock; a racing loader may win the insert.
        let state = self.load_dir_state(id, zeroth_server)?;
        let mut dirs = self.dirs.lock().map_err(|_| lock_poisoned())?;
        match dirs.entry(*id) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(v) => Ok(v
                .insert(Arc::new(DirCtl {
                    state: RwLock::new(state),
                }))
                .clone()),
        }
    }

    /// Drop the cached control block of `id` so later operations reload it.
    fn evict_dir(&self, id: &DirId) {
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.remove(id);
        }
    }

    /// Flush a directory's cached state when the store reports corruption,
    /// so a bad record cannot poison later operations.
    fn guard_corruption<T>(&self, id: &DirId, result: FsResult<T>) -> FsResult<T> {
        if let Err(FsError::Corruption(_)) = &result {
            self.evict_dir(id);
        }
        result
    }

    /// Owning partition of `name`, failing `StaleDirIndex` with the current
    /// snapshot when the partition lives on another server.
    fn route(&self, state: &DirState, name: &str) -> FsResult<u32> {
        let partition = state.giga.partition_of(giga_hash(name));
        if state.giga.server_of(partition) != self.opts.srv_id {
            return Err(FsError::StaleDirIndex {
                snapshot: Some(state.giga.encode_to_vec()),
            });
        }
        Ok(partition)
    }

    fn lease_due(&self) -> i64 {
        if self.opts.lease_duration_micros < 0 {
            LEASE_NEVER
        } else {
            now_micros() + self.opts.lease_duration_micros
        }
    }

    fn create_common(
        &self,
        who: &User,
        parent: &LookupStat,
        name: &str,
        mode: u32,
        as_dir: bool,
    ) -> FsResult<Stat> {
        self.pre_write.check(who, parent)?;
        validate_name(name)?;
        let id = parent.id();
        let ctl = self.acquire_dir(&id, parent.zeroth_server)?;
        let mut state = ctl.state.write().map_err(|_| lock_poisoned())?;
        let partition = self.route(&state, name)?;

        let key = self.codec.child_key(&id, name);
        if !self.opts.skip_name_collision_checks
            && self.guard_corruption(&id, self.db.get(&key))?.is_some()
        {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let inode = self.alloc_inode()?;
        let ftype = if as_dir { S_IFDIR } else { S_IFREG };
        let zeroth_server = if as_dir {
            (inode % self.opts.dir_index.num_virtual_servers as u64) as u32
        } else {
            0
        };
        let stat = Stat::new(
            parent.dnode,
            inode,
            zeroth_server,
            ftype | (mode & 0o7777),
            who.uid,
            who.gid,
            now_micros(),
        );

        let mut batch = WriteBatch::new();
        batch.put(key, self.codec.encode_value(&stat, name));
        if as_dir {
            // The directory's own stat record doubles as its probe target.
            batch.put(self.codec.dir_stat_key(&stat.id()), stat.as_bytes().to_vec());
        }
        self.db.write(batch)?;

        *state.counts.entry(partition).or_insert(0) += 1;
        if state.counts[&partition] > self.opts.dir_index.split_threshold {
            // The create is already durable; a failed split only delays
            // expansion and is retried by the next insert.
            if let Err(e) = self.split_overflowed(&mut state, &id, partition) {
                tracing::warn!(dir = %id, partition, error = %e, "partition split failed");
            }
        }
        Ok(stat)
    }

    /// Split `partition` (and, if still over threshold, its residue) until
    /// it fits or the index is out of partitions.
    fn split_overflowed(&self, state: &mut DirState, id: &DirId, partition: u32) -> FsResult<()> {
        for _ in 0..MAX_SPLITS_PER_OP {
            let count = state.counts.get(&partition).copied().unwrap_or(0);
            if count <= self.opts.dir_index.split_threshold {
                return Ok(());
            }
            let Some(child) = state.giga.split_target(partition) else {
                return Ok(());
            };

            let mut movers = Vec::new();
            for (key, value) in self.db.scan_prefix(&self.codec.dir_prefix(id))? {
                let Some((_, suffix)) = self.codec.split_key(&key) else {
                    continue;
                };
                if self.codec.is_reserved_suffix(suffix) {
                    continue;
                }
                let name = self.codec.entry_name(suffix, &value)?;
                let hash = giga_hash(&name);
                if state.giga.partition_of(hash) != partition {
                    continue;
                }
                if DirIndex::routes_to_child(child, hash) {
                    movers.push((key, value));
                }
            }

            let mut advanced = state.giga.clone();
            advanced.set_partition(child);
            let target = advanced.server_of(child);
            let remote = target != self.opts.srv_id;
            if remote {
                self.ship_movers(id, child, target, &advanced, &movers)?;
            }
            state.giga = advanced;
            // Persist the advanced index before dropping any local copy.
            self.db
                .put(&self.codec.dir_index_key(id), &state.giga.encode_to_vec())?;
            if remote && !movers.is_empty() {
                let mut batch = WriteBatch::new();
                for (key, _) in &movers {
                    batch.delete(key.clone());
                }
                self.db.write(batch)?;
            }

            let moved = movers.len() as u64;
            state.counts.insert(partition, count.saturating_sub(moved));
            if !remote {
                *state.counts.entry(child).or_insert(0) += moved;
            }
            tracing::info!(
                dir = %id,
                from = partition,
                to = child,
                moved,
                remote,
                "split directory partition"
            );
        }
        Ok(())
    }

    /// Write the moved records (and the advanced index snapshot) into a
    /// staging run and hand it to the owning server.
    fn ship_movers(
        &self,
        id: &DirId,
        child: u32,
        target: u32,
        giga: &DirIndex,
        movers: &[(Vec<u8>, Vec<u8>)],
    ) -> FsResult<()> {
        let stub = {
            let peers = self.peers.read().map_err(|_| lock_poisoned())?;
            peers
                .get(target as usize)
                .cloned()
                .ok_or_else(|| FsError::Io(format!("no stub for server {target}")))?
        };

        let staging = self.opts.bulk_staging_dir.join(format!(
            "{}-{}-p{}-{}",
            id.dnode,
            id.inode,
            child,
            now_micros()
        ));
        std::fs::create_dir_all(&staging)?;
        let run_path = staging.join("000000.run");
        let mut writer = bulk::BulkWriter::create(&run_path)?;
        // The index record key is the bare dir prefix and sorts before every
        // child key, so it leads the run.
        writer.add(&self.codec.dir_index_key(id), &giga.encode_to_vec())?;
        for (key, value) in movers {
            writer.add(key, value)?;
        }
        writer.finish()?;

        let parent = LookupStat {
            dnode: id.dnode,
            inode: id.inode,
            lease_due: LEASE_NEVER,
            zeroth_server: giga.zeroth_server(),
            dir_mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
        };
        let staging_str = staging
            .to_str()
            .ok_or_else(|| FsError::InvalidArgument("non-utf8 staging path".to_string()))?;
        stub.bukin(&User::new(0, 0), &parent, staging_str)?;
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            tracing::warn!(path = staging_str, error = %e, "failed to clean staging run");
        }
        Ok(())
    }

    /// Persist cached directory indexes and flush the store.
    pub fn flush(&self) -> FsResult<()> {
        let ctls: Vec<(DirId, Arc<DirCtl>)> = {
            let dirs = self.dirs.lock().map_err(|_| lock_poisoned())?;
            dirs.iter().map(|(id, ctl)| (*id, ctl.clone())).collect()
        };
        for (id, ctl) in ctls {
            let state = ctl.state.read().map_err(|_| lock_poisoned())?;
            self.db
                .put(&self.codec.dir_index_key(&id), &state.giga.encode_to_vec())?;
        }
        self.db.flush()
    }

    /// Probe for the existence of a directory by id.
    pub fn probe_dir(&self, id: &DirId) -> FsResult<Stat> {
        let value = self
            .db
            .get(&self.codec.dir_stat_key(id))?
            .ok_or_else(|| FsError::NotFound(format!("directory {id}")))?;
        Stat::decode(&value)
            .ok_or_else(|| FsError::Corruption(format!("bad stat record for {id}")))
    }

    /// Probe for the presence of one partition of a directory.
    pub fn probe_partition(&self, id: &DirId, index: u32) -> FsResult<()> {
        let stat = self.probe_dir(id)?;
        let ctl = self.acquire_dir(id, stat.zeroth_server)?;
        let state = ctl.state.read().map_err(|_| lock_poisoned())?;
        if state.giga.test_partition(index) {
            Ok(())
        } else {
            Err(FsError::NotFound(format!("partition {index} of {id}")))
        }
    }
}

impl Filesystem for MetadataEngine {
    fn lokup(&self, who: &User, parent: &LookupStat, name: &str) -> FsResult<LookupStat> {
        self.pre_read.check(who, parent)?;
        validate_name(name)?;
        let id = parent.id();
        let ctl = self.acquire_dir(&id, parent.zeroth_server)?;
        {
            let state = ctl.state.read().map_err(|_| lock_poisoned())?;
            self.route(&state, name)?;
        }
        let key = self.codec.child_key(&id, name);
        let value = self
            .guard_corruption(&id, self.db.get(&key))?
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let (stat, _) = self.guard_corruption(&id, self.codec.decode_value(&value))?;
        if !stat.is_dir() {
            return Err(FsError::NotADirectory(name.to_string()));
        }
        Ok(LookupStat::from_dir_stat(&stat, self.lease_due()))
    }

    fn mkdir(&self, who: &User, parent: &LookupStat, name: &str, mode: u32) -> FsResult<Stat> {
        self.create_common(who, parent, name, mode, true)
    }

    fn mkfle(&self, who: &User, parent: &LookupStat, name: &str, mode: u32) -> FsResult<Stat> {
        self.create_common(who, parent, name, mode, false)
    }

    fn mkfls(
        &self,
        who: &User,
        parent: &LookupStat,
        namearr: &[u8],
        n: u32,
        mode: u32,
    ) -> FsResult<MkflsRet> {
        if let Err(e) = self.pre_write.check(who, parent) {
            return Ok(MkflsRet { n: 0, err: Some(e) });
        }
        let id = parent.id();
        let ctl = self.acquire_dir(&id, parent.zeroth_server)?;
        let mut state = ctl.state.write().map_err(|_| lock_poisoned())?;

        let mut cursor = namearr;
        let mut batch = WriteBatch::new();
        let mut batch_keys: HashSet<Vec<u8>> = HashSet::new();
        let mut per_partition: HashMap<u32, u64> = HashMap::new();
        let mut n_created = 0u32;
        let mut first_err = None;

        for _ in 0..n {
            let Some(raw) = get_length_prefixed(&mut cursor) else {
                first_err = Some(FsError::InvalidArgument(
                    "truncated name array".to_string(),
                ));
                break;
            };
            let name = match String::from_utf8(raw) {
                Ok(name) => name,
                Err(_) => {
                    first_err = Some(FsError::InvalidArgument("non-utf8 name".to_string()));
                    break;
                }
            };
            if let Err(e) = validate_name(&name) {
                first_err = Some(e);
                break;
            }
            let partition = match self.route(&state, &name) {
                Ok(partition) => partition,
                Err(e) => {
                    first_err = Some(e);
                    break;
                }
            };
            let key = self.codec.child_key(&id, &name);
            if !self.opts.skip_name_collision_checks {
                let exists = match self.guard_corruption(&id, self.db.get(&key)) {
                    Ok(found) => found.is_some() || batch_keys.contains(&key),
                    Err(e) => {
                        first_err = Some(e);
                        break;
                    }
                };
                if exists {
                    first_err = Some(FsError::AlreadyExists(name));
                    break;
                }
                batch_keys.insert(key.clone());
            }
            let inode = self.alloc_inode()?;
            let stat = Stat::new(
                parent.dnode,
                inode,
                0,
                S_IFREG | (mode & 0o7777),
                who.uid,
                who.gid,
                now_micros(),
            );
            batch.put(key, self.codec.encode_value(&stat, &name));
            *per_partition.entry(partition).or_insert(0) += 1;
            n_created += 1;
        }

        if !batch.is_empty() {
            if let Err(e) = self.db.write(batch) {
                return Ok(MkflsRet { n: 0, err: Some(e) });
            }
        }
        for (partition, created) in per_partition {
            *state.counts.entry(partition).or_insert(0) += created;
            if state.counts[&partition] > self.opts.dir_index.split_threshold {
                if let Err(e) = self.split_overflowed(&mut state, &id, partition) {
                    tracing::warn!(dir = %id, partition, error = %e, "partition split failed");
                }
            }
        }
        Ok(MkflsRet {
            n: n_created,
            err: first_err,
        })
    }

    fn bukin(&self, who: &User, parent: &LookupStat, dir: &str) -> FsResult<()> {
        self.pre_write.check(who, parent)?;
        let id = parent.id();
        let prefix = self.codec.dir_prefix(&id);
        let entries = bulk::load_dir(dir)?;
        for (key, _) in &entries {
            if !key.starts_with(&prefix) {
                return Err(FsError::InvalidArgument(format!(
                    "run under {dir} holds keys outside directory {id}"
                )));
            }
        }
        let n = entries.len();
        self.db.ingest(entries)?;
        self.db.flush()?;
        // Reload the shipped index and recount on next access.
        self.evict_dir(&id);
        tracing::info!(dir = %id, records = n, from = dir, "ingested bulk run");
        Ok(())
    }

    fn lstat(&self, who: &User, parent: &LookupStat, name: &str) -> FsResult<Stat> {
        self.pre_read.check(who, parent)?;
        validate_name(name)?;
        let id = parent.id();
        let ctl = self.acquire_dir(&id, parent.zeroth_server)?;
        {
            let state = ctl.state.read().map_err(|_| lock_poisoned())?;
            self.route(&state, name)?;
        }
        let key = self.codec.child_key(&id, name);
        let value = self
            .guard_corruption(&id, self.db.get(&key))?
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let (stat, _) = self.guard_corruption(&id, self.codec.decode_value(&value))?;
        Ok(stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemDb;
    use crate::keys::put_length_prefixed;

    fn engine_with(options: FilesystemOptions) -> Arc<MetadataEngine> {
        MetadataEngine::open(Arc::new(MemDb::new()), options).unwrap()
    }

    fn parent(dir_mode: u32, lease_due: i64) -> LookupStat {
        LookupStat {
            dnode: 0,
            inode: 0,
            lease_due,
            zeroth_server: 0,
            dir_mode: S_IFDIR | dir_mode,
            uid: 0,
            gid: 0,
        }
    }

    fn caller() -> User {
        User::new(1, 1)
    }

    fn pack(names: &[&str]) -> (Vec<u8>, u32) {
        let mut arr = Vec::new();
        for name in names {
            put_length_prefixed(&mut arr, name.as_bytes());
        }
        (arr, names.len() as u32)
    }

    #[test]
    fn test_open_and_close() {
        let fs = engine_with(FilesystemOptions::default());
        fs.probe_dir(&DirId::ROOT).unwrap();
        fs.probe_partition(&DirId::ROOT, 0).unwrap();
        assert!(fs.probe_partition(&DirId::ROOT, 1).is_err());
    }

    #[test]
    fn test_files() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, LEASE_NEVER);
        for name in ["a", "b", "c"] {
            fs.mkfle(&caller(), &p, name, 0o660).unwrap();
        }
        for name in ["a", "b", "c"] {
            let stat = fs.lstat(&caller(), &p, name).unwrap();
            assert!(stat.mode & S_IFREG != 0);
            assert_eq!(stat.uid, 1);
        }
        assert!(fs.lstat(&caller(), &p, "d").unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicate_names() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, LEASE_NEVER);
        fs.mkfle(&caller(), &p, "a", 0o660).unwrap();
        assert!(fs.mkfle(&caller(), &p, "a", 0o660).unwrap_err().is_conflict());
        fs.mkfle(&caller(), &p, "b", 0o660).unwrap();
    }

    #[test]
    fn test_no_dup_checks() {
        let fs = engine_with(FilesystemOptions {
            skip_name_collision_checks: true,
            ..FilesystemOptions::default()
        });
        let p = parent(0o777, LEASE_NEVER);
        let first = fs.mkfle(&caller(), &p, "a", 0o660).unwrap();
        let second = fs.mkfle(&caller(), &p, "a", 0o660).unwrap();
        // Last writer wins under KV semantics.
        let stat = fs.lstat(&caller(), &p, "a").unwrap();
        assert_eq!(stat.inode, second.inode);
        assert_ne!(first.inode, second.inode);
    }

    #[test]
    fn test_lease_expired() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, 0);
        assert_eq!(
            fs.mkfle(&caller(), &p, "a", 0o660).unwrap_err(),
            FsError::LeaseExpired
        );
    }

    #[test]
    fn test_no_lease_due_checks() {
        let fs = engine_with(FilesystemOptions {
            skip_lease_due_checks: true,
            ..FilesystemOptions::default()
        });
        let p = parent(0o777, 0);
        fs.mkfle(&caller(), &p, "a", 0o660).unwrap();
    }

    #[test]
    fn test_access_denied() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o770, LEASE_NEVER);
        assert!(matches!(
            fs.mkfle(&caller(), &p, "a", 0o660).unwrap_err(),
            FsError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_no_perm_checks() {
        let fs = engine_with(FilesystemOptions {
            skip_perm_checks: true,
            ..FilesystemOptions::default()
        });
        let p = parent(0o770, LEASE_NEVER);
        fs.mkfle(&caller(), &p, "a", 0o660).unwrap();
    }

    #[test]
    fn test_lokup_requires_directory() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, LEASE_NEVER);
        fs.mkfle(&caller(), &p, "file", 0o660).unwrap();
        assert!(matches!(
            fs.lokup(&caller(), &p, "file").unwrap_err(),
            FsError::NotADirectory(_)
        ));
        fs.mkdir(&caller(), &p, "dir", 0o755).unwrap();
        let lease = fs.lokup(&caller(), &p, "dir").unwrap();
        assert!(lease.is_fresh(now_micros()));
        assert_ne!(lease.id(), DirId::ROOT);
    }

    #[test]
    fn test_creates_under_subdirectory() {
        let fs = engine_with(FilesystemOptions::default());
        let root = parent(0o777, LEASE_NEVER);
        fs.mkdir(&caller(), &root, "sub", 0o777).unwrap();
        let sub = fs.lokup(&caller(), &root, "sub").unwrap();
        fs.mkfle(&caller(), &sub, "a", 0o660).unwrap();
        fs.lstat(&caller(), &sub, "a").unwrap();
        // Same name under the root is independent.
        assert!(fs.lstat(&caller(), &root, "a").unwrap_err().is_not_found());
        fs.probe_dir(&sub.id()).unwrap();
    }

    #[test]
    fn test_mkfls_creates_in_order() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, LEASE_NEVER);
        let (arr, n) = pack(&["x", "y", "z"]);
        let ret = fs.mkfls(&caller(), &p, &arr, n, 0o660).unwrap();
        assert_eq!(ret.n, 3);
        assert!(ret.err.is_none());
        for name in ["x", "y", "z"] {
            fs.lstat(&caller(), &p, name).unwrap();
        }
    }

    #[test]
    fn test_mkfls_partial_batch() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, LEASE_NEVER);
        fs.mkfle(&caller(), &p, "dup", 0o660).unwrap();
        let (arr, n) = pack(&["a", "b", "dup", "c"]);
        let ret = fs.mkfls(&caller(), &p, &arr, n, 0o660).unwrap();
        // The prefix before the conflicting name is committed.
        assert_eq!(ret.n, 2);
        assert!(ret.err.as_ref().unwrap().is_conflict());
        fs.lstat(&caller(), &p, "a").unwrap();
        fs.lstat(&caller(), &p, "b").unwrap();
        assert!(fs.lstat(&caller(), &p, "c").unwrap_err().is_not_found());
    }

    #[test]
    fn test_mkfls_stale_lease_creates_nothing() {
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, 0);
        let (arr, n) = pack(&["a"]);
        let ret = fs.mkfls(&caller(), &p, &arr, n, 0o660).unwrap();
        assert_eq!(ret.n, 0);
        assert_eq!(ret.err, Some(FsError::LeaseExpired));
    }

    #[test]
    fn test_created_names_match_lstat_view() {
        // Property 1: names observable by lstat == names whose create
        // returned OK.
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, LEASE_NEVER);
        let mut created = Vec::new();
        for i in 0..100 {
            let name = format!("f{i}");
            if fs.mkfle(&caller(), &p, &name, 0o660).is_ok() {
                created.push(name);
            }
        }
        // Duplicate attempts fail and must not disturb the view.
        assert!(fs.mkfle(&caller(), &p, "f3", 0o660).is_err());
        for name in &created {
            fs.lstat(&caller(), &p, name).unwrap();
        }
        assert_eq!(created.len(), 100);
    }

    #[test]
    fn test_concurrent_duplicate_creates() {
        // Property 2: exactly one of two racing creates of one name wins.
        let fs = engine_with(FilesystemOptions::default());
        let p = parent(0o777, LEASE_NEVER);
        let mut wins = 0;
        let mut conflicts = 0;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let fs = fs.clone();
                    let p = &p;
                    scope.spawn(move || fs.mkfle(&caller(), p, "contended", 0o660))
                })
                .collect();
            for handle in handles {
                match handle.join().unwrap() {
                    Ok(_) => wins += 1,
                    Err(e) if e.is_conflict() => conflicts += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
    }

    #[test]
    fn test_split_keeps_names_reachable() {
        let fs = engine_with(FilesystemOptions {
            dir_index: crate::giga::DirIndexOptions {
                split_threshold: 16,
                max_partitions: 64,
                ..Default::default()
            },
            ..FilesystemOptions::default()
        });
        let p = parent(0o777, LEASE_NEVER);
        for i in 0..200 {
            fs.mkfle(&caller(), &p, &format!("n{i}"), 0o660).unwrap();
        }
        // The directory must have expanded past its home partition.
        fs.probe_partition(&DirId::ROOT, 1).unwrap();
        for i in 0..200 {
            fs.lstat(&caller(), &p, &format!("n{i}")).unwrap();
        }
    }

    #[test]
    fn test_split_state_survives_reload() {
        let db: Arc<dyn MetaDb> = Arc::new(MemDb::new());
        let options = FilesystemOptions {
            dir_index: crate::giga::DirIndexOptions {
                split_threshold: 16,
                max_partitions: 64,
                ..Default::default()
            },
            ..FilesystemOptions::default()
        };
        let p = parent(0o777, LEASE_NEVER);
        {
            let fs = MetadataEngine::open(db.clone(), options.clone()).unwrap();
            for i in 0..100 {
                fs.mkfle(&caller(), &p, &format!("n{i}"), 0o660).unwrap();
            }
            fs.flush().unwrap();
        }
        let fs = MetadataEngine::open(db, options).unwrap();
        fs.probe_partition(&DirId::ROOT, 1).unwrap();
        for i in 0..100 {
            fs.lstat(&caller(), &p, &format!("n{i}")).unwrap();
        }
        // New creates keep allocating fresh inodes after reopen.
        let stat = fs.mkfle(&caller(), &p, "post-reload", 0o660).unwrap();
        assert!(stat.inode > 0);
    }

    #[test]
    fn test_cross_server_split_ships_partition() {
        // Two single-threaded engines wired directly, sharing a staging dir.
        let staging = tempfile::tempdir().unwrap();
        let geometry = crate::giga::DirIndexOptions {
            num_servers: 2,
            num_virtual_servers: 2,
            split_threshold: 16,
            max_partitions: 64,
        };
        let mk = |srv_id: u32| {
            MetadataEngine::open(
                Arc::new(MemDb::new()),
                FilesystemOptions {
                    srv_id,
                    dir_index: geometry,
                    bulk_staging_dir: staging.path().to_path_buf(),
                    ..FilesystemOptions::default()
                },
            )
            .unwrap()
        };
        let s0 = mk(0);
        let s1 = mk(1);
        let peers: Vec<Arc<dyn Filesystem>> = vec![
            Arc::clone(&s0) as Arc<dyn Filesystem>,
            Arc::clone(&s1) as Arc<dyn Filesystem>,
        ];
        s0.set_peers(peers.clone());
        s1.set_peers(peers);

        let p = parent(0o777, LEASE_NEVER);
        let mut routed_elsewhere = 0;
        for i in 0..64 {
            match s0.mkfle(&caller(), &p, &format!("n{i}"), 0o660) {
                Ok(_) => {}
                Err(FsError::StaleDirIndex { .. }) => {
                    // Partition 1 now lives on server 1.
                    s1.mkfle(&caller(), &p, &format!("n{i}"), 0o660).unwrap();
                    routed_elsewhere += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(routed_elsewhere > 0, "split never crossed servers");
        // Every name is findable on exactly one of the two servers.
        for i in 0..64 {
            let name = format!("n{i}");
            let on_s0 = s0.lstat(&caller(), &p, &name).is_ok();
            let on_s1 = s1.lstat(&caller(), &p, &name).is_ok();
            assert!(on_s0 ^ on_s1, "{name} visible on {on_s0}/{on_s1}");
        }
    }
}
