//! Ordered key/value adapter behind the metadata engine.
//!
//! The engine talks to storage through the [`MetaDb`] trait: point reads and
//! writes, atomic write batches, ordered prefix scans, point-in-time
//! snapshots, a durability barrier, and a pre-sorted bulk ingest used by
//! partition migration. Two engines implement it: [`MemDb`], an in-memory
//! `BTreeMap` for tests and ephemeral runs, and [`FjallDb`], an LSM store on
//! disk.

pub mod bulk;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Environment prefix for read-write store tuning.
pub const DB_ENV_PREFIX: &str = "GIGAFS_Db_";
/// Environment prefix for readonly store tuning.
pub const RDB_ENV_PREFIX: &str = "GIGAFS_Rr_";

/// One record in a [`WriteBatch`].
#[derive(Debug, Clone)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// An ordered list of writes applied atomically.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Point-in-time readonly view of a store.
pub trait DbSnapshot: Send {
    fn get(&self, key: &[u8]) -> FsResult<Option<Vec<u8>>>;
    fn scan_prefix(&self, prefix: &[u8]) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Storage surface required by the metadata engine.
pub trait MetaDb: Send + Sync {
    fn get(&self, key: &[u8]) -> FsResult<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> FsResult<()>;
    fn delete(&self, key: &[u8]) -> FsResult<()>;
    /// Apply a batch atomically: either every op is visible or none is.
    fn write(&self, batch: WriteBatch) -> FsResult<()>;
    /// Ordered scan of every record whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>>;
    fn snapshot(&self) -> FsResult<Box<dyn DbSnapshot>>;
    /// Durability barrier; also persists any buffered engine state.
    fn flush(&self) -> FsResult<()>;
    /// Bulk-load pre-sorted entries, overwriting existing keys.
    fn ingest(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> FsResult<()>;
}

/// Store tuning, optionally overridden from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemDbOptions {
    /// Block cache size in bytes.
    pub block_cache_size: u64,
    /// Memtable size in bytes before rotation.
    pub memtable_size: u32,
    /// Bloom filter bits per key for point lookups.
    pub filter_bits_per_key: u32,
    /// Compress table blocks.
    pub compression: bool,
}

impl Default for FilesystemDbOptions {
    fn default() -> Self {
        Self {
            block_cache_size: 8 << 20,
            memtable_size: 8 << 20,
            filter_bits_per_key: 12,
            compression: true,
        }
    }
}

/// Parse a human-friendly size such as `64m`, `8k`, `1g`, or `128`.
fn parse_pretty_number(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (digits, mult) = match text.as_bytes()[text.len() - 1].to_ascii_lowercase() {
        b'k' => (&text[..text.len() - 1], 1u64 << 10),
        b'm' => (&text[..text.len() - 1], 1u64 << 20),
        b'g' => (&text[..text.len() - 1], 1u64 << 30),
        _ => (text, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(mult)
}

fn parse_pretty_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl FilesystemDbOptions {
    /// Overlay tuning read from `<prefix>cache_size`, `<prefix>memtable_size`,
    /// `<prefix>bloom_bits`, and `<prefix>compression`.
    pub fn read_from_env(&mut self, prefix: &str) {
        let lookup = |key: &str| std::env::var(format!("{prefix}{key}")).ok();
        if let Some(v) = lookup("cache_size").as_deref().and_then(parse_pretty_number) {
            self.block_cache_size = v;
        }
        if let Some(v) = lookup("memtable_size").as_deref().and_then(parse_pretty_number) {
            self.memtable_size = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = lookup("bloom_bits").as_deref().and_then(parse_pretty_number) {
            self.filter_bits_per_key = v as u32;
        }
        if let Some(v) = lookup("compression").as_deref().and_then(parse_pretty_bool) {
            self.compression = v;
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory engine
// ---------------------------------------------------------------------------

/// `BTreeMap`-backed store. Snapshots clone the map.
#[derive(Default)]
pub struct MemDb {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemSnapshot {
    inner: BTreeMap<Vec<u8>, Vec<u8>>,
}

fn scan_map(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn lock_poisoned() -> FsError {
    FsError::Io("store lock poisoned".to_string())
}

impl DbSnapshot for MemSnapshot {
    fn get(&self, key: &[u8]) -> FsResult<Option<Vec<u8>>> {
        Ok(self.inner.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_map(&self.inner, prefix))
    }
}

impl MetaDb for MemDb {
    fn get(&self, key: &[u8]) -> FsResult<Option<Vec<u8>>> {
        let map = self.inner.read().map_err(|_| lock_poisoned())?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> FsResult<()> {
        let mut map = self.inner.write().map_err(|_| lock_poisoned())?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> FsResult<()> {
        let mut map = self.inner.write().map_err(|_| lock_poisoned())?;
        map.remove(key);
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> FsResult<()> {
        let mut map = self.inner.write().map_err(|_| lock_poisoned())?;
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.inner.read().map_err(|_| lock_poisoned())?;
        Ok(scan_map(&map, prefix))
    }

    fn snapshot(&self) -> FsResult<Box<dyn DbSnapshot>> {
        let map = self.inner.read().map_err(|_| lock_poisoned())?;
        Ok(Box::new(MemSnapshot { inner: map.clone() }))
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn ingest(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> FsResult<()> {
        let mut map = self.inner.write().map_err(|_| lock_poisoned())?;
        for (k, v) in entries {
            map.insert(k, v);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// On-disk engine
// ---------------------------------------------------------------------------

fn fjall_err(e: fjall::Error) -> FsError {
    FsError::Io(format!("fjall: {e}"))
}

/// LSM-backed store: one fjall keyspace holding a single metadata partition.
pub struct FjallDb {
    keyspace: Keyspace,
    tree: PartitionHandle,
}

impl FjallDb {
    pub fn open<P: AsRef<Path>>(path: P, opts: &FilesystemDbOptions) -> FsResult<Self> {
        let keyspace = fjall::Config::new(path)
            .cache_size(opts.block_cache_size)
            .open()
            .map_err(fjall_err)?;
        let create = PartitionCreateOptions::default()
            .max_memtable_size(opts.memtable_size)
            .compression(if opts.compression {
                fjall::CompressionType::Lz4
            } else {
                fjall::CompressionType::None
            });
        let tree = keyspace
            .open_partition("meta", create)
            .map_err(fjall_err)?;
        Ok(Self { keyspace, tree })
    }
}

struct FjallSnapshot {
    inner: fjall::Snapshot,
}

impl DbSnapshot for FjallSnapshot {
    fn get(&self, key: &[u8]) -> FsResult<Option<Vec<u8>>> {
        let found = self.inner.get(key).map_err(|e| FsError::Io(format!("fjall: {e}")))?;
        Ok(found.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for pair in self.inner.prefix(prefix) {
            let (k, v) = pair.map_err(|e| FsError::Io(format!("fjall: {e}")))?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

impl MetaDb for FjallDb {
    fn get(&self, key: &[u8]) -> FsResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key).map_err(fjall_err)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> FsResult<()> {
        self.tree.insert(key, value).map_err(fjall_err)
    }

    fn delete(&self, key: &[u8]) -> FsResult<()> {
        self.tree.remove(key).map_err(fjall_err)
    }

    fn write(&self, batch: WriteBatch) -> FsResult<()> {
        let mut inner = self.keyspace.batch();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => inner.insert(&self.tree, k, v),
                BatchOp::Delete(k) => inner.remove(&self.tree, k),
            };
        }
        inner.commit().map_err(fjall_err)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> FsResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for pair in self.tree.prefix(prefix) {
            let (k, v) = pair.map_err(fjall_err)?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn snapshot(&self) -> FsResult<Box<dyn DbSnapshot>> {
        Ok(Box::new(FjallSnapshot {
            inner: self.tree.snapshot(),
        }))
    }

    fn flush(&self) -> FsResult<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(fjall_err)
    }

    fn ingest(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> FsResult<()> {
        let mut inner = self.keyspace.batch();
        for (k, v) in entries {
            inner.insert(&self.tree, k, v);
        }
        inner.commit().map_err(fjall_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(db: &dyn MetaDb) {
        db.put(b"a/1", b"one").unwrap();
        db.put(b"a/2", b"two").unwrap();
        db.put(b"b/1", b"other").unwrap();
        assert_eq!(db.get(b"a/1").unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(db.get(b"missing").unwrap(), None);

        let scanned = db.scan_prefix(b"a/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"a/1");

        let snap = db.snapshot().unwrap();
        db.delete(b"a/1").unwrap();
        assert_eq!(db.get(b"a/1").unwrap(), None);
        assert_eq!(snap.get(b"a/1").unwrap().as_deref(), Some(&b"one"[..]));

        let mut batch = WriteBatch::new();
        batch.put(b"c/1".to_vec(), b"three".to_vec());
        batch.delete(b"a/2".to_vec());
        db.write(batch).unwrap();
        assert_eq!(db.get(b"a/2").unwrap(), None);
        assert_eq!(db.get(b"c/1").unwrap().as_deref(), Some(&b"three"[..]));

        db.ingest(vec![
            (b"d/1".to_vec(), b"x".to_vec()),
            (b"d/2".to_vec(), b"y".to_vec()),
        ])
        .unwrap();
        assert_eq!(db.scan_prefix(b"d/").unwrap().len(), 2);
        db.flush().unwrap();
    }

    #[test]
    fn test_mem_db() {
        exercise(&MemDb::new());
    }

    #[test]
    fn test_fjall_db() {
        let dir = tempfile::tempdir().unwrap();
        let db = FjallDb::open(dir.path(), &FilesystemDbOptions::default()).unwrap();
        exercise(&db);
    }

    #[test]
    fn test_fjall_db_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let opts = FilesystemDbOptions::default();
        {
            let db = FjallDb::open(dir.path(), &opts).unwrap();
            db.put(b"k", b"v").unwrap();
            db.flush().unwrap();
        }
        let db = FjallDb::open(dir.path(), &opts).unwrap();
        assert_eq!(db.get(b"k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn test_parse_pretty_number() {
        assert_eq!(parse_pretty_number("128"), Some(128));
        assert_eq!(parse_pretty_number("8k"), Some(8 << 10));
        assert_eq!(parse_pretty_number("64M"), Some(64 << 20));
        assert_eq!(parse_pretty_number("2g"), Some(2 << 30));
        assert_eq!(parse_pretty_number("nope"), None);
    }

    #[test]
    fn test_options_from_env() {
        std::env::set_var("GIGAFS_TEST_Db_cache_size", "64m");
        std::env::set_var("GIGAFS_TEST_Db_compression", "off");
        let mut opts = FilesystemDbOptions::default();
        opts.read_from_env("GIGAFS_TEST_Db_");
        assert_eq!(opts.block_cache_size, 64 << 20);
        assert!(!opts.compression);
    }
}
