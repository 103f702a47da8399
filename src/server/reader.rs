//! Readonly metadata reader.
//!
//! Opens an existing store and serves lookups from a snapshot taken at open,
//! so a long-running analysis pass observes one consistent view while a
//! writer keeps appending. Must be configured with the same [`KeyMode`] as
//! the store's writer; tuning comes from `GIGAFS_Rr_*` environment keys.

use std::path::Path;
use std::sync::Arc;

use crate::db::{DbSnapshot, FilesystemDbOptions, FjallDb, MetaDb, RDB_ENV_PREFIX};
use crate::error::{FsError, FsResult};
use crate::keys::{KeyCodec, KeyMode};
use crate::types::{DirId, Stat};

pub struct FilesystemReader {
    // Kept alive for the lifetime of the snapshot.
    _db: Arc<dyn MetaDb>,
    snapshot: Box<dyn DbSnapshot>,
    codec: KeyCodec,
}

impl FilesystemReader {
    /// Snapshot an already-open store.
    pub fn open(db: Arc<dyn MetaDb>, key_mode: KeyMode) -> FsResult<Self> {
        let snapshot = db.snapshot()?;
        Ok(Self {
            _db: db,
            snapshot,
            codec: KeyCodec::new(key_mode),
        })
    }

    /// Open an on-disk store readonly-by-convention, with `GIGAFS_Rr_*`
    /// tuning applied.
    pub fn open_path<P: AsRef<Path>>(path: P, key_mode: KeyMode) -> FsResult<Self> {
        let mut options = FilesystemDbOptions::default();
        options.read_from_env(RDB_ENV_PREFIX);
        let db = Arc::new(FjallDb::open(path, &options)?);
        Self::open(db, key_mode)
    }

    pub fn probe_dir(&self, id: &DirId) -> FsResult<Stat> {
        let value = self
            .snapshot
            .get(&self.codec.dir_stat_key(id))?
            .ok_or_else(|| FsError::NotFound(format!("directory {id}")))?;
        Stat::decode(&value)
            .ok_or_else(|| FsError::Corruption(format!("bad stat record for {id}")))
    }

    pub fn lstat(&self, id: &DirId, name: &str) -> FsResult<Stat> {
        let value = self
            .snapshot
            .get(&self.codec.child_key(id, name))?
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let (stat, _) = self.codec.decode_value(&value)?;
        Ok(stat)
    }

    /// Children of `id` in key order, with their names recovered.
    pub fn list_dir(&self, id: &DirId) -> FsResult<Vec<(String, Stat)>> {
        let mut out = Vec::new();
        for (key, value) in self.snapshot.scan_prefix(&self.codec.dir_prefix(id))? {
            let Some((_, suffix)) = self.codec.split_key(&key) else {
                continue;
            };
            if self.codec.is_reserved_suffix(suffix) {
                continue;
            }
            let name = self.codec.entry_name(suffix, &value)?;
            let (stat, _) = self.codec.decode_value(&value)?;
            out.push((name, stat));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemDb;
    use crate::server::{Filesystem, FilesystemOptions, MetadataEngine};
    use crate::types::{LookupStat, User, LEASE_NEVER, S_IFDIR};

    #[test]
    fn test_reader_sees_snapshot() {
        let db: Arc<dyn MetaDb> = Arc::new(MemDb::new());
        let fs = MetadataEngine::open(db.clone(), FilesystemOptions::default()).unwrap();
        let who = User::new(1, 1);
        let parent = LookupStat {
            dnode: 0,
            inode: 0,
            lease_due: LEASE_NEVER,
            zeroth_server: 0,
            dir_mode: S_IFDIR | 0o777,
            uid: 0,
            gid: 0,
        };
        fs.mkfle(&who, &parent, "a", 0o660).unwrap();
        fs.mkfle(&who, &parent, "b", 0o660).unwrap();

        let reader = FilesystemReader::open(db, KeyMode::NameInKey).unwrap();
        // Writes after the snapshot stay invisible.
        fs.mkfle(&who, &parent, "c", 0o660).unwrap();

        reader.probe_dir(&DirId::ROOT).unwrap();
        reader.lstat(&DirId::ROOT, "a").unwrap();
        assert!(reader.lstat(&DirId::ROOT, "c").unwrap_err().is_not_found());
        let listing = reader.list_dir(&DirId::ROOT).unwrap();
        let names: Vec<&str> = listing.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
