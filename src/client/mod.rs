//! Client library: cached path resolution and batched creates.
//!
//! A [`FilesystemCli`] fronts either a local metadata engine or a set of
//! remote server stubs, both behind [`crate::server::Filesystem`]. It keeps
//! a two-level cache (directories, then partitions, then lookup leases),
//! resolves pathnames component by component through lease-protected
//! lookups, and buffers bulk creates per partition so a burst of creates
//! under one parent costs one `mkfls` round trip per owning server.

mod batch;
mod cache;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::giga::{giga_hash, DirIndex, DirIndexOptions};
use crate::rpc::client::{server_stubs, RpcClient, RpcClientOptions};
use crate::server::Filesystem;
use crate::types::{
    check_access, validate_name, DirId, LookupStat, Stat, User, ACCESS_X, LEASE_NEVER, S_IFDIR,
};

pub use batch::BatchHandle;
use batch::{BatchedCreates, FlusherPool};
use cache::{Dir, Partition};

/// Client tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemCliOptions {
    /// Lookup leases cached per directory partition.
    pub per_partition_lease_lru_size: usize,
    /// Partition control blocks cached across all directories.
    pub partition_lru_size: usize,
    /// Directory control blocks cached.
    pub max_dirs: usize,
    /// Bytes buffered per partition before a background batch flush.
    pub batch_size: usize,
    /// Worker threads draining background batch flushes.
    pub background_flushers: usize,
    /// Bounded retries after a `StaleDirIndex` redirect.
    pub max_index_retries: u32,
    /// Skip client-side execute-permission checks during resolution.
    pub skip_perm_checks: bool,
    /// Partitioning geometry; must match the servers.
    pub dir_index: DirIndexOptions,
    /// Per-RPC deadline.
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for FilesystemCliOptions {
    fn default() -> Self {
        Self {
            per_partition_lease_lru_size: 4096,
            partition_lru_size: 4096,
            max_dirs: 4096,
            batch_size: 64 << 10,
            background_flushers: 2,
            max_index_retries: 3,
            skip_perm_checks: false,
            dir_index: DirIndexOptions::default(),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

impl FilesystemCliOptions {
    pub fn validate(&self) -> FsResult<()> {
        self.dir_index.validate()?;
        if self.batch_size == 0 {
            return Err(FsError::InvalidArgument(
                "batch_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A resolved relative root for pathnames.
#[derive(Debug, Clone)]
pub struct DirHandle {
    lease: LookupStat,
}

impl DirHandle {
    pub fn id(&self) -> DirId {
        self.lease.id()
    }
}

/// Outcome of resolving a pathname down to its final component.
#[derive(Debug, Clone)]
struct ResolvedParent {
    parent: LookupStat,
    name: String,
    trailing_slash: bool,
}

pub struct FilesystemCli {
    options: FilesystemCliOptions,
    stubs: Vec<Arc<dyn Filesystem>>,
    root: LookupStat,
    /// Directory control blocks; pinning is an `Arc` clone, so LRU eviction
    /// only drops the table's reference.
    dirs: Mutex<LruCache<DirId, Arc<Dir>>>,
    /// Partition control blocks across all cached directories.
    pars: Mutex<LruCache<(DirId, u32), Arc<Partition>>>,
    /// At most one open batch per parent directory.
    batches: Mutex<HashMap<DirId, Weak<BatchedCreates>>>,
    flushers: FlusherPool,
}

impl FilesystemCli {
    /// Wire the client straight to an in-process filesystem (single server).
    pub fn open_local(fs: Arc<dyn Filesystem>, options: FilesystemCliOptions) -> FsResult<Self> {
        Self::open_with_stubs(vec![fs], options)
    }

    /// Connect to remote metadata servers, one address per server id.
    pub fn open_rpc(addrs: Vec<String>, options: FilesystemCliOptions) -> FsResult<Self> {
        let rpc = RpcClient::new(
            addrs,
            RpcClientOptions {
                rpc_timeout: options.rpc_timeout,
            },
        );
        Self::open_with_stubs(server_stubs(&rpc), options)
    }

    pub fn open_with_stubs(
        stubs: Vec<Arc<dyn Filesystem>>,
        options: FilesystemCliOptions,
    ) -> FsResult<Self> {
        options.validate()?;
        if stubs.len() != options.dir_index.num_servers as usize {
            return Err(FsError::InvalidArgument(format!(
                "{} stubs for {} servers",
                stubs.len(),
                options.dir_index.num_servers
            )));
        }
        let root = LookupStat {
            dnode: 0,
            inode: 0,
            lease_due: LEASE_NEVER,
            zeroth_server: 0,
            dir_mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
        };
        let flushers = FlusherPool::start(stubs.clone(), &options);
        Ok(Self {
            dirs: Mutex::new(LruCache::new(cache::lru_cap(options.max_dirs))),
            pars: Mutex::new(LruCache::new(cache::lru_cap(options.partition_lru_size))),
            batches: Mutex::new(HashMap::new()),
            options,
            stubs,
            root,
            flushers,
        })
    }

    pub fn options(&self) -> &FilesystemCliOptions {
        &self.options
    }

    pub(crate) fn stub(&self, srv: u32) -> FsResult<&Arc<dyn Filesystem>> {
        self.stubs
            .get(srv as usize)
            .ok_or_else(|| FsError::InvalidArgument(format!("no stub for server {srv}")))
    }

    /// Resolve `pathname` to a handle usable as a relative root.
    pub fn atdir(
        &self,
        who: &User,
        at: Option<&DirHandle>,
        pathname: &str,
    ) -> FsResult<DirHandle> {
        let resolved = self.resolu(who, at, pathname)?;
        if resolved.name.is_empty() {
            return Ok(DirHandle {
                lease: resolved.parent,
            });
        }
        let lease = self.lokup(who, &resolved.parent, &resolved.name)?;
        Ok(DirHandle { lease })
    }

    /// Create a regular file.
    pub fn mkfle(
        &self,
        who: &User,
        at: Option<&DirHandle>,
        pathname: &str,
        mode: u32,
    ) -> FsResult<Stat> {
        let resolved = self.resolu(who, at, pathname)?;
        if resolved.name.is_empty() {
            return Err(FsError::InvalidArgument(
                "cannot create the root directory".to_string(),
            ));
        }
        if resolved.trailing_slash {
            return Err(FsError::InvalidArgument(format!(
                "file name ends with '/': {pathname}"
            )));
        }
        self.with_index_retry(&resolved.parent, &resolved.name, |srv| {
            self.stub(srv)?
                .mkfle(who, &resolved.parent, &resolved.name, mode)
        })
    }

    /// Create a directory.
    pub fn mkdir(
        &self,
        who: &User,
        at: Option<&DirHandle>,
        pathname: &str,
        mode: u32,
    ) -> FsResult<Stat> {
        let resolved = self.resolu(who, at, pathname)?;
        if resolved.name.is_empty() {
            return Err(FsError::AlreadyExists("/".to_string()));
        }
        self.with_index_retry(&resolved.parent, &resolved.name, |srv| {
            self.stub(srv)?
                .mkdir(who, &resolved.parent, &resolved.name, mode)
        })
    }

    /// Stat a pathname.
    pub fn lstat(&self, who: &User, at: Option<&DirHandle>, pathname: &str) -> FsResult<Stat> {
        let resolved = self.resolu(who, at, pathname)?;
        if resolved.name.is_empty() {
            // The root is client-constant; synthesize its stat.
            return Ok(Stat::new(
                0,
                0,
                self.root.zeroth_server,
                self.root.dir_mode,
                self.root.uid,
                self.root.gid,
                0,
            ));
        }
        self.with_index_retry(&resolved.parent, &resolved.name, |srv| {
            self.stub(srv)?
                .lstat(who, &resolved.parent, &resolved.name)
        })
    }

    /// Number of directory control blocks currently cached.
    pub fn total_dirs_in_memory(&self) -> usize {
        self.dirs.lock().map(|dirs| dirs.len()).unwrap_or(0)
    }

    /// Number of partition control blocks currently cached.
    pub fn total_partitions_in_memory(&self) -> usize {
        self.pars.lock().map(|pars| pars.len()).unwrap_or(0)
    }

    /// Split a pathname, resolve every interior component, and hand back the
    /// parent lease plus the final component. An empty final component means
    /// the path named the relative root itself.
    fn resolu(
        &self,
        who: &User,
        at: Option<&DirHandle>,
        pathname: &str,
    ) -> FsResult<ResolvedParent> {
        if pathname.is_empty() {
            return Err(FsError::InvalidArgument("empty pathname".to_string()));
        }
        if at.is_none() && !pathname.starts_with('/') {
            return Err(FsError::InvalidArgument(format!(
                "relative pathname without an anchor: {pathname}"
            )));
        }
        let start = at.map(|h| h.lease).unwrap_or(self.root);
        let trailing_slash = pathname.ends_with('/');
        let components: Vec<&str> = pathname.split('/').filter(|c| !c.is_empty()).collect();
        self.resolv(who, start, &components, trailing_slash)
            .map_err(|(e, traversed)| annotate(e, &traversed))
    }

    /// Walk the interior components. On failure, report the path resolved so
    /// far next to the error.
    fn resolv(
        &self,
        who: &User,
        start: LookupStat,
        components: &[&str],
        trailing_slash: bool,
    ) -> Result<ResolvedParent, (FsError, String)> {
        let mut parent = start;
        if components.is_empty() {
            return Ok(ResolvedParent {
                parent,
                name: String::new(),
                trailing_slash,
            });
        }
        let mut traversed = String::new();
        for component in &components[..components.len() - 1] {
            if !self.options.skip_perm_checks
                && !check_access(who, parent.uid, parent.gid, parent.dir_mode, ACCESS_X)
            {
                return Err((
                    FsError::PermissionDenied(format!("traversing {}", parent.id())),
                    traversed,
                ));
            }
            match self.lokup(who, &parent, component) {
                Ok(next) => {
                    traversed.push('/');
                    traversed.push_str(component);
                    parent = next;
                }
                Err(e) => return Err((e, traversed)),
            }
        }
        Ok(ResolvedParent {
            parent,
            name: components[components.len() - 1].to_string(),
            trailing_slash,
        })
    }

    /// Run `f` against the server owning `name`, refreshing the cached
    /// directory index and retrying on a `StaleDirIndex` redirect.
    fn with_index_retry<T>(
        &self,
        parent: &LookupStat,
        name: &str,
        f: impl Fn(u32) -> FsResult<T>,
    ) -> FsResult<T> {
        validate_name(name)?;
        let dir = self.acquire_dir(&parent.id(), parent.zeroth_server)?;
        let mut attempts = 0;
        loop {
            let srv = {
                let giga = dir
                    .giga
                    .read()
                    .map_err(|_| FsError::Io("client lock poisoned".to_string()))?;
                giga.server_of(giga.partition_of(giga_hash(name)))
            };
            match f(srv) {
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

    pub(crate) fn refresh_index(&self, dir: &Arc<Dir>, snapshot: &[u8]) -> FsResult<()> {
        let newer = DirIndex::decode(snapshot)?;
        let mut giga = dir
            .giga
            .write()
            .map_err(|_| FsError::Io("client lock poisoned".to_string()))?;
        giga.merge(&newer)?;
        dir.mark_fetched();
        tracing::debug!(dir = %dir.id, partitions = giga.partition_count(), "refreshed directory index");
        Ok(())
    }
}

/// Attach the already-traversed path to an error's detail.
fn annotate(e: FsError, traversed: &str) -> FsError {
    if traversed.is_empty() {
        return e;
    }
    let note = |msg: String| format!("{msg} (resolved through {traversed})");
    match e {
        FsError::NotFound(m) => FsError::NotFound(note(m)),
        FsError::NotADirectory(m) => FsError::NotADirectory(note(m)),
        FsError::PermissionDenied(m) => FsError::PermissionDenied(note(m)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemDb;
    use crate::server::{FilesystemOptions, MetadataEngine};

    fn local_cli() -> FilesystemCli {
        let engine = MetadataEngine::open(Arc::new(MemDb::new()), FilesystemOptions::default())
            .unwrap();
        FilesystemCli::open_local(engine, FilesystemCliOptions::default()).unwrap()
    }

    fn who() -> User {
        User::new(1, 1)
    }

    #[test]
    fn test_create_and_stat_paths() {
        let cli = local_cli();
        cli.mkdir(&who(), None, "/a", 0o777).unwrap();
        cli.mkdir(&who(), None, "/a/b", 0o777).unwrap();
        cli.mkfle(&who(), None, "/a/b/f", 0o660).unwrap();
        let stat = cli.lstat(&who(), None, "/a/b/f").unwrap();
        assert!(!stat.is_dir());
        assert!(cli
            .lstat(&who(), None, "/a/b/missing")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_resolution_error_names_traversed_path() {
        let cli = local_cli();
        cli.mkdir(&who(), None, "/a", 0o777).unwrap();
        let err = cli.lstat(&who(), None, "/a/nope/f").unwrap_err();
        match err {
            FsError::NotFound(detail) => assert!(detail.contains("/a"), "{detail}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_atdir_relative_resolution() {
        let cli = local_cli();
        cli.mkdir(&who(), None, "/a", 0o777).unwrap();
        cli.mkdir(&who(), None, "/a/b", 0o777).unwrap();
        let a = cli.atdir(&who(), None, "/a").unwrap();
        cli.mkfle(&who(), Some(&a), "b/f", 0o660).unwrap();
        cli.lstat(&who(), None, "/a/b/f").unwrap();
        // A relative path without an anchor is rejected.
        assert!(matches!(
            cli.lstat(&who(), None, "b/f").unwrap_err(),
            FsError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_root_paths() {
        let cli = local_cli();
        let root = cli.lstat(&who(), None, "/").unwrap();
        assert!(root.is_dir());
        let at = cli.atdir(&who(), None, "/").unwrap();
        assert!(at.id().is_root());
        assert!(matches!(
            cli.mkfle(&who(), None, "/", 0o660).unwrap_err(),
            FsError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_trailing_slash_rules() {
        let cli = local_cli();
        assert!(matches!(
            cli.mkfle(&who(), None, "/f/", 0o660).unwrap_err(),
            FsError::InvalidArgument(_)
        ));
        cli.mkdir(&who(), None, "/d/", 0o777).unwrap();
    }

    #[test]
    fn test_lookup_cache_counts() {
        let cli = local_cli();
        cli.mkdir(&who(), None, "/a", 0o777).unwrap();
        cli.mkfle(&who(), None, "/a/f", 0o660).unwrap();
        assert!(cli.total_dirs_in_memory() >= 1);
        assert!(cli.total_partitions_in_memory() >= 1);
    }
}
