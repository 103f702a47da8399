//! Server-side metadata service.
//!
//! [`Filesystem`] is the callable surface shared by the in-process engine
//! and the RPC client stubs, so a caller can be wired to either without
//! caring which. [`MetadataEngine`] is the authoritative implementation
//! backed by a [`crate::db::MetaDb`].

pub mod engine;
pub mod reader;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::FsResult;
use crate::giga::DirIndexOptions;
use crate::keys::KeyMode;
use crate::types::{LookupStat, Stat, User};

pub use engine::MetadataEngine;
pub use reader::FilesystemReader;

/// Result of a bulk create.
///
/// `n` names were created; `err` carries the per-item failure that stopped
/// the batch, if any. Partial success is a contract, not an error: callers
/// retry the uncreated tail.
#[derive(Debug, Clone)]
pub struct MkflsRet {
    pub n: u32,
    pub err: Option<crate::error::FsError>,
}

impl MkflsRet {
    pub fn ok(n: u32) -> Self {
        Self { n, err: None }
    }
}

/// The metadata operation set.
///
/// All operations take the authenticated caller and a lookup stat of the
/// parent directory previously issued by `lokup` (or constructed for the
/// root, which every client knows).
pub trait Filesystem: Send + Sync {
    /// Resolve one directory component, returning a lease on it.
    fn lokup(&self, who: &User, parent: &LookupStat, name: &str) -> FsResult<LookupStat>;

    /// Create a directory.
    fn mkdir(&self, who: &User, parent: &LookupStat, name: &str, mode: u32) -> FsResult<Stat>;

    /// Create a regular file.
    fn mkfle(&self, who: &User, parent: &LookupStat, name: &str, mode: u32) -> FsResult<Stat>;

    /// Bulk-create files from a packed, length-prefixed name array.
    fn mkfls(
        &self,
        who: &User,
        parent: &LookupStat,
        namearr: &[u8],
        n: u32,
        mode: u32,
    ) -> FsResult<MkflsRet>;

    /// Bulk-ingest a staging directory of sorted runs into the store.
    fn bukin(&self, who: &User, parent: &LookupStat, dir: &str) -> FsResult<()>;

    /// Stat one child entry.
    fn lstat(&self, who: &User, parent: &LookupStat, name: &str) -> FsResult<Stat>;
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemOptions {
    /// Trust callers and skip Unix permission checks.
    pub skip_perm_checks: bool,
    /// Trust parent leases and skip lease expiry checks.
    pub skip_lease_due_checks: bool,
    /// Skip duplicate-name probes on create.
    pub skip_name_collision_checks: bool,
    /// Key layout; a readonly reader must match the writer.
    pub key_mode: KeyMode,
    /// Lifetime of issued lookup leases, microseconds. Negative means the
    /// leases never expire.
    pub lease_duration_micros: i64,
    /// This server's physical id, `0 <= srv_id < dir_index.num_servers`.
    pub srv_id: u32,
    /// Partitioning geometry shared by every server of the deployment.
    pub dir_index: DirIndexOptions,
    /// Shared staging directory for cross-server partition migration.
    pub bulk_staging_dir: PathBuf,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        Self {
            skip_perm_checks: false,
            skip_lease_due_checks: false,
            skip_name_collision_checks: false,
            key_mode: KeyMode::NameInKey,
            lease_duration_micros: 1_000_000,
            srv_id: 0,
            dir_index: DirIndexOptions::default(),
            bulk_staging_dir: PathBuf::from("/tmp/gigafs/staging"),
        }
    }
}

impl FilesystemOptions {
    pub fn validate(&self) -> FsResult<()> {
        self.dir_index.validate()?;
        if self.srv_id >= self.dir_index.num_servers {
            return Err(crate::error::FsError::InvalidArgument(format!(
                "srv_id {} out of range for {} servers",
                self.srv_id, self.dir_index.num_servers
            )));
        }
        Ok(())
    }
}
