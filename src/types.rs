//! Core metadata records shared by the client, the server, and the wire.
//!
//! `Stat` and `LookupStat` are fixed-layout `#[repr(C)]` records encoded with
//! zerocopy, so the same bytes serve as the persisted KV value and as the
//! wire block inside RPC messages. Fields are ordered widest-first to keep
//! the layout free of padding.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Lease deadline value meaning "never expires".
pub const LEASE_NEVER: i64 = -1;

/// Maximum length of a single pathname component.
pub const MAX_NAME_LEN: usize = 255;

/// File-type bits (a subset of the usual Unix `S_IF*` constants).
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Permission bits used by access checks.
pub const ACCESS_R: u32 = 4;
pub const ACCESS_W: u32 = 2;
pub const ACCESS_X: u32 = 1;

pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

/// Reject names that cannot be pathname components.
pub(crate) fn validate_name(name: &str) -> crate::error::FsResult<()> {
    use crate::error::FsError;
    if name.is_empty() {
        Err(FsError::InvalidArgument("empty name".to_string()))
    } else if name.len() > MAX_NAME_LEN {
        Err(FsError::InvalidArgument(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )))
    } else if name.contains('/') {
        Err(FsError::InvalidArgument(format!("name contains '/': {name}")))
    } else {
        Ok(())
    }
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(_) => 0,
    }
}

/// Globally unique directory handle. The root directory is `(0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirId {
    pub dnode: u64,
    pub inode: u64,
}

impl DirId {
    pub const ROOT: DirId = DirId { dnode: 0, inode: 0 };

    pub fn new(dnode: u64, inode: u64) -> Self {
        Self { dnode, inode }
    }

    pub fn is_root(&self) -> bool {
        self.dnode == 0 && self.inode == 0
    }
}

impl std::fmt::Display for DirId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.dnode, self.inode)
    }
}

/// Authenticated caller. Ancillary group lists are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

impl User {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Standard Unix access test of `who` against an inode's `(uid, gid, mode)`.
///
/// `want` is a mask of `ACCESS_R | ACCESS_W | ACCESS_X`. Uid 0 passes
/// everything.
pub fn check_access(who: &User, uid: u32, gid: u32, mode: u32, want: u32) -> bool {
    if who.uid == 0 {
        return true;
    }
    let perm = if who.uid == uid {
        (mode >> 6) & 7
    } else if who.gid == gid {
        (mode >> 3) & 7
    } else {
        mode & 7
    };
    perm & want == want
}

/// Inode record persisted for every file and directory.
///
/// A directory `Stat` is the authoritative form from which a [`LookupStat`]
/// is derived.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct Stat {
    pub dnode: u64,
    pub inode: u64,
    pub size: u64,
    pub modify_time: i64,
    pub change_time: i64,
    pub zeroth_server: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Encoded size of a `Stat` record.
pub const STAT_ENCODED_LEN: usize = std::mem::size_of::<Stat>();

impl Stat {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dnode: u64,
        inode: u64,
        zeroth_server: u32,
        mode: u32,
        uid: u32,
        gid: u32,
        now: i64,
    ) -> Self {
        Self {
            dnode,
            inode,
            size: 0,
            modify_time: now,
            change_time: now,
            zeroth_server,
            mode,
            uid,
            gid,
        }
    }

    pub fn id(&self) -> DirId {
        DirId::new(self.dnode, self.inode)
    }

    pub fn is_dir(&self) -> bool {
        is_dir(self.mode)
    }

    pub fn decode(bytes: &[u8]) -> Option<Stat> {
        Stat::read_from_bytes(bytes).ok()
    }
}

/// Server-issued lease on a directory.
///
/// All seven fields are set by the constructors; a `LookupStat` obtained any
/// other way than through [`LookupStat::from_dir_stat`] or a decode of a full
/// record is a programming error.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct LookupStat {
    pub dnode: u64,
    pub inode: u64,
    pub lease_due: i64,
    pub zeroth_server: u32,
    pub dir_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Encoded size of a `LookupStat` record.
pub const LOOKUPSTAT_ENCODED_LEN: usize = std::mem::size_of::<LookupStat>();

impl LookupStat {
    /// Derive a lease from a directory's `Stat`.
    pub fn from_dir_stat(stat: &Stat, lease_due: i64) -> Self {
        Self {
            dnode: stat.dnode,
            inode: stat.inode,
            lease_due,
            zeroth_server: stat.zeroth_server,
            dir_mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
        }
    }

    pub fn id(&self) -> DirId {
        DirId::new(self.dnode, self.inode)
    }

    /// A lease is fresh iff `lease_due == -1 || now < lease_due`.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.lease_due == LEASE_NEVER || now < self.lease_due
    }

    pub fn decode(bytes: &[u8]) -> Option<LookupStat> {
        LookupStat::read_from_bytes(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn test_record_sizes() {
        assert_eq!(STAT_ENCODED_LEN, 56);
        assert_eq!(LOOKUPSTAT_ENCODED_LEN, 40);
    }

    #[test]
    fn test_stat_encode_decode() {
        let stat = Stat::new(3, 7, 2, S_IFREG | 0o644, 500, 100, now_micros());
        let bytes = stat.as_bytes().to_vec();
        assert_eq!(bytes.len(), STAT_ENCODED_LEN);
        let back = Stat::decode(&bytes).unwrap();
        assert_eq!(back, stat);
        assert!(back.is_dir() == false);
    }

    #[test]
    fn test_lookupstat_from_dir_stat() {
        let stat = Stat::new(0, 4, 1, S_IFDIR | 0o755, 0, 0, 1);
        let ls = LookupStat::from_dir_stat(&stat, 1000);
        assert_eq!(ls.id(), DirId::new(0, 4));
        assert_eq!(ls.dir_mode, S_IFDIR | 0o755);
        assert!(ls.is_fresh(999));
        assert!(!ls.is_fresh(1000));
        assert!(!ls.is_fresh(1001));
    }

    #[test]
    fn test_lease_never_expires() {
        let stat = Stat::new(0, 4, 0, S_IFDIR | 0o755, 0, 0, 1);
        let ls = LookupStat::from_dir_stat(&stat, LEASE_NEVER);
        assert!(ls.is_fresh(i64::MAX));
    }

    #[test]
    fn test_check_access() {
        // Owner gets the first triplet.
        assert!(check_access(&User::new(5, 5), 5, 0, 0o700, ACCESS_W | ACCESS_X));
        // Group gets the middle triplet.
        assert!(check_access(&User::new(6, 5), 7, 5, 0o070, ACCESS_X));
        // Others get the last triplet.
        assert!(!check_access(&User::new(1, 1), 0, 0, 0o770, ACCESS_W));
        assert!(check_access(&User::new(1, 1), 0, 0, 0o777, ACCESS_W | ACCESS_X));
        // Uid 0 bypasses the mode bits.
        assert!(check_access(&User::new(0, 0), 5, 5, 0o000, ACCESS_W));
    }
}
