//! Lexicographic metadata key encoding.
//!
//! A child entry is keyed `varint(dnode) || varint(inode) || suffix`, where
//! the suffix is the raw child name (`NameInKey`) or an 8-byte big-endian
//! xxh64 of the name (`NameHash`, with the name carried in the value
//! instead). Bytewise key comparison then iterates a directory's children
//! in one contiguous range.
//!
//! Two suffixes are reserved and never collide with child names: the empty
//! suffix marks the per-directory index record and `"/"` marks the
//! directory's own stat record (names cannot contain a slash, and hashed
//! suffixes are always eight bytes).

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::{FsError, FsResult};
use crate::types::{DirId, Stat, STAT_ENCODED_LEN};
use zerocopy::IntoBytes;

/// Suffix of the record holding a directory's own stat.
pub const DIR_STAT_SUFFIX: &[u8] = b"/";

/// Write a LEB128 varint.
pub fn put_varint<B: BufMut>(buf: &mut B, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Read a LEB128 varint. Returns `None` on truncation or overflow.
pub fn get_varint<B: Buf>(buf: &mut B) -> Option<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() || shift >= 64 {
            return None;
        }
        let byte = buf.get_u8();
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
    }
}

/// Write a varint-length-prefixed byte string.
pub fn put_length_prefixed<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Read a varint-length-prefixed byte string.
pub fn get_length_prefixed<B: Buf>(buf: &mut B) -> Option<Vec<u8>> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return None;
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Some(out)
}

/// Key layout selected at store instantiation.
///
/// The server uses `NameInKey` so that duplicate-name checks resolve from
/// the key alone; a readonly reader must be configured with the same mode
/// as the store it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    NameInKey,
    NameHash,
}

impl Default for KeyMode {
    fn default() -> Self {
        KeyMode::NameInKey
    }
}

/// Encoder/decoder for metadata keys and values under one [`KeyMode`].
#[derive(Debug, Clone, Copy)]
pub struct KeyCodec {
    mode: KeyMode,
}

impl KeyCodec {
    pub fn new(mode: KeyMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    /// Common prefix of every record belonging to `id`.
    pub fn dir_prefix(&self, id: &DirId) -> Vec<u8> {
        let mut key = Vec::with_capacity(20);
        put_varint(&mut key, id.dnode);
        put_varint(&mut key, id.inode);
        key
    }

    /// Key of the child entry `name` under `id`.
    pub fn child_key(&self, id: &DirId, name: &str) -> Vec<u8> {
        let mut key = self.dir_prefix(id);
        match self.mode {
            KeyMode::NameInKey => key.extend_from_slice(name.as_bytes()),
            KeyMode::NameHash => {
                key.extend_from_slice(&xxh64(name.as_bytes(), 0).to_be_bytes())
            }
        }
        key
    }

    /// Key of the per-directory index record (inode counter + giga state).
    pub fn dir_index_key(&self, id: &DirId) -> Vec<u8> {
        self.dir_prefix(id)
    }

    /// Key of the directory's own stat record.
    pub fn dir_stat_key(&self, id: &DirId) -> Vec<u8> {
        let mut key = self.dir_prefix(id);
        key.extend_from_slice(DIR_STAT_SUFFIX);
        key
    }

    /// Split a key into its directory id and suffix.
    pub fn split_key<'a>(&self, key: &'a [u8]) -> Option<(DirId, &'a [u8])> {
        let mut cursor = key;
        let dnode = get_varint(&mut cursor)?;
        let inode = get_varint(&mut cursor)?;
        Some((DirId::new(dnode, inode), cursor))
    }

    /// True if `suffix` names neither a child entry nor anything the engine
    /// should migrate (the index record and the dir's own stat record).
    pub fn is_reserved_suffix(&self, suffix: &[u8]) -> bool {
        suffix.is_empty() || suffix == DIR_STAT_SUFFIX
    }

    /// Encode the value stored for a child entry.
    ///
    /// `NameInKey` stores the bare stat record; `NameHash` appends the
    /// length-prefixed name so scans can recover it.
    pub fn encode_value(&self, stat: &Stat, name: &str) -> Vec<u8> {
        let mut value = Vec::with_capacity(STAT_ENCODED_LEN + name.len() + 2);
        value.extend_from_slice(stat.as_bytes());
        if self.mode == KeyMode::NameHash {
            put_length_prefixed(&mut value, name.as_bytes());
        }
        value
    }

    /// Decode a child entry value into its stat and, in `NameHash` mode, the
    /// child name.
    pub fn decode_value(&self, value: &[u8]) -> FsResult<(Stat, Option<String>)> {
        if value.len() < STAT_ENCODED_LEN {
            return Err(FsError::Corruption(format!(
                "stat record too short: {} bytes",
                value.len()
            )));
        }
        let stat = Stat::decode(&value[..STAT_ENCODED_LEN])
            .ok_or_else(|| FsError::Corruption("undecodable stat record".to_string()))?;
        match self.mode {
            KeyMode::NameInKey => Ok((stat, None)),
            KeyMode::NameHash => {
                let mut rest = &value[STAT_ENCODED_LEN..];
                let raw = get_length_prefixed(&mut rest)
                    .ok_or_else(|| FsError::Corruption("missing name in record".to_string()))?;
                let name = String::from_utf8(raw)
                    .map_err(|_| FsError::Corruption("non-utf8 name in record".to_string()))?;
                Ok((stat, Some(name)))
            }
        }
    }

    /// Recover the child name of a scanned `(key, value)` pair.
    pub fn entry_name(&self, suffix: &[u8], value: &[u8]) -> FsResult<String> {
        match self.mode {
            KeyMode::NameInKey => String::from_utf8(suffix.to_vec())
                .map_err(|_| FsError::Corruption("non-utf8 name in key".to_string())),
            KeyMode::NameHash => {
                let (_, name) = self.decode_value(value)?;
                name.ok_or_else(|| FsError::Corruption("missing name in record".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{S_IFREG, now_micros};
    use proptest::prelude::*;

    #[test]
    fn test_varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            let mut cursor = &buf[..];
            assert_eq!(get_varint(&mut cursor), Some(v));
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut cursor: &[u8] = &[0x80];
        assert_eq!(get_varint(&mut cursor), None);
    }

    #[test]
    fn test_child_keys_share_dir_prefix() {
        let codec = KeyCodec::new(KeyMode::NameInKey);
        let id = DirId::new(1, 9);
        let prefix = codec.dir_prefix(&id);
        for name in ["a", "bb", "zzz"] {
            let key = codec.child_key(&id, name);
            assert!(key.starts_with(&prefix));
        }
        // Sibling directory keys sort outside the prefix range.
        let other = codec.child_key(&DirId::new(1, 10), "a");
        assert!(!other.starts_with(&prefix) || other == prefix);
    }

    #[test]
    fn test_reserved_suffixes() {
        let codec = KeyCodec::new(KeyMode::NameInKey);
        let id = DirId::ROOT;
        let dir_index_key = codec.dir_index_key(&id);
        let (back, suffix) = codec.split_key(&dir_index_key).unwrap();
        assert_eq!(back, id);
        assert!(codec.is_reserved_suffix(suffix));
        let dir_stat_key = codec.dir_stat_key(&id);
        let (_, suffix) = codec.split_key(&dir_stat_key).unwrap();
        assert!(codec.is_reserved_suffix(suffix));
        let child_key = codec.child_key(&id, "a");
        let (_, suffix) = codec.split_key(&child_key).unwrap();
        assert!(!codec.is_reserved_suffix(suffix));
    }

    #[test]
    fn test_name_hash_value_round_trip() {
        let codec = KeyCodec::new(KeyMode::NameHash);
        let stat = Stat::new(0, 3, 0, S_IFREG | 0o600, 1, 1, now_micros());
        let value = codec.encode_value(&stat, "hello");
        let (back, name) = codec.decode_value(&value).unwrap();
        assert_eq!(back, stat);
        assert_eq!(name.as_deref(), Some("hello"));
        let key = codec.child_key(&DirId::ROOT, "hello");
        let (_, suffix) = codec.split_key(&key).unwrap();
        assert_eq!(suffix.len(), 8);
        assert_eq!(codec.entry_name(suffix, &value).unwrap(), "hello");
    }

    proptest! {
        #[test]
        fn prop_key_ordering_by_name(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
            let codec = KeyCodec::new(KeyMode::NameInKey);
            let id = DirId::new(2, 5);
            let ka = codec.child_key(&id, &a);
            let kb = codec.child_key(&id, &b);
            prop_assert_eq!(ka.cmp(&kb), a.as_bytes().cmp(b.as_bytes()));
        }

        #[test]
        fn prop_varint_round_trip(v in any::<u64>()) {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            let mut cursor = &buf[..];
            prop_assert_eq!(get_varint(&mut cursor), Some(v));
        }
    }
}
