//! Per-directory partition index (the GIGA+ scheme).
//!
//! A directory's name space is striped over up to `max_partitions` logical
//! partitions forming a binary split tree: partition `i` at split depth `d`
//! splits into `i` and `i + 2^d`, and a present-partition bitmap records
//! which tree nodes exist. Names route by hash: take the low
//! `log2(max_partitions)` bits of `xxh32(name)` as the conceptual leaf and
//! strip high bits until a present partition is reached. Partition 0 is
//! always present, so routing always terminates on a present partition.
//!
//! Clients cache index snapshots and lazily refresh them from
//! `StaleDirIndex` redirects; snapshots only ever gain bits, so merging is
//! a bitwise or.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::xxh32;

use crate::error::{FsError, FsResult};
use crate::keys::{get_varint, put_varint};

/// Hash seed shared by every client and server of one deployment.
const GIGA_SEED: u32 = 0;

/// Uniform 32-bit hash of a child name.
pub fn giga_hash(name: &str) -> u32 {
    xxh32(name.as_bytes(), GIGA_SEED)
}

/// Geometry and split policy for directory indexes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DirIndexOptions {
    /// Number of physical servers.
    pub num_servers: u32,
    /// Number of virtual servers; must be a multiple of `num_servers`.
    pub num_virtual_servers: u32,
    /// Upper bound on partitions per directory; a power of two.
    pub max_partitions: u32,
    /// A partition splits once its population exceeds this threshold.
    pub split_threshold: u64,
}

impl Default for DirIndexOptions {
    fn default() -> Self {
        Self {
            num_servers: 1,
            num_virtual_servers: 1,
            max_partitions: 1024,
            split_threshold: 2048,
        }
    }
}

impl DirIndexOptions {
    pub fn validate(&self) -> FsResult<()> {
        if self.num_servers == 0 || self.num_virtual_servers == 0 {
            return Err(FsError::InvalidArgument(
                "server counts must be non-zero".to_string(),
            ));
        }
        if self.num_virtual_servers % self.num_servers != 0 {
            return Err(FsError::InvalidArgument(
                "virtual servers must be a multiple of physical servers".to_string(),
            ));
        }
        if !self.max_partitions.is_power_of_two() {
            return Err(FsError::InvalidArgument(
                "max_partitions must be a power of two".to_string(),
            ));
        }
        if self.split_threshold == 0 {
            return Err(FsError::InvalidArgument(
                "split_threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server-authoritative partition state of one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirIndex {
    zeroth_server: u32,
    num_servers: u32,
    num_virtual_servers: u32,
    max_partitions: u32,
    bitmap: Vec<u64>,
}

impl DirIndex {
    /// A fresh index with only partition 0 present.
    pub fn new(zeroth_server: u32, opts: &DirIndexOptions) -> Self {
        let words = (opts.max_partitions as usize).div_ceil(64);
        let mut index = Self {
            zeroth_server,
            num_servers: opts.num_servers,
            num_virtual_servers: opts.num_virtual_servers,
            max_partitions: opts.max_partitions,
            bitmap: vec![0; words],
        };
        index.set_partition(0);
        index
    }

    pub fn zeroth_server(&self) -> u32 {
        self.zeroth_server
    }

    pub fn max_partitions(&self) -> u32 {
        self.max_partitions
    }

    /// Number of partitions currently present.
    pub fn partition_count(&self) -> u32 {
        self.bitmap.iter().map(|w| w.count_ones()).sum()
    }

    pub fn test_partition(&self, i: u32) -> bool {
        if i >= self.max_partitions {
            return false;
        }
        self.bitmap[(i / 64) as usize] >> (i % 64) & 1 == 1
    }

    pub fn set_partition(&mut self, i: u32) {
        debug_assert!(i < self.max_partitions);
        self.bitmap[(i / 64) as usize] |= 1u64 << (i % 64);
    }

    /// Owning partition for a name hash.
    ///
    /// Starts at the conceptual leaf (`hash` masked to the index radix) and
    /// walks up the split tree until a present partition is found. The walk
    /// is the bottom-up form of the spec's top-down descent and agrees with
    /// it on every bitmap reachable through [`DirIndex::split_target`].
    pub fn partition_of(&self, hash: u32) -> u32 {
        let mut i = hash & (self.max_partitions - 1);
        while i != 0 && !self.test_partition(i) {
            // Strip the highest set bit: the parent of partition i.
            i &= !(1u32 << (31 - i.leading_zeros()));
        }
        i
    }

    /// Split child of partition `i`, or `None` when the index is at its
    /// partition bound.
    ///
    /// The first split of `i` produces `i + 2^ceil(log2(i+1))`; each further
    /// split of the same partition doubles the stride.
    pub fn split_target(&self, i: u32) -> Option<u32> {
        let mut depth = if i == 0 { 0 } else { 32 - i.leading_zeros() };
        loop {
            let child = i.checked_add(1u32.checked_shl(depth)?)?;
            if child >= self.max_partitions {
                return None;
            }
            if !self.test_partition(child) {
                return Some(child);
            }
            depth += 1;
        }
    }

    /// Split depth `d` of a child index produced by [`DirIndex::split_target`],
    /// i.e. `child = parent + 2^d`. Names migrate to `child` iff the low
    /// `d + 1` bits of their hash equal `child`.
    pub fn migration_mask(child: u32) -> u32 {
        debug_assert!(child > 0);
        let depth = 31 - child.leading_zeros();
        (1u32 << (depth + 1)) - 1
    }

    /// True if `hash` re-routes to `child` once `child` is present.
    pub fn routes_to_child(child: u32, hash: u32) -> bool {
        hash & Self::migration_mask(child) == child
    }

    /// Physical server owning partition `i`: virtual server
    /// `(zeroth_server + i) mod vsrvs`, folded onto the physical servers by
    /// integer division. Stable as the index grows.
    pub fn server_of(&self, i: u32) -> u32 {
        let v = (self.zeroth_server.wrapping_add(i)) % self.num_virtual_servers;
        v * self.num_servers / self.num_virtual_servers
    }

    /// Compact snapshot exchanged with clients and persisted in the
    /// per-directory index record.
    pub fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        put_varint(buf, self.zeroth_server as u64);
        put_varint(buf, self.num_servers as u64);
        put_varint(buf, self.num_virtual_servers as u64);
        put_varint(buf, self.max_partitions as u64);
        for word in &self.bitmap {
            buf.put_slice(&word.to_le_bytes());
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.bitmap.len() * 8);
        self.encode(&mut buf);
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> FsResult<DirIndex> {
        let corrupt = || FsError::Corruption("bad dir index snapshot".to_string());
        let zeroth_server = get_varint(&mut bytes).ok_or_else(corrupt)? as u32;
        let num_servers = get_varint(&mut bytes).ok_or_else(corrupt)? as u32;
        let num_virtual_servers = get_varint(&mut bytes).ok_or_else(corrupt)? as u32;
        let max_partitions = get_varint(&mut bytes).ok_or_else(corrupt)? as u32;
        if num_servers == 0
            || num_virtual_servers == 0
            || !max_partitions.is_power_of_two()
        {
            return Err(corrupt());
        }
        let words = (max_partitions as usize).div_ceil(64);
        if bytes.len() < words * 8 {
            return Err(corrupt());
        }
        let mut bitmap = Vec::with_capacity(words);
        for chunk in bytes[..words * 8].chunks_exact(8) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            bitmap.push(u64::from_le_bytes(word));
        }
        let mut index = DirIndex {
            zeroth_server,
            num_servers,
            num_virtual_servers,
            max_partitions,
            bitmap,
        };
        index.set_partition(0);
        Ok(index)
    }

    /// Fold a newer snapshot of the same directory into this one. Indexes
    /// only gain partitions, so a bitwise or never loses information.
    pub fn merge(&mut self, other: &DirIndex) -> FsResult<()> {
        if other.max_partitions != self.max_partitions {
            return Err(FsError::InvalidArgument(
                "dir index geometry mismatch".to_string(),
            ));
        }
        for (word, more) in self.bitmap.iter_mut().zip(other.bitmap.iter()) {
            *word |= more;
        }
        Ok(())
    }
}
