//! GigaFS - the metadata plane of a distributed filesystem for bursty,
//! fan-in file creation.
//!
//! GigaFS stripes each directory's name space over logical partitions that
//! split on demand and spread across metadata servers, while clients cache
//! partition maps and lookup leases and batch file creates to amortize
//! round trips. It features:
//!
//! - **Incremental directory partitioning**: a directory starts as one
//!   partition and doubles through hash-splits as it grows, with clients
//!   refreshing their partition maps lazily from server redirects
//! - **Lease-protected client caching**: per-directory, per-partition LRU
//!   caches of lookup leases with bucket-level singleflight, so a storm of
//!   lookups for one name costs one RPC
//! - **Batched creates**: per-partition write buffers drained as bulk
//!   create RPCs, one round trip per owning server per flush
//! - **Ordered KV persistence**: metadata records live in an embedded
//!   ordered key-value store keyed by directory id and child name
//!
//! # Architecture
//!
//! - **Data model** ([`types`], [`keys`]): fixed-layout stat records and
//!   the lexicographic metadata key encoding
//! - **Directory index** ([`giga`]): the per-directory partition bitmap,
//!   split rule, and name-to-partition routing
//! - **Storage** ([`db`]): the ordered KV adapter with in-memory and
//!   on-disk engines plus sorted-run bulk loading
//! - **Server** ([`server`]): the metadata engine enforcing lease,
//!   permission, and duplicate-name preconditions, and a readonly reader
//! - **RPC** ([`rpc`]): message codecs, pooled client stubs, and the
//!   threaded server loop
//! - **Client** ([`client`]): pathname resolution over the lookup cache
//!   and the batched-create path
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gigafs::client::{FilesystemCli, FilesystemCliOptions};
//! use gigafs::db::MemDb;
//! use gigafs::server::{FilesystemOptions, MetadataEngine};
//! use gigafs::types::User;
//!
//! # fn main() -> Result<(), gigafs::error::FsError> {
//! let engine = MetadataEngine::open(Arc::new(MemDb::new()), FilesystemOptions::default())?;
//! let cli = FilesystemCli::open_local(engine, FilesystemCliOptions::default())?;
//!
//! let who = User::new(1, 1);
//! cli.mkdir(&who, None, "/logs", 0o755)?;
//! let batch = cli.batch_start(&who, None, "/logs", 0o660)?;
//! for i in 0..10_000 {
//!     cli.batch_creat(&batch, &format!("rank-{i}"))?;
//! }
//! cli.batch_commit(&batch)?;
//! cli.batch_end(batch)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod giga;
pub mod keys;
pub mod logging;
pub mod rpc;
pub mod server;
pub mod types;
