//! Disk-resident B+ tree index.
//!
//! Maps byte-string keys of a bounded length to fixed-width integer
//! payloads, keeping a small number of disk accesses per operation and the
//! keys in sorted order for cheap range walks. Two overlays extend the core
//! mapping: [StringTree] stores arbitrary-length values in an append-only
//! heap inside the same file, and [BucketMap] hashes arbitrary-length keys
//! into [StringTree] buckets for dbm-style use.
//!
//! One file holds one tree: a small header, fixed-size node records, and
//! (for the string overlay) interleaved variable-length value records. Freed
//! nodes are chained into a free list and reused before the file grows.
//!
//! The engine is strictly single-threaded and exclusive: one open handle,
//! one writer, no journaling. A write-back node cache ([`enable_cache`])
//! batches disk writes for localized workloads, and must be disabled again
//! before the file is closed or handed to a reader, or the tree may come
//! apart. Walkers borrow the tree mutably, so the borrow checker enforces
//! the no-mutation-while-walking rule.
//!
//! [`enable_cache`]: BplusTree::enable_cache
//!
//! ```no_run
//! use bptree_storage::StringTree;
//!
//! # fn main() -> bptree_storage::Result<()> {
//! let file = std::fs::OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .create(true)
//!     .open("index")?;
//! let mut tree = StringTree::create(file, 0, 212, 10)?;
//! tree.put(b"this", b"that")?;
//! let mut walker = tree.walker(None, false, None, false)?;
//! while walker.valid() {
//!     let key = walker.current_key().unwrap().to_vec();
//!     let value = walker.current_value()?.unwrap();
//!     println!("{:?} -> {:?}", key, value);
//!     walker.next()?;
//! }
//! # Ok(())
//! # }
//! ```

mod bucket;
mod cache;
mod codec;
mod compact;
mod config;
mod errors;
mod storage;
mod stringtree;
mod tree;

pub use bucket::{bucket_hash, BucketMap};
pub use compact::{recopy_strings, recopy_tree};
pub use config::TreeConfiguration;
pub use errors::{Error, Result};
pub use stringtree::{StringTree, StringWalker};
pub use tree::{BplusTree, NodeInfo, TreeInfo, Walker};

/// Initialize `env_logger` once, for binaries and tests that want the
/// engine's `log` output on stderr.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::try_init();
}
