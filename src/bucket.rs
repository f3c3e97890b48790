//! Bucket-hash overlay.
//!
//! A dbm-style mapping with arbitrary-length keys and values, layered on the
//! string overlay. Keys are hashed with a portable string hash into one of
//! ~8.3 million buckets; the bucket's tree key is the hash rendered as a
//! fixed-width byte string, and its tree value is a serialized dictionary of
//! the real key/value pairs that landed there. Every operation
//! reads-modifies-writes its bucket, so overwrites, deletions and collisions
//! all strand garbage in the value heap; [BucketMap::copy_compact] is the way
//! out.
//!
//! The store keeps its own length in an integer record ahead of the tree
//! header and rewrites it on [BucketMap::close]. Skipping close loses recent
//! writes, the same as closing the tree file with the cache enabled.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Write};
use std::path::Path;

use log::debug;

use crate::codec::{self, INT_LEN};
use crate::errors::{Error, Result};
use crate::stringtree::StringTree;

const BUCKET_NODESIZE: usize = 4096;
/// The stripped integer serialization is the bucket key.
const BUCKET_KEYLEN: usize = INT_LEN - 1;
const BUCKET_CACHE: usize = BUCKET_NODESIZE + 3;

const BUCKETS: i64 = 8_320_631;

/// Portable deterministic string hash into `[0, 8_320_631)`.
pub fn bucket_hash(s: &[u8]) -> i64 {
    let mut h = 775 + s.len() as i64 * 1001;
    for &c in s {
        h = (h * 253 + c as i64 * 113) % BUCKETS;
    }
    h
}

fn bucket_key(s: &[u8]) -> Vec<u8> {
    codec::int_key(bucket_hash(s)).to_vec()
}

fn load_bucket(tree: &mut StringTree, hash_key: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    match tree.get(hash_key) {
        Ok(blob) => codec::get_map(&mut Cursor::new(&blob[..])),
        Err(Error::KeyNotFound) => Ok(BTreeMap::new()),
        Err(e) => Err(e),
    }
}

fn store_bucket(
    tree: &mut StringTree,
    hash_key: &[u8],
    pairs: &BTreeMap<Vec<u8>, Vec<u8>>,
) -> Result<()> {
    let mut buf = Vec::new();
    codec::put_map(&mut buf, pairs)?;
    tree.put(hash_key, &buf)
}

struct Inner {
    tree: StringTree,
    length: u64,
    writable: bool,
}

/// Hash-bucketed map with unbounded key and value lengths.
pub struct BucketMap {
    inner: Option<Inner>,
}

impl BucketMap {
    /// Create a new store, truncating anything at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<BucketMap> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut buf = Vec::with_capacity(INT_LEN);
        codec::put_int(&mut buf, 0)?;
        file.write_all(&buf)?;
        let mut tree = StringTree::create(file, INT_LEN as u64, BUCKET_NODESIZE, BUCKET_KEYLEN)?;
        tree.enable_cache(BUCKET_CACHE)?;
        Ok(BucketMap {
            inner: Some(Inner {
                tree,
                length: 0,
                writable: true,
            }),
        })
    }

    /// Open an existing store for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<BucketMap> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let length = codec::get_int(&mut file)?;
        if length < 0 {
            return Err(Error::corruption("negative length record"));
        }
        let mut tree = StringTree::open(file, INT_LEN as u64)?;
        tree.enable_cache(BUCKET_CACHE)?;
        Ok(BucketMap {
            inner: Some(Inner {
                tree,
                length: length as u64,
                writable: true,
            }),
        })
    }

    /// Open an existing store read-only, with lookups memoized.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<BucketMap> {
        let mut file = File::open(path)?;
        let length = codec::get_int(&mut file)?;
        if length < 0 {
            return Err(Error::corruption("negative length record"));
        }
        let mut tree = StringTree::open_read_cached(file, INT_LEN as u64)?;
        tree.enable_cache(BUCKET_CACHE)?;
        Ok(BucketMap {
            inner: Some(Inner {
                tree,
                length: length as u64,
                writable: false,
            }),
        })
    }

    fn inner_mut(&mut self) -> Result<&mut Inner> {
        self.inner.as_mut().ok_or(Error::NotOpen)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.inner.as_ref().ok_or(Error::NotOpen)?.length)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner_mut()?;
        let pairs = load_bucket(&mut inner.tree, &bucket_key(key))?;
        pairs.get(key).cloned().ok_or(Error::KeyNotFound)
    }

    pub fn has_key(&mut self, key: &[u8]) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(Error::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let inner = self.inner_mut()?;
        if !inner.writable {
            return Err(Error::ReadOnly);
        }
        let hash_key = bucket_key(key);
        let mut pairs = load_bucket(&mut inner.tree, &hash_key)?;
        let fresh = pairs.insert(key.to_vec(), value.to_vec()).is_none();
        store_bucket(&mut inner.tree, &hash_key, &pairs)?;
        if fresh {
            inner.length += 1;
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let inner = self.inner_mut()?;
        if !inner.writable {
            return Err(Error::ReadOnly);
        }
        let hash_key = bucket_key(key);
        let mut pairs = load_bucket(&mut inner.tree, &hash_key)?;
        if pairs.remove(key).is_none() {
            return Err(Error::KeyNotFound);
        }
        if pairs.is_empty() {
            inner.tree.delete(&hash_key)?;
        } else {
            store_bucket(&mut inner.tree, &hash_key, &pairs)?;
        }
        inner.length -= 1;
        Ok(())
    }

    /// Every real key, in bucket order. Walks the whole tree and
    /// cross-checks the stored length.
    pub fn keys(&mut self) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner_mut()?;
        let mut result = Vec::new();
        let mut walker = inner.tree.walker(None, false, None, false)?;
        while walker.valid() {
            let Some(blob) = walker.current_value()? else {
                break;
            };
            let pairs = codec::get_map(&mut Cursor::new(&blob[..]))?;
            result.extend(pairs.into_keys());
            walker.next()?;
        }
        drop(walker);
        if result.len() as u64 != inner.length {
            return Err(Error::corruption(
                "length record disagrees with a full bucket walk",
            ));
        }
        Ok(result)
    }

    /// Flush the cache, persist the length record, and invalidate the
    /// handle. Every later operation fails with `NotOpen`.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut inner) = self.inner.take() else {
            return Ok(());
        };
        inner.tree.disable_cache()?;
        if inner.writable {
            let mut buf = Vec::with_capacity(INT_LEN);
            codec::put_int(&mut buf, inner.length as i64)?;
            inner.tree.tree_mut().file_mut().write_record(0, &buf)?;
        }
        Ok(())
    }

    /// Recopy into a fresh store at `path`, dropping all stranded heap
    /// garbage.
    pub fn copy_compact<P: AsRef<Path>>(&mut self, path: P) -> Result<BucketMap> {
        let inner = self.inner_mut()?;
        debug!("compacting bucket store of {} entries", inner.length);
        let mut other = BucketMap::create(path)?;
        {
            let dst = other.inner_mut()?;
            dst.tree.disable_cache()?;
            crate::compact::recopy_strings(&mut inner.tree, &mut dst.tree)?;
            dst.length = inner.length;
            dst.tree.enable_cache(BUCKET_CACHE)?;
        }
        Ok(other)
    }

    /// Re-insert every pair into an already-open store. Collisions with
    /// existing buckets strand garbage in the destination, unlike
    /// [BucketMap::copy_compact].
    pub fn merge_into(&mut self, other: &mut BucketMap) -> Result<()> {
        let inner = self.inner_mut()?;
        let mut buckets = Vec::new();
        let mut walker = inner.tree.walker(None, false, None, false)?;
        while walker.valid() {
            let Some(blob) = walker.current_value()? else {
                break;
            };
            buckets.push(blob);
            walker.next()?;
        }
        drop(walker);
        for blob in buckets {
            let pairs = codec::get_map(&mut Cursor::new(&blob[..]))?;
            for (key, value) in pairs {
                other.put(&key, &value)?;
            }
        }
        Ok(())
    }
}

impl Drop for BucketMap {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
