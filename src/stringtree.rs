//! String-value overlay.
//!
//! Maps bounded-length keys to arbitrary-length byte strings by storing, in
//! the tree, the offset of a value record appended to the same file. The
//! value heap is append-only: an overwrite or delete strands the old blob,
//! and nothing reclaims that space short of recopying the whole file (see
//! [crate::recopy_strings]).

use std::fs::File;

use crate::config::TreeConfiguration;
use crate::errors::Result;
use crate::tree::{BplusTree, TreeInfo, Walker};

pub struct StringTree {
    tree: BplusTree,
}

impl StringTree {
    pub fn create(file: File, position: u64, nodesize: usize, keylen: usize) -> Result<StringTree> {
        Ok(StringTree {
            tree: BplusTree::create(file, position, nodesize, keylen)?,
        })
    }

    pub fn create_with(file: File, position: u64, config: &TreeConfiguration) -> Result<StringTree> {
        Ok(StringTree {
            tree: BplusTree::create_with(file, position, config)?,
        })
    }

    pub fn open(file: File, position: u64) -> Result<StringTree> {
        Ok(StringTree {
            tree: BplusTree::open(file, position)?,
        })
    }

    /// Read-only view with a lookup memo; mutations fail with `ReadOnly`.
    pub fn open_read_cached(file: File, position: u64) -> Result<StringTree> {
        Ok(StringTree {
            tree: BplusTree::open_read_cached(file, position)?,
        })
    }

    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn nodesize(&self) -> usize {
        self.tree.nodesize()
    }

    pub fn keylen(&self) -> usize {
        self.tree.keylen()
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let seek = self.tree.get(key)?;
        self.tree.read_string_at(seek as u64)
    }

    /// Append the value to the heap and point the tree at it. Overwriting
    /// strands the previous blob.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.ensure_writable()?;
        self.tree.check_key(key)?;
        let seek = self.tree.append_string(value)?;
        self.tree.put(key, seek as i64)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.tree.delete(key)
    }

    pub fn has_key(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.has_key(key)
    }

    pub fn enable_cache(&mut self, capacity: usize) -> Result<()> {
        self.tree.enable_cache(capacity)
    }

    pub fn disable_cache(&mut self) -> Result<()> {
        self.tree.disable_cache()
    }

    /// The values in the snapshot are heap offsets, not the strings.
    pub fn dump(&mut self) -> Result<TreeInfo> {
        self.tree.dump()
    }

    pub fn verify(&mut self) -> Result<()> {
        self.tree.verify()
    }

    pub fn walker(
        &mut self,
        lower: Option<&[u8]>,
        include_lower: bool,
        upper: Option<&[u8]>,
        include_upper: bool,
    ) -> Result<StringWalker<'_>> {
        Ok(StringWalker {
            inner: self
                .tree
                .walker(lower, include_lower, upper, include_upper)?,
        })
    }

    pub(crate) fn tree_mut(&mut self) -> &mut BplusTree {
        &mut self.tree
    }
}

/// [Walker] companion that resolves heap offsets into the stored strings.
pub struct StringWalker<'a> {
    inner: Walker<'a>,
}

impl<'a> StringWalker<'a> {
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn first(&mut self) -> Result<()> {
        self.inner.first()
    }

    pub fn next(&mut self) -> Result<()> {
        self.inner.next()
    }

    pub fn current_key(&self) -> Option<&[u8]> {
        self.inner.current_key()
    }

    /// The value at the current position, read from the heap.
    pub fn current_value(&mut self) -> Result<Option<Vec<u8>>> {
        match self.inner.current_value() {
            None => Ok(None),
            Some(seek) => self.inner.tree.read_string_at(seek as u64).map(Some),
        }
    }
}
