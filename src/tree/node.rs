//! In-memory image of one tree node.
//!
//! A node is a fixed-size record at a file offset. Leaves pair each valid key
//! with an integer payload and keep a forward pointer to the next leaf in the
//! final index slot; interior nodes pair each valid key with the child that
//! covers keys at or above it, with `indices[0]` covering everything below
//! the first key. Freed nodes reuse `indices[0]` as the next-free link.
//!
//! The arrays always have full length; slots at `validkeys` and beyond are
//! stale and must never be consulted. An interior `validkeys` of -1 means the
//! node has no child pointers at all, a state that only occurs while a node
//! is being rebuilt and never survives a completed operation.

use std::io::Cursor;

use crate::codec;
use crate::errors::{Error, Result};

/// The universal "no such offset" sentinel.
pub(crate) const NIL_SEEK: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeFlag {
    Root = 1,
    Interior = 2,
    Free = 3,
    Leaf = 4,
    LeafAndRoot = 5,
}

impl NodeFlag {
    pub fn from_i64(v: i64) -> Option<NodeFlag> {
        match v {
            1 => Some(NodeFlag::Root),
            2 => Some(NodeFlag::Interior),
            3 => Some(NodeFlag::Free),
            4 => Some(NodeFlag::Leaf),
            5 => Some(NodeFlag::LeafAndRoot),
            _ => None,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, NodeFlag::Leaf | NodeFlag::LeafAndRoot)
    }

    pub fn is_interior(self) -> bool {
        matches!(self, NodeFlag::Interior | NodeFlag::Root)
    }
}

/// Internal signal that a node has no slot left for a new entry. The engine
/// converts it into a split; it never escapes to callers.
#[derive(Debug)]
pub(crate) struct NoRoom;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub flag: NodeFlag,
    /// Count of live key slots; -1 on an interior node under construction.
    pub validkeys: i32,
    /// Child offsets (interior) or payloads plus the forward-leaf offset
    /// (leaf). Always `nodesize + 1` entries.
    pub indices: Vec<i64>,
    /// Always `nodesize` entries, stale beyond `validkeys`.
    pub keys: Vec<Vec<u8>>,
    /// Own file offset. Never changes after allocation.
    pub position: u64,
    pub dirty: bool,
}

/// First index whose key is strictly greater, over the valid prefix only.
pub(crate) fn upper_bound(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|k| k.as_slice() <= key)
}

/// Ordered insert into a presorted entry list.
pub(crate) fn insort(entries: &mut Vec<(Vec<u8>, i64)>, key: &[u8], value: i64) {
    let place = entries.partition_point(|(k, _)| k.as_slice() <= key);
    entries.insert(place, (key.to_vec(), value));
}

impl Node {
    pub fn new(flag: NodeFlag, nodesize: usize, position: u64) -> Node {
        Node {
            flag,
            validkeys: if flag.is_interior() { -1 } else { 0 },
            indices: vec![NIL_SEEK; nodesize + 1],
            keys: vec![Vec::new(); nodesize],
            position,
            dirty: false,
        }
    }

    pub fn nodesize(&self) -> usize {
        self.keys.len()
    }

    /// Reinitialize keys and indices. A leaf keeps its forward pointer.
    pub fn clear(&mut self) {
        let size = self.nodesize();
        for key in &mut self.keys {
            key.clear();
        }
        if self.flag.is_interior() {
            for index in &mut self.indices {
                *index = NIL_SEEK;
            }
            self.validkeys = -1;
        } else {
            for index in &mut self.indices[..size] {
                *index = NIL_SEEK;
            }
            self.validkeys = 0;
        }
    }

    pub fn valid_keys(&self) -> &[Vec<u8>] {
        &self.keys[..self.validkeys.max(0) as usize]
    }

    fn position_of(&self, key: &[u8]) -> Option<usize> {
        self.valid_keys()
            .binary_search_by(|k| k.as_slice().cmp(key))
            .ok()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.position_of(key).is_some()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.valid_keys().first().map(|k| k.as_slice())
    }

    /// Forward offset to the next leaf, or [NIL_SEEK].
    pub fn next_leaf(&self) -> i64 {
        debug_assert!(self.flag.is_leaf());
        self.indices[self.nodesize()]
    }

    // interior operations

    /// Insert a separator and the child to its right, keeping key order.
    /// Reinserting an existing separator is an engine bug, not an input
    /// error.
    pub fn insert_child(&mut self, key: &[u8], position: i64) -> std::result::Result<(), NoRoom> {
        debug_assert!(self.flag.is_interior());
        debug_assert!(self.validkeys >= 0, "separator insert into unbuilt node");
        debug_assert!(!self.contains_key(key), "separator reinsert");
        let validkeys = self.validkeys as usize;
        if validkeys >= self.nodesize() {
            return Err(NoRoom);
        }
        let place = upper_bound(self.valid_keys(), key);
        self.keys.insert(place, key.to_vec());
        self.keys.remove(validkeys + 1);
        self.indices.insert(place + 1, position);
        self.indices.remove(validkeys + 2);
        self.validkeys += 1;
        Ok(())
    }

    /// Make this node cover a single child, the one below every separator.
    pub fn set_first_child(&mut self, position: i64) {
        debug_assert!(self.validkeys < 0, "first child already assigned");
        self.indices[0] = position;
        self.validkeys = 0;
    }

    /// Remove the child pointer to the right of `key`, or the leftmost child
    /// pointer for `None`. The separator must match exactly; a miss means the
    /// parent and child disagree about the tree shape.
    pub fn delete_child(&mut self, key: Option<&[u8]>) -> Result<()> {
        debug_assert!(self.flag.is_interior());
        if self.validkeys < 0 {
            return Err(Error::corruption("separator delete from empty node"));
        }
        let (place, indexplace) = match key {
            None => (0, 0),
            Some(key) => {
                let place = self
                    .position_of(key)
                    .ok_or_else(|| Error::corruption("separator not found in parent"))?;
                (place, place + 1)
            }
        };
        self.indices.remove(indexplace);
        self.indices.push(NIL_SEEK);
        self.keys.remove(place);
        self.keys.push(Vec::new());
        self.validkeys -= 1;
        Ok(())
    }

    /// Pair every valid key with its index. Interior nodes prefix the list
    /// with `(leftmost, indices[0])` so the result enumerates all children.
    pub fn keys_indices(&self, leftmost: &[u8]) -> Vec<(Vec<u8>, i64)> {
        let mut keys: Vec<Vec<u8>> = self.valid_keys().to_vec();
        if self.flag.is_interior() {
            keys.insert(0, leftmost.to_vec());
        }
        keys.into_iter()
            .zip(self.indices.iter().copied())
            .collect()
    }

    // leaf operations

    /// Insert or overwrite one mapping. Only a new key can run out of room.
    pub fn put_value(&mut self, key: &[u8], value: i64) -> std::result::Result<(), NoRoom> {
        debug_assert!(self.flag.is_leaf());
        if self.validkeys <= 0 {
            self.keys[0] = key.to_vec();
            self.indices[0] = value;
            self.validkeys = 1;
            return Ok(());
        }
        if let Some(place) = self.position_of(key) {
            self.indices[place] = value;
            return Ok(());
        }
        let validkeys = self.validkeys as usize;
        if validkeys >= self.nodesize() {
            return Err(NoRoom);
        }
        let place = upper_bound(self.valid_keys(), key);
        self.keys.remove(validkeys);
        self.keys.insert(place, key.to_vec());
        self.indices.remove(validkeys);
        self.indices.insert(place, value);
        self.validkeys += 1;
        Ok(())
    }

    pub fn delete_value(&mut self, key: &[u8]) -> Result<()> {
        debug_assert!(self.flag.is_leaf());
        let place = self.position_of(key).ok_or(Error::KeyNotFound)?;
        let prev = self.validkeys as usize - 1;
        self.keys.remove(place);
        self.keys.insert(prev, Vec::new());
        self.indices.remove(place);
        self.indices.insert(prev, NIL_SEEK);
        self.validkeys -= 1;
        Ok(())
    }

    pub fn get_value(&self, key: &[u8]) -> Result<i64> {
        debug_assert!(self.flag.is_leaf());
        let place = self.position_of(key).ok_or(Error::KeyNotFound)?;
        Ok(self.indices[place])
    }

    /// Build a fresh leaf at `position` spliced into the chain directly after
    /// this one.
    pub fn new_neighbor(&mut self, position: u64) -> Node {
        debug_assert!(self.flag.is_leaf());
        let size = self.nodesize();
        let mut neighbor = Node::new(NodeFlag::Leaf, size, position);
        neighbor.indices[size] = self.indices[size];
        self.indices[size] = position as i64;
        neighbor
    }

    /// Unlink the immediately following leaf from the chain.
    pub fn unlink_next(&mut self, next: &Node) -> Result<()> {
        let size = self.nodesize();
        if self.indices[size] != next.position as i64 {
            return Err(Error::corruption("leaf chain does not match merge pair"));
        }
        self.indices[size] = next.indices[size];
        Ok(())
    }

    // bulk loads used by split, merge and redistribute

    pub fn bulk_load_values(&mut self, entries: &[(Vec<u8>, i64)]) {
        debug_assert!(self.flag.is_leaf());
        debug_assert!(entries.len() <= self.nodesize());
        self.clear();
        for (i, (key, value)) in entries.iter().enumerate() {
            self.keys[i] = key.clone();
            self.indices[i] = *value;
        }
        self.validkeys = entries.len() as i32;
    }

    pub fn bulk_load_children(&mut self, first_position: i64, entries: &[(Vec<u8>, i64)]) {
        debug_assert!(self.flag.is_interior());
        debug_assert!(entries.len() <= self.nodesize());
        self.clear();
        self.indices[0] = first_position;
        for (i, (key, position)) in entries.iter().enumerate() {
            self.keys[i] = key.clone();
            self.indices[i + 1] = *position;
        }
        self.validkeys = entries.len() as i32;
    }

    /// Turn this node into a free-list element pointing at the previous head.
    pub fn make_free(&mut self, next_free: i64) {
        self.flag = NodeFlag::Free;
        self.indices[0] = next_free;
    }

    // record codec

    /// Serialize into exactly `record_len` bytes, filler-padded.
    pub fn pack(&self, record_len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(record_len);
        codec::put_seq_header(&mut buf, 2 + self.indices.len() + self.keys.len())?;
        codec::put_int(&mut buf, self.flag as i64)?;
        codec::put_int(&mut buf, self.validkeys as i64)?;
        for index in &self.indices {
            codec::put_int(&mut buf, *index)?;
        }
        for key in &self.keys {
            codec::put_bytes(&mut buf, key)?;
        }
        if buf.len() > record_len {
            return Err(Error::corruption(format!(
                "node record at {} encodes to {} bytes, limit {}",
                self.position,
                buf.len(),
                record_len
            )));
        }
        buf.resize(record_len, codec::RECORD_FILL);
        Ok(buf)
    }

    pub fn unpack(data: &[u8], nodesize: usize, keylen: usize, position: u64) -> Result<Node> {
        let mut r = Cursor::new(data);
        let count = codec::get_seq_header(&mut r)?;
        if count != 2 * nodesize + 3 {
            return Err(Error::corruption(format!(
                "node record at {} has {} fields, expected {}",
                position,
                count,
                2 * nodesize + 3
            )));
        }
        let flag = codec::get_int(&mut r)?;
        let flag = NodeFlag::from_i64(flag)
            .ok_or_else(|| Error::corruption(format!("unknown node flag {} at {}", flag, position)))?;
        let validkeys = codec::get_int(&mut r)?;
        if validkeys < -1 || validkeys > nodesize as i64 {
            return Err(Error::corruption(format!(
                "node at {} claims {} valid keys",
                position, validkeys
            )));
        }
        let mut indices = Vec::with_capacity(nodesize + 1);
        for _ in 0..nodesize + 1 {
            indices.push(codec::get_int(&mut r)?);
        }
        let mut keys = Vec::with_capacity(nodesize);
        for _ in 0..nodesize {
            let key = codec::get_bytes(&mut r)?;
            if key.len() > keylen {
                return Err(Error::corruption(format!(
                    "key longer than {} bytes in node at {}",
                    keylen, position
                )));
            }
            keys.push(key);
        }
        Ok(Node {
            flag,
            validkeys: validkeys as i32,
            indices,
            keys,
            position,
            dirty: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(entries: &[(&[u8], i64)]) -> Node {
        let mut node = Node::new(NodeFlag::Leaf, 4, 100);
        for (key, value) in entries {
            node.put_value(key, *value).ok().unwrap();
        }
        node
    }

    #[test]
    fn put_value_keeps_keys_sorted() {
        let node = leaf_with(&[(b"m", 1), (b"a", 2), (b"z", 3)]);
        assert_eq!(node.valid_keys(), &[b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
        assert_eq!(node.get_value(b"m").unwrap(), 1);
    }

    #[test]
    fn put_value_overwrites_in_place() {
        let mut node = leaf_with(&[(b"a", 1), (b"b", 2), (b"c", 3), (b"d", 4)]);
        // full leaf, existing key: overwrite must still succeed
        assert!(node.put_value(b"b", 20).is_ok());
        assert_eq!(node.validkeys, 4);
        assert_eq!(node.get_value(b"b").unwrap(), 20);
    }

    #[test]
    fn put_value_signals_no_room_only_for_new_keys() {
        let mut node = leaf_with(&[(b"a", 1), (b"b", 2), (b"c", 3), (b"d", 4)]);
        assert!(node.put_value(b"e", 5).is_err());
    }

    #[test]
    fn delete_value_preserves_forward_pointer() {
        let mut node = leaf_with(&[(b"a", 1), (b"b", 2), (b"c", 3)]);
        node.indices[4] = 999;
        node.delete_value(b"a").unwrap();
        assert_eq!(node.valid_keys(), &[b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(node.next_leaf(), 999);
        assert!(matches!(
            node.delete_value(b"a").unwrap_err(),
            Error::KeyNotFound
        ));
    }

    #[test]
    fn stale_slots_are_invisible() {
        let mut node = leaf_with(&[(b"a", 1), (b"b", 2)]);
        node.delete_value(b"b").unwrap();
        // "b" still sits in the stale region of the keys array
        assert!(!node.contains_key(b"b"));
        assert!(node.get_value(b"b").is_err());
    }

    #[test]
    fn insert_child_shifts_separators() {
        let mut node = Node::new(NodeFlag::Interior, 4, 0);
        node.set_first_child(10);
        node.insert_child(b"m", 20).ok().unwrap();
        node.insert_child(b"d", 15).ok().unwrap();
        assert_eq!(node.valid_keys(), &[b"d".to_vec(), b"m".to_vec()]);
        assert_eq!(&node.indices[..3], &[10, 15, 20]);
    }

    #[test]
    fn delete_child_removes_right_pointer() {
        let mut node = Node::new(NodeFlag::Interior, 4, 0);
        node.set_first_child(10);
        node.insert_child(b"d", 15).ok().unwrap();
        node.insert_child(b"m", 20).ok().unwrap();
        node.delete_child(Some(b"d")).unwrap();
        assert_eq!(node.valid_keys(), &[b"m".to_vec()]);
        assert_eq!(&node.indices[..2], &[10, 20]);
        node.delete_child(None).unwrap();
        assert_eq!(node.indices[0], 20);
        assert_eq!(node.validkeys, 0);
    }

    #[test]
    fn keys_indices_enumerates_children_with_label() {
        let mut node = Node::new(NodeFlag::Interior, 4, 0);
        node.set_first_child(10);
        node.insert_child(b"d", 15).ok().unwrap();
        assert_eq!(
            node.keys_indices(b"a"),
            vec![(b"a".to_vec(), 10), (b"d".to_vec(), 15)]
        );
    }

    #[test]
    fn new_neighbor_splices_the_chain() {
        let mut node = leaf_with(&[(b"a", 1)]);
        node.indices[4] = 300;
        let neighbor = node.new_neighbor(200);
        assert_eq!(node.next_leaf(), 200);
        assert_eq!(neighbor.next_leaf(), 300);
    }

    #[test]
    fn record_roundtrip() {
        let record_len = codec::node_record_len(4, 8);
        let mut node = leaf_with(&[(b"aa", 7), (b"bb", 9)]);
        node.indices[4] = 555;
        let buf = node.pack(record_len).unwrap();
        assert_eq!(buf.len(), record_len);
        let back = Node::unpack(&buf, 4, 8, node.position).unwrap();
        assert_eq!(back.validkeys, 2);
        assert_eq!(back.valid_keys(), node.valid_keys());
        assert_eq!(back.indices, node.indices);
        assert_eq!(back.flag, NodeFlag::Leaf);
    }

    #[test]
    fn pack_rejects_oversized_record() {
        let mut node = Node::new(NodeFlag::Leaf, 4, 0);
        node.put_value(b"this key is far too long for a record slot", 1)
            .ok()
            .unwrap();
        let record_len = codec::node_record_len(4, 8);
        assert!(matches!(
            node.pack(record_len).unwrap_err(),
            Error::Corruption { .. }
        ));
    }

    #[test]
    fn unpack_rejects_unknown_flag() {
        let record_len = codec::node_record_len(4, 8);
        let node = Node::new(NodeFlag::Leaf, 4, 0);
        let mut buf = node.pack(record_len).unwrap();
        // flag is the first integer after the sequence header
        buf[codec::SEQ_OVERHEAD + 1] = 9;
        assert!(matches!(
            Node::unpack(&buf, 4, 8, 0).unwrap_err(),
            Error::Corruption { .. }
        ));
    }

    #[test]
    fn unpack_rejects_overlong_key() {
        let record_len = codec::node_record_len(4, 2);
        let node = leaf_with(&[(b"ab", 1)]);
        let buf = node.pack(record_len).unwrap();
        assert!(Node::unpack(&buf, 4, 2, 0).is_ok());
        assert!(Node::unpack(&buf, 4, 1, 0).is_err());
    }
}
