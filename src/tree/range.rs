//! Forward range iteration over the leaf chain.

use super::node::{upper_bound, Node, NIL_SEEK};
use super::BplusTree;
use crate::errors::{Error, Result};

/// Walks leaves left to right between an optional lower and upper bound,
/// each independently inclusive or exclusive.
///
/// Construction descends once to the leaf that would contain the lower
/// bound; advancing follows the per-leaf forward pointer and never touches
/// interior nodes again. The mutable borrow on the tree means the tree
/// cannot be modified while a walker is live.
pub struct Walker<'a> {
    pub(crate) tree: &'a mut BplusTree,
    lower: Option<Vec<u8>>,
    include_lower: bool,
    upper: Option<Vec<u8>>,
    include_upper: bool,
    start_position: u64,
    node: Node,
    node_index: usize,
    valid: bool,
}

impl<'a> Walker<'a> {
    pub(crate) fn new(
        tree: &'a mut BplusTree,
        lower: Option<&[u8]>,
        include_lower: bool,
        upper: Option<&[u8]>,
        include_upper: bool,
    ) -> Result<Walker<'a>> {
        // pick, at every interior node, the last child whose separator does
        // not exceed the lower bound
        let mut node = tree.load_node(tree.root_position())?;
        while node.flag.is_interior() {
            let place = match lower {
                None => 0,
                Some(lower) => upper_bound(node.valid_keys(), lower),
            };
            let child = node.indices[place];
            if child < 0 {
                return Err(Error::corruption("descent reached a nil child pointer"));
            }
            node = tree.load_node(child as u64)?;
        }
        let start_position = node.position;
        let mut walker = Walker {
            tree,
            lower: lower.map(|k| k.to_vec()),
            include_lower,
            upper: upper.map(|k| k.to_vec()),
            include_upper,
            start_position,
            node,
            node_index: 0,
            valid: false,
        };
        walker.first()?;
        Ok(walker)
    }

    /// Whether the walker points at a pair.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Reset to the first pair satisfying the lower bound, if any.
    pub fn first(&mut self) -> Result<()> {
        self.node = self.tree.load_node(self.start_position)?;
        loop {
            let validkeys = self.node.validkeys.max(0) as usize;
            self.valid = false;
            match self.lower.as_deref() {
                None => {
                    if validkeys > 0 {
                        self.node_index = 0;
                        self.valid = true;
                    }
                }
                Some(lower) => {
                    if self.include_lower {
                        if let Some(index) = self
                            .node
                            .valid_keys()
                            .iter()
                            .position(|k| k.as_slice() == lower)
                        {
                            self.node_index = index;
                            self.valid = true;
                        }
                    }
                    if !self.valid {
                        let place = upper_bound(self.node.valid_keys(), lower);
                        if place < validkeys {
                            self.node_index = place;
                            self.valid = true;
                        } else {
                            // everything here is below the bound; restart
                            // from the next leaf
                            let next = self.node.next_leaf();
                            if next != NIL_SEEK {
                                self.start_position = next as u64;
                                self.node = self.tree.load_node(self.start_position)?;
                                continue;
                            }
                        }
                    }
                }
            }
            break;
        }
        if self.valid {
            self.check_upper();
        }
        Ok(())
    }

    /// Advance one slot, spanning leaves through the forward pointer.
    pub fn next(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let mut next_index = self.node_index + 1;
        if next_index >= self.node.validkeys.max(0) as usize {
            let next = self.node.next_leaf();
            if next == NIL_SEEK {
                self.valid = false;
                return Ok(());
            }
            self.node = self.tree.load_node(next as u64)?;
            next_index = 0;
        }
        if self.node.validkeys.max(0) as usize <= next_index {
            self.valid = false;
            return Ok(());
        }
        self.node_index = next_index;
        self.valid = true;
        self.check_upper();
        Ok(())
    }

    fn check_upper(&mut self) {
        if let Some(upper) = self.upper.as_deref() {
            let key = self.node.keys[self.node_index].as_slice();
            self.valid = key < upper || (self.include_upper && key == upper);
        }
    }

    pub fn current_key(&self) -> Option<&[u8]> {
        if self.valid {
            Some(self.node.keys[self.node_index].as_slice())
        } else {
            None
        }
    }

    pub fn current_value(&self) -> Option<i64> {
        if self.valid {
            Some(self.node.indices[self.node_index])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::ops::Bound;

    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    use super::*;

    fn tree_with(keys: &[&[u8]]) -> BplusTree {
        let file = tempfile::tempfile().unwrap();
        let mut tree = BplusTree::create(file, 0, 4, 8).unwrap();
        for (i, k) in keys.iter().enumerate() {
            tree.put(k, i as i64).unwrap();
        }
        tree
    }

    fn collect(walker: &mut Walker<'_>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while walker.valid() {
            out.push(walker.current_key().unwrap().to_vec());
            walker.next().unwrap();
        }
        out
    }

    #[test]
    fn unbounded_walk_is_ascending_and_complete() {
        let mut tree = tree_with(&[b"d", b"a", b"c", b"b", b"e"]);
        let mut walker = tree.walker(None, false, None, false).unwrap();
        assert_eq!(collect(&mut walker), vec![
            b"a".to_vec(),
            b"b".to_vec(),
            b"c".to_vec(),
            b"d".to_vec(),
            b"e".to_vec(),
        ]);
        // first() rewinds
        walker.first().unwrap();
        assert_eq!(walker.current_key().unwrap(), b"a");
    }

    #[test]
    fn empty_tree_walks_nothing() {
        let file = tempfile::tempfile().unwrap();
        let mut tree = BplusTree::create(file, 0, 4, 8).unwrap();
        let walker = tree.walker(None, false, None, false).unwrap();
        assert!(!walker.valid());
        assert!(walker.current_key().is_none());
    }

    #[test]
    fn point_ranges_on_existing_key() {
        let mut tree = tree_with(&[b"A", b"B", b"C"]);
        let mut walker = tree.walker(Some(b"A"), true, Some(b"A"), false).unwrap();
        assert_eq!(collect(&mut walker).len(), 0);
        let mut walker = tree.walker(Some(b"A"), true, Some(b"A"), true).unwrap();
        assert_eq!(collect(&mut walker), vec![b"A".to_vec()]);
        let mut walker = tree.walker(Some(b"AA"), true, Some(b"AA"), false).unwrap();
        assert_eq!(collect(&mut walker).len(), 0);
    }

    #[test]
    fn exclusive_lower_skips_the_bound() {
        let mut tree = tree_with(&[b"a", b"b", b"c"]);
        let mut walker = tree.walker(Some(b"a"), false, None, false).unwrap();
        assert_eq!(collect(&mut walker), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[derive(Debug, Clone)]
    struct SmallKey(Vec<u8>);

    impl Arbitrary for SmallKey {
        fn arbitrary(g: &mut Gen) -> Self {
            let len = usize::arbitrary(g) % 3 + 1;
            SmallKey((0..len).map(|_| b'a' + u8::arbitrary(g) % 4).collect())
        }
    }

    #[quickcheck]
    fn bounds_match_reference_model(
        keys: Vec<SmallKey>,
        lower: Option<SmallKey>,
        include_lower: bool,
        upper: Option<SmallKey>,
        include_upper: bool,
    ) {
        let mut model = BTreeMap::new();
        let file = tempfile::tempfile().unwrap();
        let mut tree = BplusTree::create(file, 0, 4, 4).unwrap();
        for (i, SmallKey(k)) in keys.iter().enumerate() {
            tree.put(k, i as i64).unwrap();
            model.insert(k.clone(), i as i64);
        }
        let lower = lower.map(|SmallKey(k)| k);
        let upper = upper.map(|SmallKey(k)| k);
        let lower_bound = match (&lower, include_lower) {
            (None, _) => Bound::Unbounded,
            (Some(k), true) => Bound::Included(k.clone()),
            (Some(k), false) => Bound::Excluded(k.clone()),
        };
        let upper_bound = match (&upper, include_upper) {
            (None, _) => Bound::Unbounded,
            (Some(k), true) => Bound::Included(k.clone()),
            (Some(k), false) => Bound::Excluded(k.clone()),
        };
        // an inverted range is empty for the model, and must be for us too
        let expect: Vec<Vec<u8>> = match (&lower, &upper) {
            (Some(lo), Some(up)) if lo > up || (lo == up && !(include_lower && include_upper)) => {
                Vec::new()
            }
            _ => model
                .range((lower_bound, upper_bound))
                .map(|(k, _)| k.clone())
                .collect(),
        };
        let mut walker = tree
            .walker(lower.as_deref(), include_lower, upper.as_deref(), include_upper)
            .unwrap();
        assert_eq!(collect(&mut walker), expect);
    }
}
