//! Offline compaction by whole-file recopy.
//!
//! Streaming a tree's pairs into an empty destination in ascending order
//! would leave every leaf half full: each split moves the upper half of a
//! just-filled leaf into a new one that never receives another key. Feeding
//! the destination in a lead-and-defer pattern instead tops the split leaf
//! back up before moving on, so leaves fill to capacity and the copy ends up
//! noticeably smaller than a churned original. For string overlays the copy
//! also sheds heap garbage, because only live values are re-appended.

use log::debug;

use crate::cache::DEFAULT_CAPACITY;
use crate::errors::Result;
use crate::stringtree::StringTree;
use crate::tree::BplusTree;

/// Copy every pair of `src` into `dst`, packing leaves tightly. The
/// destination should be freshly created with the same parameters; its cache
/// is enabled for the duration and disabled (flushing it) on the way out.
pub fn recopy_tree(src: &mut BplusTree, dst: &mut BplusTree) -> Result<()> {
    debug!("recopying {} entries", src.len());
    dst.enable_cache(DEFAULT_CAPACITY)?;
    let copied = copy_pairs(src, dst);
    let disabled = dst.disable_cache();
    copied?;
    disabled?;
    Ok(())
}

fn copy_pairs(src: &mut BplusTree, dst: &mut BplusTree) -> Result<()> {
    let nodesize = dst.nodesize();
    let lead = nodesize / 2 + 1;
    let hold = lead - 2;
    let mut deferred: Vec<(Vec<u8>, i64)> = Vec::new();
    let mut walker = src.walker(None, false, None, false)?;
    while walker.valid() {
        // insert enough to fill the current leaf past its split point
        for _ in 0..lead {
            let Some(key) = walker.current_key().map(|k| k.to_vec()) else {
                break;
            };
            let Some(value) = walker.current_value() else {
                break;
            };
            dst.put(&key, value)?;
            walker.next()?;
        }
        // replay the pairs held back on the previous round
        for (key, value) in deferred.drain(..) {
            dst.put(&key, value)?;
        }
        // hold back the tail that a split would strand in the new leaf
        for _ in 0..hold {
            if !walker.valid() {
                break;
            }
            let Some(key) = walker.current_key().map(|k| k.to_vec()) else {
                break;
            };
            let Some(value) = walker.current_value() else {
                break;
            };
            deferred.push((key, value));
            walker.next()?;
        }
    }
    for (key, value) in deferred {
        dst.put(&key, value)?;
    }
    Ok(())
}

/// [recopy_tree] for string overlays. Only live values are re-appended, so
/// the destination heap carries no garbage.
pub fn recopy_strings(src: &mut StringTree, dst: &mut StringTree) -> Result<()> {
    debug!("recopying {} string entries", src.len());
    dst.enable_cache(DEFAULT_CAPACITY)?;
    let copied = copy_string_pairs(src, dst);
    let disabled = dst.disable_cache();
    copied?;
    disabled?;
    Ok(())
}

fn copy_string_pairs(src: &mut StringTree, dst: &mut StringTree) -> Result<()> {
    let nodesize = dst.nodesize();
    let lead = nodesize / 2 + 1;
    let hold = lead - 2;
    let mut deferred: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut walker = src.walker(None, false, None, false)?;
    while walker.valid() {
        for _ in 0..lead {
            let Some(key) = walker.current_key().map(|k| k.to_vec()) else {
                break;
            };
            let Some(value) = walker.current_value()? else {
                break;
            };
            dst.put(&key, &value)?;
            walker.next()?;
        }
        for (key, value) in deferred.drain(..) {
            dst.put(&key, &value)?;
        }
        for _ in 0..hold {
            if !walker.valid() {
                break;
            }
            let Some(key) = walker.current_key().map(|k| k.to_vec()) else {
                break;
            };
            let Some(value) = walker.current_value()? else {
                break;
            };
            deferred.push((key, value));
            walker.next()?;
        }
    }
    for (key, value) in deferred {
        dst.put(&key, &value)?;
    }
    Ok(())
}
