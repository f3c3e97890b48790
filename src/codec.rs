//! Self-describing binary records.
//!
//! Every value written to a tree file is a tagged record: a one-byte type tag
//! followed by a fixed-width integer, a length-prefixed byte string, or a
//! counted sequence of further records. Node records serialize the tuple
//! `(flag, validkeys, indices, keys)` as one sequence and are padded with
//! filler up to the fixed record length so that a node can be rewritten in
//! place. Value records in the string overlay are a single byte-string record
//! of variable length.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{Error, Result};

pub(crate) const TAG_INT: u8 = b'i';
pub(crate) const TAG_BYTES: u8 = b's';
pub(crate) const TAG_SEQ: u8 = b'l';
pub(crate) const TAG_MAP: u8 = b'd';

/// Encoded length of a tagged integer.
pub(crate) const INT_LEN: usize = 1 + 8;
/// Encoded length of a sequence header.
pub(crate) const SEQ_OVERHEAD: usize = 1 + 4;
/// Encoded overhead of a byte string on top of its payload.
pub(crate) const BYTES_OVERHEAD: usize = 1 + 4;

/// Encoded length of a tree header: one sequence of five integers.
pub(crate) const HEADER_LEN: usize = SEQ_OVERHEAD + 5 * INT_LEN;

pub(crate) const RECORD_FILL: u8 = b'x';

/// Byte length of a node record for the given branching factor and maximum
/// key length. All nodes of one tree share this length; it assumes every key
/// slot is filled to `keylen`.
pub(crate) fn node_record_len(nodesize: usize, keylen: usize) -> usize {
    SEQ_OVERHEAD + 2 * INT_LEN + (nodesize + 1) * INT_LEN + nodesize * (BYTES_OVERHEAD + keylen)
}

fn expect_tag<R: Read>(r: &mut R, want: u8) -> Result<()> {
    let tag = r.read_u8()?;
    if tag != want {
        return Err(Error::corruption(format!(
            "record tag mismatch: expected {:#04x}, found {:#04x}",
            want, tag
        )));
    }
    Ok(())
}

pub(crate) fn put_int<W: Write>(w: &mut W, v: i64) -> Result<()> {
    w.write_u8(TAG_INT)?;
    w.write_i64::<LittleEndian>(v)?;
    Ok(())
}

pub(crate) fn get_int<R: Read>(r: &mut R) -> Result<i64> {
    expect_tag(r, TAG_INT)?;
    Ok(r.read_i64::<LittleEndian>()?)
}

/// The integer serialization with the leading tag stripped. The bucket
/// overlay renders hash values to fixed-width tree keys this way.
pub(crate) fn int_key(v: i64) -> [u8; 8] {
    v.to_le_bytes()
}

pub(crate) fn put_bytes<W: Write>(w: &mut W, data: &[u8]) -> Result<()> {
    w.write_u8(TAG_BYTES)?;
    w.write_u32::<LittleEndian>(data.len() as u32)?;
    w.write_all(data)?;
    Ok(())
}

pub(crate) fn get_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    expect_tag(r, TAG_BYTES)?;
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut data = vec![0; len];
    r.read_exact(&mut data)?;
    Ok(data)
}

pub(crate) fn put_seq_header<W: Write>(w: &mut W, count: usize) -> Result<()> {
    w.write_u8(TAG_SEQ)?;
    w.write_u32::<LittleEndian>(count as u32)?;
    Ok(())
}

pub(crate) fn get_seq_header<R: Read>(r: &mut R) -> Result<usize> {
    expect_tag(r, TAG_SEQ)?;
    Ok(r.read_u32::<LittleEndian>()? as usize)
}

/// Serialize a small dictionary of byte strings. The bucket overlay stores
/// one of these per hash bucket.
pub(crate) fn put_map<W: Write>(w: &mut W, map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
    w.write_u8(TAG_MAP)?;
    w.write_u32::<LittleEndian>(map.len() as u32)?;
    for (k, v) in map {
        put_bytes(w, k)?;
        put_bytes(w, v)?;
    }
    Ok(())
}

pub(crate) fn get_map<R: Read>(r: &mut R) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    expect_tag(r, TAG_MAP)?;
    let count = r.read_u32::<LittleEndian>()? as usize;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let k = get_bytes(r)?;
        let v = get_bytes(r)?;
        map.insert(k, v);
    }
    Ok(map)
}
