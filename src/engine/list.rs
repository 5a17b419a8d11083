//! List commands
//!
//! Record layout:
//!
//! ```text
//! Meta | key                        -> ListLen | count u32 | flags u8
//!                                       | left seq i64 | right seq i64
//! List | len32(key) | key | seq64   -> value
//! ```
//!
//! Every element carries a 64-bit sequence number; the stored suffix is
//! `seq - i64::MIN` as an unsigned big-endian, so negative and positive
//! sequences sort in numeric order. `left`/`right` are the sequence
//! numbers the next LPUSH/RPUSH will claim; the empty sentinel
//! `left=0, right=1` puts the first pushed element at seq 0 or 1.

use rocksdb::{Snapshot, WriteBatch};

use crate::command::Reply;
use crate::engine::{parse_range, Engine};
use crate::error::{Result, SetdbError};
use crate::keys::{meta_key, KeyBuffer, KeyTag, ValueTag, KEY_PREFIX_SIZE};

/// Flags bit 0: sequences may be non-contiguous. Reserved in the on-disk
/// format for insert-in-the-middle mutations; never set today.
#[allow(dead_code)]
pub(crate) const LOOSE_SEQ: u8 = 1;

const LIST_META_SIZE: usize = 22;

/// Decoded list metadata.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListMeta {
    pub flags: u8,
    pub len: u32,
    pub left: i64,
    pub right: i64,
}

impl Default for ListMeta {
    fn default() -> Self {
        ListMeta {
            flags: 0,
            len: 0,
            left: 0,
            right: 1,
        }
    }
}

pub(crate) fn encode_seq(seq: i64) -> [u8; 8] {
    (seq.wrapping_sub(i64::MIN) as u64).to_be_bytes()
}

pub(crate) fn decode_seq(suffix: &[u8]) -> Result<i64> {
    if suffix.len() != 8 {
        return Err(SetdbError::InvalidData);
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(suffix);
    Ok((u64::from_be_bytes(raw) as i64).wrapping_add(i64::MIN))
}

impl Engine {
    /// LPUSH key value [value ...]
    pub fn lpush(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let len = self.push_impl(&args[0], &args[1..], true, true, wb)?;
        Ok(Reply::Int(len as i64))
    }

    /// LPUSHX key value — no-op on a nonexistent list.
    pub fn lpushx(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let len = self.push_impl(&args[0], &args[1..], true, false, wb)?;
        Ok(Reply::Int(len as i64))
    }

    /// RPUSH key value [value ...]
    pub fn rpush(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let len = self.push_impl(&args[0], &args[1..], false, true, wb)?;
        Ok(Reply::Int(len as i64))
    }

    /// RPUSHX key value — no-op on a nonexistent list.
    pub fn rpushx(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let len = self.push_impl(&args[0], &args[1..], false, false, wb)?;
        Ok(Reply::Int(len as i64))
    }

    pub(crate) fn push_impl(
        &self,
        key: &[u8],
        values: &[Vec<u8>],
        left: bool,
        create: bool,
        wb: &mut WriteBatch,
    ) -> Result<u32> {
        let mk = meta_key(key);
        let mut meta = self.llen_value(&mk, None)?;
        if !create && meta.len == 0 {
            return Ok(0);
        }

        let mut element = KeyBuffer::new(KeyTag::List, key, 8);
        for value in values {
            meta.len += 1;
            let seq = if left {
                let s = meta.left;
                meta.left = meta.left.wrapping_sub(1);
                s
            } else {
                let s = meta.right;
                meta.right = meta.right.wrapping_add(1);
                s
            };
            element.suffix_mut(8).copy_from_slice(&encode_seq(seq));
            wb.put(element.as_bytes(), value);
        }
        self.set_llen(&mk, &meta, wb);
        Ok(meta.len)
    }

    /// LPOP key
    pub fn lpop(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        match self.pop_impl(&args[0], true, wb)? {
            Some(value) => Ok(Reply::Bulk(value)),
            None => Ok(Reply::Nil),
        }
    }

    /// RPOP key
    pub fn rpop(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        match self.pop_impl(&args[0], false, wb)? {
            Some(value) => Ok(Reply::Bulk(value)),
            None => Ok(Reply::Nil),
        }
    }

    fn pop_impl(&self, key: &[u8], left: bool, wb: &mut WriteBatch) -> Result<Option<Vec<u8>>> {
        let mk = meta_key(key);
        let mut meta = self.llen_value(&mk, None)?;
        if meta.len == 0 {
            return Ok(None);
        }

        let prefix = KeyBuffer::new(KeyTag::List, key, 0);
        let next = if left {
            self.store().scan(None, prefix, false).next()
        } else {
            self.store().scan_rev(None, prefix, false).next()
        };
        let Some((element_key, value)) = next else {
            return Ok(None);
        };

        wb.delete(&element_key);
        meta.len -= 1;
        if meta.len == 0 {
            wb.delete(&mk);
        } else {
            // the freed sequence number becomes the new frontier
            let seq = decode_seq(&element_key[KEY_PREFIX_SIZE + key.len()..])?;
            if left {
                meta.left = seq;
            } else {
                meta.right = seq;
            }
            self.set_llen(&mk, &meta, wb);
        }
        Ok(Some(value))
    }

    /// RPOPLPUSH source destination
    pub fn rpoplpush(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        if args[0] == args[1] {
            return self.rotate_impl(&args[0], wb);
        }
        let Some(value) = self.pop_impl(&args[0], false, wb)? else {
            return Ok(Reply::Nil);
        };
        self.push_impl(&args[1], std::slice::from_ref(&value), true, true, wb)?;
        Ok(Reply::Bulk(value))
    }

    /// RPOPLPUSH with source == destination rotates the list in place;
    /// pop and push must share one metadata update.
    fn rotate_impl(&self, key: &[u8], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(key);
        let mut meta = self.llen_value(&mk, None)?;
        if meta.len == 0 {
            return Ok(Reply::Nil);
        }

        let prefix = KeyBuffer::new(KeyTag::List, key, 0);
        let Some((element_key, value)) = self.store().scan_rev(None, prefix, false).next() else {
            return Ok(Reply::Nil);
        };

        wb.delete(&element_key);
        if meta.len > 1 {
            meta.right = decode_seq(&element_key[KEY_PREFIX_SIZE + key.len()..])?;
        }
        let mut element = KeyBuffer::new(KeyTag::List, key, 8);
        element
            .suffix_mut(8)
            .copy_from_slice(&encode_seq(meta.left));
        meta.left = meta.left.wrapping_sub(1);
        wb.put(element.as_bytes(), &value);
        self.set_llen(&mk, &meta, wb);
        Ok(Reply::Bulk(value))
    }

    /// LRANGE key start stop
    pub fn lrange(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let snapshot = self.store().snapshot();
        let meta = self.llen_value(&meta_key(&args[0]), Some(&snapshot))?;
        if meta.len == 0 {
            return Ok(Reply::empty_array());
        }

        let (start, end) = parse_range(&args[1], &args[2], meta.len as i64)?;
        if start > end {
            return Ok(Reply::empty_array());
        }
        let count = end + 1 - start;

        // the leftmost element sits at left+1; seek straight to the slot
        let mut from = KeyBuffer::new(KeyTag::List, &args[0], 8);
        from.suffix_mut(8)
            .copy_from_slice(&encode_seq(meta.left.wrapping_add(1 + start)));
        let start_key = from.as_bytes().to_vec();

        let prefix = KeyBuffer::new(KeyTag::List, &args[0], 0);
        let scan = self
            .store()
            .scan_from(Some(snapshot), prefix, Some(&start_key), false, true);
        let iter = scan.take(count as usize).map(|(_, v)| Reply::Bulk(v));
        Ok(Reply::stream(count, iter))
    }

    /// LLEN key
    pub fn llen(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let meta = self.llen_value(&meta_key(&args[0]), None)?;
        Ok(Reply::Int(meta.len as i64))
    }

    pub(crate) fn del_list(&self, key: &[u8], wb: &mut WriteBatch) {
        let prefix = KeyBuffer::new(KeyTag::List, key, 0);
        for (k, _) in self.store().scan(None, prefix, false) {
            wb.delete(&k);
        }
    }

    pub(crate) fn llen_value(
        &self,
        mk: &[u8],
        snapshot: Option<&Snapshot<'_>>,
    ) -> Result<ListMeta> {
        let value = match snapshot {
            Some(snap) => self.store().get_at(snap, mk)?,
            None => self.store().get(mk)?,
        };
        let Some(v) = value else {
            return Ok(ListMeta::default());
        };
        if v.first() != Some(&(ValueTag::ListLen as u8)) {
            return Err(SetdbError::WrongType);
        }
        if v.len() < LIST_META_SIZE {
            return Err(SetdbError::InvalidData);
        }
        Ok(ListMeta {
            len: u32::from_be_bytes([v[1], v[2], v[3], v[4]]),
            flags: v[5],
            left: i64::from_be_bytes([v[6], v[7], v[8], v[9], v[10], v[11], v[12], v[13]]),
            right: i64::from_be_bytes([v[14], v[15], v[16], v[17], v[18], v[19], v[20], v[21]]),
        })
    }

    pub(crate) fn set_llen(&self, mk: &[u8], meta: &ListMeta, wb: &mut WriteBatch) {
        let mut v = [0u8; LIST_META_SIZE];
        v[0] = ValueTag::ListLen as u8;
        v[1..5].copy_from_slice(&meta.len.to_be_bytes());
        v[5] = meta.flags;
        v[6..14].copy_from_slice(&meta.left.to_be_bytes());
        v[14..22].copy_from_slice(&meta.right.to_be_bytes());
        wb.put(mk, v);
    }
}
