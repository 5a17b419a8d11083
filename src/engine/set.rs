//! Set commands
//!
//! Record layout:
//!
//! ```text
//! Meta | key                        -> SetCard | member count u32
//! Set  | len32(key) | key | member  -> (empty)
//! ```
//!
//! Members sort lexicographically by byte, which is the iteration order
//! SMEMBERS and the union/intersect/difference family expose.

use std::collections::HashSet;

use rocksdb::{Snapshot, WriteBatch};

use crate::command::Reply;
use crate::engine::merge::{MergeIter, MergeOp};
use crate::engine::Engine;
use crate::error::Result;
use crate::keys::{encode_count, meta_key, parse_count, KeyBuffer, KeyTag, ValueTag};

impl Engine {
    /// SADD key member [member ...]
    pub fn sadd(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let members: Vec<&[u8]> = args[1..].iter().map(|m| m.as_slice()).collect();
        let added = self.sadd_impl(&args[0], &members, wb)?;
        Ok(Reply::Int(added as i64))
    }

    pub(crate) fn sadd_impl(
        &self,
        user_key: &[u8],
        members: &[&[u8]],
        wb: &mut WriteBatch,
    ) -> Result<u32> {
        let mk = meta_key(user_key);
        let card = self.scard_value(&mk, None)?;

        let mut new_members = 0u32;
        let mut seen: HashSet<&[u8]> = HashSet::new();
        let mut key = KeyBuffer::new(KeyTag::Set, user_key, members.first().map_or(0, |m| m.len()));
        for &member in members {
            if !seen.insert(member) {
                continue;
            }
            key.set_suffix(member);
            if card > 0 && self.store().get(key.as_bytes())?.is_some() {
                continue;
            }
            wb.put(key.as_bytes(), b"");
            new_members += 1;
        }
        if new_members > 0 {
            self.set_card(&mk, card + new_members, wb);
        }
        Ok(new_members)
    }

    /// SREM key member [member ...]
    pub fn srem(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let members: Vec<&[u8]> = args[1..].iter().map(|m| m.as_slice()).collect();
        let removed = self.srem_impl(&args[0], &members, wb)?;
        Ok(Reply::Int(removed as i64))
    }

    pub(crate) fn srem_impl(
        &self,
        user_key: &[u8],
        members: &[&[u8]],
        wb: &mut WriteBatch,
    ) -> Result<u32> {
        let mk = meta_key(user_key);
        let card = self.scard_value(&mk, None)?;
        if card == 0 {
            return Ok(0);
        }

        let mut deleted = 0u32;
        let mut seen: HashSet<&[u8]> = HashSet::new();
        let mut key = KeyBuffer::new(KeyTag::Set, user_key, members.first().map_or(0, |m| m.len()));
        for &member in members {
            if !seen.insert(member) {
                continue;
            }
            key.set_suffix(member);
            if self.store().get_nofill(key.as_bytes())?.is_none() {
                continue;
            }
            wb.delete(key.as_bytes());
            deleted += 1;
        }
        if deleted == card {
            wb.delete(&mk);
        } else if deleted > 0 {
            self.set_card(&mk, card - deleted, wb);
        }
        Ok(deleted)
    }

    /// SISMEMBER key member
    pub fn sismember(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let key = KeyBuffer::with_suffix(KeyTag::Set, &args[0], &args[1]);
        let present = self.store().get(key.as_bytes())?.is_some();
        Ok(Reply::Int(present as i64))
    }

    /// SCARD key
    pub fn scard(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        Ok(Reply::Int(self.scard_value(&meta_key(&args[0]), None)? as i64))
    }

    /// SMEMBERS key — streams members in ascending byte order.
    pub fn smembers(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        // snapshot keeps the cardinality consistent with the walk
        let snapshot = self.store().snapshot();
        let card = self.scard_value(&meta_key(&args[0]), Some(&snapshot))?;
        if card == 0 {
            return Ok(Reply::empty_array());
        }

        let prefix = KeyBuffer::new(KeyTag::Set, &args[0], 0);
        let suffix_at = prefix.prefix_len();
        let scan = self.store().scan(Some(snapshot), prefix, true);
        let iter = scan.map(move |(k, _)| Reply::Bulk(k[suffix_at..].to_vec()));
        Ok(Reply::stream(card as i64, iter))
    }

    /// SPOP key — removes a pseudo-random member.
    pub fn spop(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let card = self.scard_value(&mk, None)?;
        if card == 0 {
            return Ok(Reply::Nil);
        }

        // seek to a random one-byte suffix; whatever the seek lands on (or
        // the greatest member, when it lands past the set) gets popped
        let mut probe = KeyBuffer::new(KeyTag::Set, &args[0], 1);
        probe.suffix_mut(1)[0] = rand::random::<u8>();
        let start = probe.as_bytes().to_vec();

        let prefix = KeyBuffer::new(KeyTag::Set, &args[0], 0);
        let suffix_at = prefix.prefix_len();
        let landed = self
            .store()
            .scan_from(None, prefix.clone(), Some(&start), false, true)
            .next();
        let member = match landed {
            Some((k, _)) => k[suffix_at..].to_vec(),
            None => match self.store().scan_rev(None, prefix, true).next() {
                Some((k, _)) => k[suffix_at..].to_vec(),
                None => return Ok(Reply::Nil),
            },
        };

        let key = KeyBuffer::with_suffix(KeyTag::Set, &args[0], &member);
        wb.delete(key.as_bytes());
        if card == 1 {
            wb.delete(&mk);
        } else {
            self.set_card(&mk, card - 1, wb);
        }
        Ok(Reply::Bulk(member))
    }

    /// SMOVE source destination member
    pub fn smove(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let src_key = KeyBuffer::with_suffix(KeyTag::Set, &args[0], &args[2]);
        if self.store().get(src_key.as_bytes())?.is_none() {
            return Ok(Reply::Int(0));
        }
        self.srem_impl(&args[0], &[&args[2]], wb)?;
        self.sadd_impl(&args[1], &[&args[2]], wb)?;
        Ok(Reply::Int(1))
    }

    // -------------------------------------------------------------------------
    // Union / intersection / difference
    // -------------------------------------------------------------------------

    /// SUNION key [key ...]
    pub fn sunion(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_set_read(args, MergeOp::Union)
    }

    /// SINTER key [key ...]
    pub fn sinter(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_set_read(args, MergeOp::Inter)
    }

    /// SDIFF key [key ...]
    pub fn sdiff(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_set_read(args, MergeOp::Diff)
    }

    /// SUNIONSTORE destination key [key ...]
    pub fn sunionstore(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_set_store(args, MergeOp::Union, wb)
    }

    /// SINTERSTORE destination key [key ...]
    pub fn sinterstore(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_set_store(args, MergeOp::Inter, wb)
    }

    /// SDIFFSTORE destination key [key ...]
    pub fn sdiffstore(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.combine_set_store(args, MergeOp::Diff, wb)
    }

    fn combine_set_read(&self, keys: &[Vec<u8>], op: MergeOp) -> Result<Reply<'_>> {
        let mut iter = MergeIter::new(self.store(), keys, op.stops_early())?;
        let mut out = Vec::new();
        while let Some(m) = iter.next_member()? {
            if op.accepts(&m.exists) {
                out.push(Reply::Bulk(m.member));
            }
        }
        Ok(Reply::Array(out))
    }

    fn combine_set_store(
        &self,
        args: &[Vec<u8>],
        op: MergeOp,
        wb: &mut WriteBatch,
    ) -> Result<Reply<'_>> {
        let destination = &args[0];
        self.delete_key(destination, wb)?;

        let mut count = 0u32;
        let mut key = KeyBuffer::new(KeyTag::Set, destination, 0);
        let mut iter = MergeIter::new(self.store(), &args[1..], op.stops_early())?;
        while let Some(m) = iter.next_member()? {
            if !op.accepts(&m.exists) {
                continue;
            }
            key.set_suffix(&m.member);
            wb.put(key.as_bytes(), b"");
            count += 1;
        }
        if count > 0 {
            self.set_card(&meta_key(destination), count, wb);
        }
        Ok(Reply::Int(count as i64))
    }

    pub(crate) fn del_set(&self, key: &[u8], wb: &mut WriteBatch) {
        let prefix = KeyBuffer::new(KeyTag::Set, key, 0);
        for (k, _) in self.store().scan(None, prefix, false) {
            wb.delete(&k);
        }
    }

    pub(crate) fn scard_value(&self, mk: &[u8], snapshot: Option<&Snapshot<'_>>) -> Result<u32> {
        let meta = match snapshot {
            Some(snap) => self.store().get_at(snap, mk)?,
            None => self.store().get(mk)?,
        };
        match meta {
            None => Ok(0),
            Some(v) => parse_count(&v, ValueTag::SetCard),
        }
    }

    fn set_card(&self, mk: &[u8], card: u32, wb: &mut WriteBatch) {
        wb.put(mk, encode_count(ValueTag::SetCard, card));
    }
}
