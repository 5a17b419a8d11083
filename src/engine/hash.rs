//! Hash commands
//!
//! Record layout:
//!
//! ```text
//! Meta | key                        -> HashLen | field count u32
//! Hash | len32(key) | key | field   -> value
//! ```

use std::collections::HashSet;

use rocksdb::{Snapshot, WriteBatch};

use crate::command::Reply;
use crate::engine::{parse_float, parse_int, Engine};
use crate::error::{Result, SetdbError};
use crate::keys::{encode_count, meta_key, parse_count, KeyBuffer, KeyTag, ValueTag};

impl Engine {
    /// HSET key field value
    pub fn hset(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.hset_impl(args, true, wb)
    }

    /// HSETNX key field value
    pub fn hsetnx(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.hset_impl(args, false, wb)
    }

    fn hset_impl(&self, args: &[Vec<u8>], overwrite: bool, wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let length = self.hlen_value(&mk, None)?;
        let key = KeyBuffer::with_suffix(KeyTag::Hash, &args[0], &args[1]);

        let existing = if length > 0 {
            self.store().get(key.as_bytes())?
        } else {
            None
        };
        if overwrite || existing.is_none() {
            wb.put(key.as_bytes(), &args[2]);
        }
        if existing.is_none() {
            self.set_hlen(&mk, length + 1, wb);
            return Ok(Reply::Int(1));
        }
        Ok(Reply::Int(0))
    }

    /// HGET key field
    pub fn hget(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let key = KeyBuffer::with_suffix(KeyTag::Hash, &args[0], &args[1]);
        match self.store().get(key.as_bytes())? {
            Some(value) => Ok(Reply::Bulk(value)),
            None => Ok(Reply::Nil),
        }
    }

    /// HEXISTS key field
    pub fn hexists(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let key = KeyBuffer::with_suffix(KeyTag::Hash, &args[0], &args[1]);
        let present = self.store().get(key.as_bytes())?.is_some();
        Ok(Reply::Int(present as i64))
    }

    /// HLEN key
    pub fn hlen(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        Ok(Reply::Int(self.hlen_value(&meta_key(&args[0]), None)? as i64))
    }

    /// HDEL key field [field ...]
    pub fn hdel(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let length = self.hlen_value(&mk, None)?;
        if length == 0 {
            return Ok(Reply::Int(0));
        }

        let mut deleted = 0u32;
        let mut seen: HashSet<&[u8]> = HashSet::new();
        let mut key = KeyBuffer::new(KeyTag::Hash, &args[0], args[1].len());
        for field in &args[1..] {
            if !seen.insert(field.as_slice()) {
                continue;
            }
            key.set_suffix(field);
            if self.store().get_nofill(key.as_bytes())?.is_none() {
                continue;
            }
            wb.delete(key.as_bytes());
            deleted += 1;
        }
        if deleted == length {
            wb.delete(&mk);
        } else if deleted > 0 {
            self.set_hlen(&mk, length - deleted, wb);
        }
        Ok(Reply::Int(deleted as i64))
    }

    /// HMSET key field value [field value ...]
    pub fn hmset(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        if (args.len() - 1) % 2 != 0 {
            return Err(SetdbError::WrongArity("hmset".to_string()));
        }

        let mk = meta_key(&args[0]);
        let length = self.hlen_value(&mk, None)?;

        let mut added = 0u32;
        let mut staged: HashSet<&[u8]> = HashSet::new();
        let mut key = KeyBuffer::new(KeyTag::Hash, &args[0], args[1].len());
        for pair in args[1..].chunks(2) {
            key.set_suffix(&pair[0]);
            let existing = if length > 0 {
                self.store().get(key.as_bytes())?
            } else {
                None
            };
            if existing.is_none() && staged.insert(pair[0].as_slice()) {
                added += 1;
            }
            wb.put(key.as_bytes(), &pair[1]);
        }
        if added > 0 {
            self.set_hlen(&mk, length + added, wb);
        }
        Ok(Reply::Simple("OK"))
    }

    /// HMGET key field [field ...] — streams one bulk (or nil) per field.
    pub fn hmget<'e>(&'e self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'e>> {
        let user_key = args[0].clone();
        let fields: Vec<Vec<u8>> = args[1..].to_vec();
        let count = fields.len() as i64;

        let iter = fields.into_iter().map(move |field| {
            let key = KeyBuffer::with_suffix(KeyTag::Hash, &user_key, &field);
            match self.store().get(key.as_bytes()) {
                Ok(Some(value)) => Reply::Bulk(value),
                Ok(None) => Reply::Nil,
                Err(e) => Reply::Error(e),
            }
        });
        Ok(Reply::stream(count, iter))
    }

    /// HGETALL key
    pub fn hgetall(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.hgetall_impl(&args[0], true, true)
    }

    /// HKEYS key
    pub fn hkeys(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.hgetall_impl(&args[0], true, false)
    }

    /// HVALS key
    pub fn hvals(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        self.hgetall_impl(&args[0], false, true)
    }

    fn hgetall_impl(&self, user_key: &[u8], fields: bool, values: bool) -> Result<Reply<'_>> {
        // snapshot keeps the length consistent with the walk
        let snapshot = self.store().snapshot();
        let length = self.hlen_value(&meta_key(user_key), Some(&snapshot))? as i64;
        if length == 0 {
            return Ok(Reply::empty_array());
        }
        let count = if fields && values { length * 2 } else { length };

        let prefix = KeyBuffer::new(KeyTag::Hash, user_key, 0);
        let suffix_at = prefix.prefix_len();
        let scan = self.store().scan(Some(snapshot), prefix, true);
        let iter = scan.flat_map(move |(k, v)| {
            let mut out = Vec::with_capacity(2);
            if fields {
                out.push(Reply::Bulk(k[suffix_at..].to_vec()));
            }
            if values {
                out.push(Reply::Bulk(v));
            }
            out
        });
        Ok(Reply::stream(count, iter))
    }

    /// HINCRBY key field increment
    pub fn hincrby(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let length = self.hlen_value(&mk, None)?;
        let key = KeyBuffer::with_suffix(KeyTag::Hash, &args[0], &args[1]);
        let existing = self.store().get(key.as_bytes())?;

        let current = match &existing {
            Some(v) => parse_int(v)
                .map_err(|_| SetdbError::Argument("hash value is not an integer".to_string()))?,
            None => 0,
        };
        let increment = parse_int(&args[2])?;
        let result = current.checked_add(increment).ok_or(SetdbError::InvalidInt)?;
        let result = result.to_string().into_bytes();
        wb.put(key.as_bytes(), &result);

        if existing.is_none() {
            self.set_hlen(&mk, length + 1, wb);
        }
        Ok(Reply::Bulk(result))
    }

    /// HINCRBYFLOAT key field increment
    pub fn hincrbyfloat(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        let length = self.hlen_value(&mk, None)?;
        let key = KeyBuffer::with_suffix(KeyTag::Hash, &args[0], &args[1]);
        let existing = self.store().get(key.as_bytes())?;

        let current = match &existing {
            Some(v) => parse_float(v)
                .map_err(|_| SetdbError::Argument("hash value is not a valid float".to_string()))?,
            None => 0.0,
        };
        let increment = parse_float(&args[2])?;
        let result = format!("{}", current + increment).into_bytes();
        wb.put(key.as_bytes(), &result);

        if existing.is_none() {
            self.set_hlen(&mk, length + 1, wb);
        }
        Ok(Reply::Bulk(result))
    }

    pub(crate) fn del_hash(&self, key: &[u8], wb: &mut WriteBatch) {
        let prefix = KeyBuffer::new(KeyTag::Hash, key, 0);
        for (k, _) in self.store().scan(None, prefix, false) {
            wb.delete(&k);
        }
    }

    fn hlen_value(&self, mk: &[u8], snapshot: Option<&Snapshot<'_>>) -> Result<u32> {
        let meta = match snapshot {
            Some(snap) => self.store().get_at(snap, mk)?,
            None => self.store().get(mk)?,
        };
        match meta {
            None => Ok(0),
            Some(v) => parse_count(&v, ValueTag::HashLen),
        }
    }

    fn set_hlen(&self, mk: &[u8], length: u32, wb: &mut WriteBatch) {
        wb.put(mk, encode_count(ValueTag::HashLen, length));
    }
}
