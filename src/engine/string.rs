//! String commands
//!
//! Record layout:
//!
//! ```text
//! Meta   | key                 -> StringLen | value length u32
//! String | len32(key) | key    -> value
//! ```

use rocksdb::WriteBatch;

use crate::command::Reply;
use crate::engine::Engine;
use crate::error::{Result, SetdbError};
use crate::keys::{encode_count, meta_key, KeyBuffer, KeyTag, ValueTag};

fn string_key(key: &[u8]) -> Vec<u8> {
    KeyBuffer::new(KeyTag::String, key, 0).as_bytes().to_vec()
}

impl Engine {
    /// SET key value
    pub fn set(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        // a non-string aggregate under this key is deleted first
        if let Some(meta) = self.store().get(&mk)? {
            if meta.first() != Some(&(ValueTag::StringLen as u8)) {
                self.delete_key(&args[0], wb)?;
            }
        }

        wb.put(&mk, encode_count(ValueTag::StringLen, args[1].len() as u32));
        wb.put(string_key(&args[0]), &args[1]);
        Ok(Reply::Simple("OK"))
    }

    /// GET key
    pub fn get(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        match self.store().get(&string_key(&args[0]))? {
            Some(value) => Ok(Reply::Bulk(value)),
            None => Ok(Reply::Nil),
        }
    }

    /// APPEND key value — returns the new length.
    pub fn append(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mk = meta_key(&args[0]);
        if let Some(meta) = self.store().get(&mk)? {
            if meta.first() != Some(&(ValueTag::StringLen as u8)) {
                return Err(SetdbError::WrongType);
            }
        }

        let sk = string_key(&args[0]);
        let mut value = self.store().get(&sk)?.unwrap_or_default();
        value.extend_from_slice(&args[1]);

        wb.put(&mk, encode_count(ValueTag::StringLen, value.len() as u32));
        let len = value.len() as i64;
        wb.put(&sk, value);
        Ok(Reply::Int(len))
    }

    pub(crate) fn del_string(&self, key: &[u8], wb: &mut WriteBatch) {
        wb.delete(string_key(key));
    }
}
