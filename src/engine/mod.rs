//! Engine Module
//!
//! `Engine` ties the store, the key codec, and the lock ring together and
//! hosts every command handler. The aggregate-specific handlers live in
//! the submodules; this file holds the struct, the generic key commands
//! (DEL, EXISTS, TYPE, KEYS) and the shared argument parsing helpers.
//!
//! Handlers stage all writes into the batch passed by dispatch and never
//! write to the store directly, so a failing command leaves no trace.

mod dump;
mod hash;
mod list;
pub mod merge;
mod set;
mod string;
mod zset;

use std::time::{SystemTime, UNIX_EPOCH};

use rocksdb::WriteBatch;

use crate::command::Reply;
use crate::config::Config;
use crate::error::{Result, SetdbError};
use crate::keys::{glob_match, meta_key, ValueTag};
use crate::lockring::LockRing;
use crate::storage::Store;

/// The command engine. One per process, shared across worker threads.
pub struct Engine {
    store: Store,
    locks: LockRing,
}

impl Engine {
    /// Open the store and build the lock ring.
    pub fn open(config: Config) -> Result<Engine> {
        let store = Store::open(&config)?;
        let locks = LockRing::new(config.lock_ring_size);
        Ok(Engine { store, locks })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn locks(&self) -> &LockRing {
        &self.locks
    }

    // -------------------------------------------------------------------------
    // Connection commands
    // -------------------------------------------------------------------------

    pub fn ping(&self, _args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        Ok(Reply::Simple("PONG"))
    }

    pub fn echo(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        Ok(Reply::Bulk(args[0].clone()))
    }

    pub fn time(&self, _args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Reply::Array(vec![
            Reply::Bulk(now.as_secs().to_string().into_bytes()),
            Reply::Bulk(now.subsec_micros().to_string().into_bytes()),
        ]))
    }

    // -------------------------------------------------------------------------
    // Generic key commands
    // -------------------------------------------------------------------------

    /// EXISTS key — the metadata record defines existence.
    pub fn exists(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let present = self.store.get(&meta_key(&args[0]))?.is_some();
        Ok(Reply::Int(present as i64))
    }

    /// TYPE key
    pub fn key_type(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        match self.store.get(&meta_key(&args[0]))? {
            None => Ok(Reply::Simple("none")),
            Some(meta) => {
                let tag = meta
                    .first()
                    .and_then(|t| ValueTag::from_u8(*t))
                    .ok_or(SetdbError::InvalidData)?;
                Ok(Reply::Simple(tag.type_name()))
            }
        }
    }

    /// KEYS pattern — walks the metadata key-space under a snapshot.
    pub fn keys(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let snapshot = self.store.snapshot();
        let mut matches = Vec::new();
        for (user_key, _) in self.store.scan_meta(Some(snapshot)) {
            if glob_match(&args[0], &user_key) {
                matches.push(Reply::Bulk(user_key));
            }
        }
        Ok(Reply::Array(matches))
    }

    /// DEL key [key ...] — counts the keys that existed.
    pub fn del(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let mut deleted = 0i64;
        for key in args {
            if self.delete_key(key, wb)? {
                deleted += 1;
            }
        }
        Ok(Reply::Int(deleted))
    }

    /// Delete a key's aggregate, whatever its type: every element record
    /// and the metadata record. Returns whether the key existed.
    pub(crate) fn delete_key(&self, key: &[u8], wb: &mut WriteBatch) -> Result<bool> {
        let mk = meta_key(key);
        let Some(meta) = self.store.get(&mk)? else {
            return Ok(false);
        };
        let tag = meta
            .first()
            .and_then(|t| ValueTag::from_u8(*t))
            .ok_or(SetdbError::InvalidData)?;
        match tag {
            ValueTag::StringLen => self.del_string(key, wb),
            ValueTag::HashLen => self.del_hash(key, wb),
            ValueTag::ListLen => self.del_list(key, wb),
            ValueTag::SetCard => self.del_set(key, wb),
            ValueTag::ZCard => self.del_zset(key, wb)?,
        }
        wb.delete(&mk);
        Ok(true)
    }
}

// =============================================================================
// Argument parsing helpers
// =============================================================================

pub(crate) fn parse_int(b: &[u8]) -> Result<i64> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(SetdbError::InvalidInt)
}

pub(crate) fn parse_float(b: &[u8]) -> Result<f64> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(SetdbError::InvalidFloat)
}

/// Resolve a start/end index pair against a length: negatives count from
/// the end, start clamps to 0, end clamps to `len - 1`. A `start > end`
/// result means the range selects nothing.
pub(crate) fn parse_range(start_arg: &[u8], end_arg: &[u8], len: i64) -> Result<(i64, i64)> {
    let mut start = parse_int(start_arg)?;
    let mut end = parse_int(end_arg)?;
    if start < 0 {
        start += len;
    }
    if end < 0 {
        end += len;
    }
    if start < 0 {
        start = 0;
    }
    if end > len - 1 {
        end = len - 1;
    }
    Ok((start, end))
}
