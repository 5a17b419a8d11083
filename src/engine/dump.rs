//! DUMP / RESTORE / MIGRATE
//!
//! Bridges the aggregate engines to the dump codec: DUMP walks one key
//! under a snapshot through the [`Encoder`], RESTORE replays a payload
//! into the command's write batch through a [`DumpSink`], and MIGRATE
//! chains a local DUMP with a RESTORE RPC against a Redis-compatible
//! target, deleting the key locally on success.

use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use rocksdb::WriteBatch;

use crate::command::Reply;
use crate::engine::list::ListMeta;
use crate::engine::{parse_int, Engine};
use crate::error::{Result, SetdbError};
use crate::keys::{
    encode_count, float_value, meta_key, parse_count, parse_score_key, set_score_key_member,
    set_score_key_score, KeyBuffer, KeyTag, ValueTag,
};
use crate::protocol::{encode_argv, read_resp_value, RespValue};
use crate::rdb::{self, DumpSink, Encoder};

impl Engine {
    /// DUMP key
    pub fn dump(&self, args: &[Vec<u8>], _wb: &mut WriteBatch) -> Result<Reply<'_>> {
        match self.dump_key(&args[0])? {
            Some(payload) => Ok(Reply::Bulk(payload)),
            None => Ok(Reply::Nil),
        }
    }

    /// RESTORE key ttl payload
    pub fn restore(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        // expiry is not supported, but the argument is still validated
        parse_int(&args[1])?;
        let mut sink = RestoreSink {
            engine: self,
            wb,
            list_seq: 0,
        };
        rdb::decode_dump(&args[2], &args[0], &mut sink)?;
        Ok(Reply::Simple("OK"))
    }

    /// MIGRATE host port key destination-db timeout
    pub fn migrate(&self, args: &[Vec<u8>], wb: &mut WriteBatch) -> Result<Reply<'_>> {
        let timeout_ms = parse_int(&args[4])?.max(1) as u64;
        let timeout = Duration::from_millis(timeout_ms);

        let Some(payload) = self.dump_key(&args[2])? else {
            return Ok(Reply::Simple("NOKEY"));
        };

        let connect_failed =
            || SetdbError::Remote("error or timeout connecting to target instance".to_string());
        let addr = format!(
            "{}:{}",
            String::from_utf8_lossy(&args[0]),
            String::from_utf8_lossy(&args[1])
        );
        let target = addr
            .to_socket_addrs()
            .map_err(|_| connect_failed())?
            .next()
            .ok_or_else(connect_failed)?;
        let mut stream = TcpStream::connect_timeout(&target, timeout).map_err(|_| connect_failed())?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let mut reader = BufReader::new(stream.try_clone()?);

        self.remote_ok(
            &mut stream,
            &mut reader,
            &[b"SELECT", &args[3]],
            format!(
                "error or timeout performing SELECT of database {} on target instance",
                String::from_utf8_lossy(&args[3])
            ),
        )?;
        self.remote_ok(
            &mut stream,
            &mut reader,
            &[b"RESTORE", &args[2], b"0", &payload],
            "error or timeout performing RESTORE of key on target instance".to_string(),
        )?;

        self.delete_key(&args[2], wb).map_err(|e| {
            SetdbError::Remote(format!("error deleting key from local instance: {}", e))
        })?;
        Ok(Reply::Simple("OK"))
    }

    /// Send one command to the migration target and require `+OK`.
    fn remote_ok(
        &self,
        stream: &mut TcpStream,
        reader: &mut BufReader<TcpStream>,
        argv: &[&[u8]],
        failure: String,
    ) -> Result<()> {
        let failed = |msg: String| SetdbError::Remote(msg);
        stream
            .write_all(&encode_argv(argv))
            .map_err(|_| failed(failure.clone()))?;
        match read_resp_value(reader) {
            Ok(RespValue::Simple(s)) if s == "OK" => Ok(()),
            Ok(RespValue::Error(msg)) => Err(failed(format!(
                "Target instance replied with error: {}",
                msg
            ))),
            _ => Err(failed(failure)),
        }
    }

    /// Serialize one key's aggregate as a dump payload, or None if the
    /// key does not exist.
    pub(crate) fn dump_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.store().snapshot();
        let Some(meta) = self.store().get_at(&snapshot, &meta_key(key))? else {
            return Ok(None);
        };
        let tag = meta
            .first()
            .and_then(|t| ValueTag::from_u8(*t))
            .ok_or(SetdbError::InvalidData)?;

        let mut enc = Encoder::new();
        match tag {
            ValueTag::StringLen => {
                enc.write_type(rdb::TYPE_STRING);
                let sk = KeyBuffer::new(KeyTag::String, key, 0);
                let value = self.store().get_at(&snapshot, sk.as_bytes())?;
                enc.write_string(&value.unwrap_or_default());
            }
            ValueTag::HashLen => {
                enc.write_type(rdb::TYPE_HASH);
                enc.write_len(parse_count(&meta, ValueTag::HashLen)?);
                let prefix = KeyBuffer::new(KeyTag::Hash, key, 0);
                let suffix_at = prefix.prefix_len();
                for (k, v) in self.store().scan(Some(snapshot.clone()), prefix, true) {
                    enc.write_string(&k[suffix_at..]);
                    enc.write_string(&v);
                }
            }
            ValueTag::SetCard => {
                enc.write_type(rdb::TYPE_SET);
                enc.write_len(parse_count(&meta, ValueTag::SetCard)?);
                let prefix = KeyBuffer::new(KeyTag::Set, key, 0);
                let suffix_at = prefix.prefix_len();
                for (k, _) in self.store().scan(Some(snapshot.clone()), prefix, true) {
                    enc.write_string(&k[suffix_at..]);
                }
            }
            ValueTag::ListLen => {
                enc.write_type(rdb::TYPE_LIST);
                let list = self.llen_value(&meta_key(key), Some(&snapshot))?;
                enc.write_len(list.len);
                let prefix = KeyBuffer::new(KeyTag::List, key, 0);
                for (_, v) in self.store().scan(Some(snapshot.clone()), prefix, true) {
                    enc.write_string(&v);
                }
            }
            ValueTag::ZCard => {
                enc.write_type(rdb::TYPE_ZSET);
                enc.write_len(parse_count(&meta, ValueTag::ZCard)?);
                // canonical dumps carry zsets in descending score order
                let prefix = KeyBuffer::new(KeyTag::ZScore, key, 0);
                for (k, _) in self.store().scan_rev(Some(snapshot.clone()), prefix, true) {
                    let (score, member) = parse_score_key(&k, key.len())?;
                    enc.write_string(&member);
                    enc.write_double(score);
                }
            }
        }
        Ok(Some(enc.into_dump()))
    }
}

/// Replays a decoded dump into the restoring command's write batch. Any
/// aggregate already under the key is deleted first.
struct RestoreSink<'e, 'w> {
    engine: &'e Engine,
    wb: &'w mut WriteBatch,
    list_seq: i64,
}

impl DumpSink for RestoreSink<'_, '_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine.delete_key(key, self.wb)?;
        self.wb.put(
            meta_key(key),
            encode_count(ValueTag::StringLen, value.len() as u32),
        );
        let sk = KeyBuffer::new(KeyTag::String, key, 0);
        self.wb.put(sk.as_bytes(), value);
        Ok(())
    }

    fn start_hash(&mut self, key: &[u8], length: u32) -> Result<()> {
        self.engine.delete_key(key, self.wb)?;
        self.wb
            .put(meta_key(key), encode_count(ValueTag::HashLen, length));
        Ok(())
    }

    fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> Result<()> {
        let k = KeyBuffer::with_suffix(KeyTag::Hash, key, field);
        self.wb.put(k.as_bytes(), value);
        Ok(())
    }

    fn start_set(&mut self, key: &[u8], cardinality: u32) -> Result<()> {
        self.engine.delete_key(key, self.wb)?;
        self.wb
            .put(meta_key(key), encode_count(ValueTag::SetCard, cardinality));
        Ok(())
    }

    fn sadd(&mut self, key: &[u8], member: &[u8]) -> Result<()> {
        let k = KeyBuffer::with_suffix(KeyTag::Set, key, member);
        self.wb.put(k.as_bytes(), b"");
        Ok(())
    }

    fn start_list(&mut self, key: &[u8], length: u32) -> Result<()> {
        self.engine.delete_key(key, self.wb)?;
        self.list_seq = 0;
        // elements land at sequences 1..=length, so the frontiers are 0
        // on the left and length+1 on the right
        let meta = ListMeta {
            flags: 0,
            len: length,
            left: 0,
            right: length as i64 + 1,
        };
        self.engine.set_llen(&meta_key(key), &meta, self.wb);
        Ok(())
    }

    fn rpush(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.list_seq += 1;
        let mut k = KeyBuffer::new(KeyTag::List, key, 8);
        k.suffix_mut(8)
            .copy_from_slice(&crate::engine::list::encode_seq(self.list_seq));
        self.wb.put(k.as_bytes(), value);
        Ok(())
    }

    fn start_zset(&mut self, key: &[u8], cardinality: u32) -> Result<()> {
        self.engine.delete_key(key, self.wb)?;
        self.wb
            .put(meta_key(key), encode_count(ValueTag::ZCard, cardinality));
        Ok(())
    }

    fn zadd(&mut self, key: &[u8], score: f64, member: &[u8]) -> Result<()> {
        let set_key = KeyBuffer::with_suffix(KeyTag::ZSet, key, member);
        let mut score_key = KeyBuffer::new(KeyTag::ZScore, key, 8 + member.len());
        set_score_key_member(&mut score_key, member);
        set_score_key_score(&mut score_key, score);
        self.wb.put(set_key.as_bytes(), float_value(score));
        self.wb.put(score_key.as_bytes(), b"");
        Ok(())
    }
}
