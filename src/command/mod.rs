//! Command Registry & Dispatch
//!
//! Declarative table of command descriptors (name, arity, writes flag,
//! key-extraction rule, handler) and the dispatch path that enforces
//! arity, acquires per-key locks, allocates the write batch, and commits
//! it atomically when the handler succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use rocksdb::WriteBatch;

use crate::engine::Engine;
use crate::error::{Result, SetdbError};

/// A response to a command.
///
/// Engines return one of these; the RESP writer pattern-matches it. Bulk
/// nil (`$-1`) and array nil (`*-1`) are distinct variants on purpose.
pub enum Reply<'a> {
    /// Nil bulk reply
    Nil,
    /// Nil multi-bulk reply
    NilArray,
    /// Single-line status string
    Simple(&'static str),
    /// Error reply
    Error(SetdbError),
    /// Integer reply
    Int(i64),
    /// Bulk byte-string reply
    Bulk(Vec<u8>),
    /// Multi-bulk reply with all elements materialized
    Array(Vec<Reply<'a>>),
    /// Multi-bulk reply streamed from a pull iterator; `len` is the
    /// element count, known before the body is produced so the writer can
    /// emit the envelope first. Dropping the iterator releases whatever
    /// snapshot backs it.
    Stream(ReplyStream<'a>),
}

pub struct ReplyStream<'a> {
    pub len: i64,
    pub iter: Box<dyn Iterator<Item = Reply<'a>> + 'a>,
}

impl<'a> Reply<'a> {
    pub fn stream(len: i64, iter: impl Iterator<Item = Reply<'a>> + 'a) -> Reply<'a> {
        Reply::Stream(ReplyStream {
            len,
            iter: Box::new(iter),
        })
    }

    /// Empty multi-bulk reply
    pub fn empty_array() -> Reply<'a> {
        Reply::Array(Vec::new())
    }
}

/// Handler signature: the argument vector excludes the command name, and
/// the batch is committed by dispatch only when the handler returns Ok.
pub type CmdFn = for<'e> fn(&'e Engine, &[Vec<u8>], &mut WriteBatch) -> Result<Reply<'e>>;

/// How dispatch finds the keys a writing command will mutate.
#[derive(Debug, Clone, Copy)]
pub enum KeySpec {
    /// No keys to lock
    None,
    /// args[first..=last] stepping by `step`; `last < 0` counts from the
    /// end (-1 = final argument)
    Range { first: usize, last: i32, step: usize },
    /// Destination key plus `numkeys` source keys (ZUNIONSTORE layout)
    NumKeys,
}

impl KeySpec {
    /// Extract the keys from an argument vector (command name excluded).
    /// Malformed arguments yield an empty list; the handler reports the
    /// actual error.
    pub fn extract<'v>(&self, args: &'v [Vec<u8>]) -> Vec<&'v [u8]> {
        match *self {
            KeySpec::None => Vec::new(),
            KeySpec::Range { first, last, step } => {
                let last = if last < 0 {
                    let from_end = (-last - 1) as usize;
                    match args.len().checked_sub(1 + from_end) {
                        Some(i) => i,
                        None => return Vec::new(),
                    }
                } else {
                    last as usize
                };
                let mut keys = Vec::new();
                let mut i = first;
                while i <= last && i < args.len() {
                    keys.push(args[i].as_slice());
                    i += step;
                }
                keys
            }
            KeySpec::NumKeys => {
                let numkeys = match args
                    .get(1)
                    .and_then(|n| std::str::from_utf8(n).ok())
                    .and_then(|n| n.parse::<usize>().ok())
                {
                    Some(n) => n,
                    None => return Vec::new(),
                };
                if args.len() < 2 + numkeys {
                    return Vec::new();
                }
                let mut keys: Vec<&[u8]> = Vec::with_capacity(1 + numkeys);
                keys.push(args[0].as_slice());
                for k in &args[2..2 + numkeys] {
                    if !keys.contains(&k.as_slice()) {
                        keys.push(k.as_slice());
                    }
                }
                keys
            }
        }
    }
}

/// A command descriptor.
///
/// `arity` counts arguments after the command name: positive means
/// exactly that many, negative means at least `-arity`.
pub struct CommandDesc {
    pub name: &'static str,
    pub arity: i32,
    pub writes: bool,
    pub keys: KeySpec,
    pub func: CmdFn,
}

impl CommandDesc {
    fn arity_ok(&self, argc: usize) -> bool {
        if self.arity < 0 {
            argc >= (-self.arity) as usize
        } else {
            argc == self.arity as usize
        }
    }
}

macro_rules! cmd {
    ($name:literal, $func:path, $arity:literal) => {
        CommandDesc {
            name: $name,
            arity: $arity,
            writes: false,
            keys: KeySpec::None,
            func: $func,
        }
    };
    ($name:literal, $func:path, $arity:literal, w, $keys:expr) => {
        CommandDesc {
            name: $name,
            arity: $arity,
            writes: true,
            keys: $keys,
            func: $func,
        }
    };
}

const FIRST_KEY: KeySpec = KeySpec::Range {
    first: 0,
    last: 0,
    step: 1,
};
const ALL_KEYS: KeySpec = KeySpec::Range {
    first: 0,
    last: -1,
    step: 1,
};
const FIRST_TWO_KEYS: KeySpec = KeySpec::Range {
    first: 0,
    last: 1,
    step: 1,
};

fn command_list() -> Vec<CommandDesc> {
    vec![
        // connection / server
        cmd!("ping", Engine::ping, 0),
        cmd!("echo", Engine::echo, 1),
        cmd!("time", Engine::time, 0),
        // generic keys
        cmd!("exists", Engine::exists, 1),
        cmd!("type", Engine::key_type, 1),
        cmd!("keys", Engine::keys, 1),
        cmd!("del", Engine::del, -1, w, ALL_KEYS),
        cmd!("dump", Engine::dump, 1),
        cmd!("restore", Engine::restore, 3, w, FIRST_KEY),
        cmd!(
            "migrate",
            Engine::migrate,
            5,
            w,
            KeySpec::Range {
                first: 2,
                last: 2,
                step: 1
            }
        ),
        // strings
        cmd!("set", Engine::set, 2, w, FIRST_KEY),
        cmd!("get", Engine::get, 1),
        cmd!("append", Engine::append, 2, w, FIRST_KEY),
        // hashes
        cmd!("hset", Engine::hset, 3, w, FIRST_KEY),
        cmd!("hsetnx", Engine::hsetnx, 3, w, FIRST_KEY),
        cmd!("hget", Engine::hget, 2),
        cmd!("hexists", Engine::hexists, 2),
        cmd!("hdel", Engine::hdel, -2, w, FIRST_KEY),
        cmd!("hmset", Engine::hmset, -3, w, FIRST_KEY),
        cmd!("hmget", Engine::hmget, -2),
        cmd!("hgetall", Engine::hgetall, 1),
        cmd!("hkeys", Engine::hkeys, 1),
        cmd!("hvals", Engine::hvals, 1),
        cmd!("hlen", Engine::hlen, 1),
        cmd!("hincrby", Engine::hincrby, 3, w, FIRST_KEY),
        cmd!("hincrbyfloat", Engine::hincrbyfloat, 3, w, FIRST_KEY),
        // lists
        cmd!("lpush", Engine::lpush, -2, w, FIRST_KEY),
        cmd!("lpushx", Engine::lpushx, 2, w, FIRST_KEY),
        cmd!("rpush", Engine::rpush, -2, w, FIRST_KEY),
        cmd!("rpushx", Engine::rpushx, 2, w, FIRST_KEY),
        cmd!("lpop", Engine::lpop, 1, w, FIRST_KEY),
        cmd!("rpop", Engine::rpop, 1, w, FIRST_KEY),
        cmd!("rpoplpush", Engine::rpoplpush, 2, w, FIRST_TWO_KEYS),
        cmd!("lrange", Engine::lrange, 3),
        cmd!("llen", Engine::llen, 1),
        // sets
        cmd!("sadd", Engine::sadd, -2, w, FIRST_KEY),
        cmd!("srem", Engine::srem, -2, w, FIRST_KEY),
        cmd!("sismember", Engine::sismember, 2),
        cmd!("smembers", Engine::smembers, 1),
        cmd!("scard", Engine::scard, 1),
        cmd!("spop", Engine::spop, 1, w, FIRST_KEY),
        cmd!("smove", Engine::smove, 3, w, FIRST_TWO_KEYS),
        cmd!("sunion", Engine::sunion, -1),
        cmd!("sunionstore", Engine::sunionstore, -2, w, ALL_KEYS),
        cmd!("sinter", Engine::sinter, -1),
        cmd!("sinterstore", Engine::sinterstore, -2, w, ALL_KEYS),
        cmd!("sdiff", Engine::sdiff, -1),
        cmd!("sdiffstore", Engine::sdiffstore, -2, w, ALL_KEYS),
        // sorted sets
        cmd!("zadd", Engine::zadd, -3, w, FIRST_KEY),
        cmd!("zincrby", Engine::zincrby, 3, w, FIRST_KEY),
        cmd!("zscore", Engine::zscore, 2),
        cmd!("zcard", Engine::zcard, 1),
        cmd!("zrem", Engine::zrem, -2, w, FIRST_KEY),
        cmd!("zrange", Engine::zrange, -3),
        cmd!("zrevrange", Engine::zrevrange, -3),
        cmd!("zrangebyscore", Engine::zrangebyscore, -3),
        cmd!("zrevrangebyscore", Engine::zrevrangebyscore, -3),
        cmd!("zremrangebyscore", Engine::zremrangebyscore, 3, w, FIRST_KEY),
        cmd!("zunionstore", Engine::zunionstore, -3, w, KeySpec::NumKeys),
        cmd!("zinterstore", Engine::zinterstore, -3, w, KeySpec::NumKeys),
    ]
}

/// Resolves command names and runs commands with the locking and
/// write-batch discipline applied uniformly.
pub struct Dispatcher {
    engine: Arc<Engine>,
    commands: HashMap<&'static str, CommandDesc>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        let mut commands = HashMap::new();
        for desc in command_list() {
            commands.insert(desc.name, desc);
        }
        Dispatcher { engine, commands }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run one command. The reply may borrow the engine (streamed replies
    /// hold a store snapshot); locks are released before returning.
    pub fn dispatch<'e>(&'e self, argv: &[Vec<u8>]) -> Reply<'e> {
        let Some(name_arg) = argv.first() else {
            return Reply::Error(SetdbError::Protocol("missing command".to_string()));
        };
        let name = String::from_utf8_lossy(name_arg).to_lowercase();
        let typed = String::from_utf8_lossy(name_arg).into_owned();

        let Some(desc) = self.commands.get(name.as_str()) else {
            return Reply::Error(SetdbError::UnknownCommand(typed));
        };
        if !desc.arity_ok(argv.len() - 1) {
            return Reply::Error(SetdbError::WrongArity(typed));
        }

        let args = &argv[1..];
        let engine: &Engine = &self.engine;
        let mut batch = WriteBatch::default();

        // Writers lock every key they will touch before reading anything;
        // readers go straight to snapshots.
        let mut guards = if desc.writes {
            engine.locks().lock_many(&desc.keys.extract(args))
        } else {
            Vec::new()
        };

        let reply = match (desc.func)(engine, args, &mut batch) {
            Ok(reply) => {
                if desc.writes {
                    match engine.store().write(batch) {
                        Ok(()) => reply,
                        Err(e) => Reply::Error(e),
                    }
                } else {
                    reply
                }
            }
            // the batch is dropped here: no partial writes reach the store
            Err(e) => Reply::Error(e),
        };

        // unlock in reverse acquisition order
        while let Some(guard) = guards.pop() {
            drop(guard);
        }

        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ranges() {
        let args: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        assert_eq!(ALL_KEYS.extract(&args), vec![b"a", b"b", b"c"]);
        assert_eq!(FIRST_KEY.extract(&args), vec![b"a"]);
        assert_eq!(FIRST_TWO_KEYS.extract(&args), vec![b"a", b"b"]);
    }

    #[test]
    fn numkeys_extraction_dedupes() {
        let args: Vec<Vec<u8>> = ["dest", "3", "x", "y", "x", "weights"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        let keys = KeySpec::NumKeys.extract(&args);
        assert_eq!(keys, vec![&b"dest"[..], b"x", b"y"]);
    }

    #[test]
    fn numkeys_extraction_tolerates_bad_count() {
        let args: Vec<Vec<u8>> = vec![b"dest".to_vec(), b"nope".to_vec()];
        assert!(KeySpec::NumKeys.extract(&args).is_empty());
        let args: Vec<Vec<u8>> = vec![b"dest".to_vec(), b"9".to_vec(), b"x".to_vec()];
        assert!(KeySpec::NumKeys.extract(&args).is_empty());
    }

    #[test]
    fn arity_rules() {
        let exact = CommandDesc {
            name: "x",
            arity: 2,
            writes: false,
            keys: KeySpec::None,
            func: Engine::ping,
        };
        assert!(exact.arity_ok(2));
        assert!(!exact.arity_ok(1));
        assert!(!exact.arity_ok(3));

        let at_least = CommandDesc {
            name: "y",
            arity: -2,
            writes: false,
            keys: KeySpec::None,
            func: Engine::ping,
        };
        assert!(at_least.arity_ok(2));
        assert!(at_least.arity_ok(5));
        assert!(!at_least.arity_ok(1));
    }
}
