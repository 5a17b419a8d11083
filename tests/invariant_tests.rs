//! Structural invariant tests
//!
//! After a workload, walk the raw records and verify the on-disk shape
//! every command must preserve: metadata exists exactly when element
//! records do, tags agree, cardinalities match the record counts, sorted
//! sets keep their member/score record pair in lockstep, and list
//! records read back in push order.

use std::sync::Arc;

use setdb::command::{Dispatcher, Reply};
use setdb::keys::{
    encode_score, meta_key, parse_count, parse_float_value, KeyBuffer, KeyTag, ValueTag,
};
use setdb::{Config, Engine};
use tempfile::TempDir;

fn open() -> (TempDir, Arc<Engine>, Dispatcher) {
    let dir = TempDir::new().unwrap();
    let config = Config::builder().data_dir(dir.path()).build();
    let engine = Arc::new(Engine::open(config).unwrap());
    let dispatcher = Dispatcher::new(Arc::clone(&engine));
    (dir, engine, dispatcher)
}

fn run(d: &Dispatcher, line: &str) {
    let argv: Vec<Vec<u8>> = line
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(|w| w.as_bytes().to_vec())
        .collect();
    let reply = d.dispatch(&argv);
    if let Reply::Error(e) = reply {
        panic!("workload command failed: {} -> {}", line, e);
    }
    // drain streams so their snapshots release
    if let Reply::Stream(s) = reply {
        for _ in s.iter {}
    }
}

fn suffixes(engine: &Engine, tag: KeyTag, key: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let prefix = KeyBuffer::new(tag, key, 0);
    let at = prefix.prefix_len();
    engine
        .store()
        .scan(None, prefix, true)
        .map(|(k, v)| (k[at..].to_vec(), v))
        .collect()
}

/// Check every structural invariant for one user key.
fn check_key(engine: &Engine, key: &[u8]) {
    let meta = engine.store().get(&meta_key(key)).unwrap();

    let Some(meta) = meta else {
        // no metadata record: no element record of any kind may exist
        for tag in [
            KeyTag::String,
            KeyTag::Hash,
            KeyTag::List,
            KeyTag::Set,
            KeyTag::ZSet,
            KeyTag::ZScore,
        ] {
            assert!(
                suffixes(engine, tag, key).is_empty(),
                "key {:?}: orphaned {:?} records without metadata",
                key,
                tag
            );
        }
        return;
    };

    let tag = ValueTag::from_u8(meta[0]).expect("metadata carries a known tag");
    // element records of a foreign aggregate must not coexist
    let foreign: &[KeyTag] = match tag {
        ValueTag::StringLen => &[KeyTag::Hash, KeyTag::List, KeyTag::Set, KeyTag::ZSet],
        ValueTag::HashLen => &[KeyTag::String, KeyTag::List, KeyTag::Set, KeyTag::ZSet],
        ValueTag::ListLen => &[KeyTag::String, KeyTag::Hash, KeyTag::Set, KeyTag::ZSet],
        ValueTag::SetCard => &[KeyTag::String, KeyTag::Hash, KeyTag::List, KeyTag::ZSet],
        ValueTag::ZCard => &[KeyTag::String, KeyTag::Hash, KeyTag::List, KeyTag::Set],
    };
    for &t in foreign {
        assert!(
            suffixes(engine, t, key).is_empty(),
            "key {:?}: {:?} records under a {:?} key",
            key,
            t,
            tag
        );
    }

    match tag {
        ValueTag::StringLen => {
            let sk = KeyBuffer::new(KeyTag::String, key, 0);
            let value = engine
                .store()
                .get(sk.as_bytes())
                .unwrap()
                .expect("string value record");
            assert_eq!(parse_count(&meta, tag).unwrap() as usize, value.len());
        }
        ValueTag::HashLen => {
            let fields = suffixes(engine, KeyTag::Hash, key);
            assert_eq!(parse_count(&meta, tag).unwrap() as usize, fields.len());
            assert!(!fields.is_empty(), "empty hash must drop its metadata");
        }
        ValueTag::SetCard => {
            let members = suffixes(engine, KeyTag::Set, key);
            assert_eq!(parse_count(&meta, tag).unwrap() as usize, members.len());
            assert!(!members.is_empty(), "empty set must drop its metadata");
        }
        ValueTag::ZCard => {
            let members = suffixes(engine, KeyTag::ZSet, key);
            let scores = suffixes(engine, KeyTag::ZScore, key);
            assert_eq!(parse_count(&meta, tag).unwrap() as usize, members.len());
            assert_eq!(members.len(), scores.len());
            assert!(!members.is_empty(), "empty zset must drop its metadata");

            // each member owns exactly one score record, under the exact
            // sortable encoding of its stored score
            for (member, value) in &members {
                let score = parse_float_value(value).unwrap();
                let mut score_key = KeyBuffer::new(KeyTag::ZScore, key, 8 + member.len());
                let mut suffix = Vec::with_capacity(8 + member.len());
                suffix.extend_from_slice(&encode_score(score));
                suffix.extend_from_slice(member);
                score_key.set_suffix(&suffix);
                assert!(
                    engine.store().get(score_key.as_bytes()).unwrap().is_some(),
                    "zset member {:?} missing its score record",
                    member
                );
            }
        }
        ValueTag::ListLen => {
            let elements = suffixes(engine, KeyTag::List, key);
            assert_eq!(parse_count(&meta, tag).unwrap() as usize, elements.len());
            assert!(!elements.is_empty(), "empty list must drop its metadata");
            // key order is push order; sequence suffixes are 8 bytes
            for (suffix, _) in &elements {
                assert_eq!(suffix.len(), 8);
            }
        }
    }
}

fn check_keys(engine: &Engine, keys: &[&str]) {
    for key in keys {
        check_key(engine, key.as_bytes());
    }
}

#[test]
fn invariants_hold_across_a_mixed_workload() {
    let (_dir, engine, d) = open();
    let keys = [
        "s1", "s2", "h1", "h2", "l1", "l2", "set1", "set2", "set3", "z1", "z2", "zdest", "sdest",
    ];

    // build up
    run(&d, "set s1 hello");
    run(&d, "set s2 world");
    run(&d, "append s1 -more");
    run(&d, "hmset h1 a 1 b 2 c 3");
    run(&d, "hset h2 only one");
    run(&d, "rpush l1 a b c d e");
    run(&d, "lpush l2 x y z");
    run(&d, "sadd set1 1 2 3 4 5");
    run(&d, "sadd set2 3 4 5 6");
    run(&d, "sadd set3 5 6 7");
    run(&d, "zadd z1 1 a 2 b 3 c");
    run(&d, "zadd z2 10 b 20 d");
    check_keys(&engine, &keys);

    // mutate
    run(&d, "hdel h1 b");
    run(&d, "hincrby h1 a 41");
    run(&d, "lpop l1");
    run(&d, "rpop l1");
    run(&d, "rpoplpush l1 l2");
    run(&d, "srem set1 2 4");
    run(&d, "spop set3");
    run(&d, "smove set2 set1 6");
    run(&d, "zincrby z1 5 a");
    run(&d, "zadd z1 2.5 b");
    run(&d, "zrem z2 d");
    check_keys(&engine, &keys);

    // combine
    run(&d, "zunionstore zdest 2 z1 z2 WEIGHTS 2 3");
    run(&d, "zinterstore zdest 2 z1 z2");
    run(&d, "sunionstore sdest set1 set2");
    run(&d, "sdiffstore sdest set1 set2");
    check_keys(&engine, &keys);

    // tear down: empty aggregates must erase themselves completely
    run(&d, "hdel h2 only");
    run(&d, "del s2 l2 set2");
    run(&d, "zremrangebyscore z2 -inf +inf");
    run(&d, "lpop l1");
    run(&d, "lpop l1");
    run(&d, "lpop l1");
    check_keys(&engine, &keys);
}

#[test]
fn type_overwrite_leaves_single_aggregate() {
    let (_dir, engine, d) = open();

    run(&d, "zadd k 1 member");
    run(&d, "set k plain");
    check_key(&engine, b"k");

    run(&d, "del k");
    run(&d, "hset k f v");
    check_key(&engine, b"k");

    run(&d, "del k");
    check_key(&engine, b"k");
}

#[test]
fn restore_builds_well_formed_records() {
    let (_dir, engine, d) = open();

    // zset dump: {one: 1, uno: 1, two: 3}
    let zset_dump: &[u8] = &[
        0x03, 0x03, 0x03, b't', b'w', b'o', 0x01, b'3', 0x03, b'u', b'n', b'o', 0x01, b'1', 0x03,
        b'o', b'n', b'e', 0x01, b'1', 0x06, 0x00, 0x61, 0xd9, 0xfd, 0x65, 0xb5, 0xcd, 0x4b, 0xc2,
    ];
    let argv: Vec<Vec<u8>> = vec![
        b"restore".to_vec(),
        b"r".to_vec(),
        b"0".to_vec(),
        zset_dump.to_vec(),
    ];
    match d.dispatch(&argv) {
        Reply::Simple("OK") => {}
        Reply::Error(e) => panic!("restore failed: {}", e),
        _ => panic!("unexpected restore reply"),
    }
    check_key(&engine, b"r");

    // restoring a different type over the same key replaces it wholesale
    let string_dump: &[u8] = &[
        0x00, 0x05, b'H', b'e', b'l', b'l', b'o', 0x06, 0x00, 0x2a, 0x24, 0x9f, 0x68, 0xc8, 0x50,
        0xc3, 0x10,
    ];
    let argv: Vec<Vec<u8>> = vec![
        b"restore".to_vec(),
        b"r".to_vec(),
        b"0".to_vec(),
        string_dump.to_vec(),
    ];
    match d.dispatch(&argv) {
        Reply::Simple("OK") => {}
        Reply::Error(e) => panic!("restore failed: {}", e),
        _ => panic!("unexpected restore reply"),
    }
    check_key(&engine, b"r");
}
