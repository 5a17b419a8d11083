//! End-to-end protocol tests
//!
//! Boot a server on an ephemeral port and talk RESP to it over a real
//! socket: framing, arity errors, inline commands, streamed replies.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use setdb::network::Server;
use setdb::protocol::{encode_argv, read_resp_value, RespValue};
use setdb::{Config, Engine};
use tempfile::TempDir;

struct TestServer {
    _dir: TempDir,
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start() -> TestServer {
        let dir = TempDir::new().unwrap();
        let config = Config::builder()
            .data_dir(dir.path())
            .listen_addr("127.0.0.1:0")
            .build();
        let engine = Arc::new(Engine::open(config.clone()).unwrap());
        let mut server = Server::bind(config, engine).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || {
            let _ = server.run();
        });
        TestServer {
            _dir: dir,
            addr,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn roundtrip(stream: &mut TcpStream, argv: &[&[u8]]) -> RespValue {
    stream.write_all(&encode_argv(argv)).unwrap();
    stream.flush().unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    read_resp_value(&mut reader).unwrap()
}

fn simple(s: &str) -> RespValue {
    RespValue::Simple(s.to_string())
}

fn bulk(s: &str) -> RespValue {
    RespValue::Bulk(Some(s.as_bytes().to_vec()))
}

#[test]
fn ping_multibulk_and_inline() {
    let server = TestServer::start();
    let mut conn = server.connect();

    assert_eq!(roundtrip(&mut conn, &[b"PING"]), simple("PONG"));

    conn.write_all(b"PING\r\n").unwrap();
    let mut reader = BufReader::new(conn.try_clone().unwrap());
    assert_eq!(read_resp_value(&mut reader).unwrap(), simple("PONG"));
}

#[test]
fn arity_checks() {
    let server = TestServer::start();
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, &[b"LRANGE"]),
        RespValue::Error("ERR wrong number of arguments for 'LRANGE' command".to_string())
    );
    assert_eq!(
        roundtrip(&mut conn, &[b"LRANGE", b"foo", b"0", b"-1"]),
        RespValue::Array(Some(Vec::new()))
    );
    assert_eq!(
        roundtrip(&mut conn, &[b"LPUSH"]),
        RespValue::Error("ERR wrong number of arguments for 'LPUSH' command".to_string())
    );
    assert_eq!(roundtrip(&mut conn, &[b"LPUSH", b"foo", b"A"]), RespValue::Int(1));
}

#[test]
fn unknown_command_keeps_connection_alive() {
    let server = TestServer::start();
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, &[b"NOSUCH", b"x"]),
        RespValue::Error("ERR unknown command 'NOSUCH'".to_string())
    );
    assert_eq!(roundtrip(&mut conn, &[b"PING"]), simple("PONG"));
}

#[test]
fn set_get_del_roundtrip() {
    let server = TestServer::start();
    let mut conn = server.connect();

    assert_eq!(roundtrip(&mut conn, &[b"SET", b"k", b"v"]), simple("OK"));
    assert_eq!(roundtrip(&mut conn, &[b"GET", b"k"]), bulk("v"));
    assert_eq!(roundtrip(&mut conn, &[b"ECHO", b"hello"]), bulk("hello"));
    assert_eq!(roundtrip(&mut conn, &[b"DEL", b"k"]), RespValue::Int(1));
    assert_eq!(roundtrip(&mut conn, &[b"GET", b"k"]), RespValue::Bulk(None));
}

#[test]
fn streamed_reply_over_the_wire() {
    let server = TestServer::start();
    let mut conn = server.connect();

    assert_eq!(
        roundtrip(&mut conn, &[b"RPUSH", b"l", b"a", b"b", b"c"]),
        RespValue::Int(3)
    );
    assert_eq!(
        roundtrip(&mut conn, &[b"LRANGE", b"l", b"0", b"-1"]),
        RespValue::Array(Some(vec![bulk("a"), bulk("b"), bulk("c")]))
    );
    assert_eq!(
        roundtrip(&mut conn, &[b"HMSET", b"h", b"f1", b"v1", b"f2", b"v2"]),
        simple("OK")
    );
    assert_eq!(
        roundtrip(&mut conn, &[b"HGETALL", b"h"]),
        RespValue::Array(Some(vec![bulk("f1"), bulk("v1"), bulk("f2"), bulk("v2")]))
    );
}

#[test]
fn protocol_error_closes_connection() {
    let server = TestServer::start();
    let mut conn = server.connect();

    conn.write_all(b"*not-a-number\r\n").unwrap();
    let mut reader = BufReader::new(conn.try_clone().unwrap());
    match read_resp_value(&mut reader).unwrap() {
        RespValue::Error(msg) => assert!(msg.contains("Protocol error"), "{}", msg),
        other => panic!("expected protocol error, got {:?}", other),
    }
    // the server hangs up after a protocol error
    assert!(read_resp_value(&mut reader).is_err());
}

#[test]
fn pipelined_requests_answer_in_order() {
    let server = TestServer::start();
    let mut conn = server.connect();

    // three requests on the wire before any reply is read
    let mut batch = Vec::new();
    batch.extend_from_slice(&encode_argv(&[b"SET", b"p", b"1"]));
    batch.extend_from_slice(&encode_argv(&[b"APPEND", b"p", b"2"]));
    batch.extend_from_slice(&encode_argv(&[b"GET", b"p"]));
    conn.write_all(&batch).unwrap();
    conn.flush().unwrap();

    let mut reader = BufReader::new(conn.try_clone().unwrap());
    assert_eq!(read_resp_value(&mut reader).unwrap(), simple("OK"));
    assert_eq!(read_resp_value(&mut reader).unwrap(), RespValue::Int(2));
    assert_eq!(read_resp_value(&mut reader).unwrap(), bulk("12"));
}

#[test]
fn binary_values_pass_through_untouched() {
    let server = TestServer::start();
    let mut conn = server.connect();

    let value: Vec<u8> = (0u8..=255).collect();
    let argv: Vec<&[u8]> = vec![b"SET", b"bin", &value];
    conn.write_all(&encode_argv(&argv)).unwrap();
    let mut reader = BufReader::new(conn.try_clone().unwrap());
    assert_eq!(read_resp_value(&mut reader).unwrap(), simple("OK"));

    conn.write_all(&encode_argv(&[b"GET", b"bin"])).unwrap();
    assert_eq!(
        read_resp_value(&mut reader).unwrap(),
        RespValue::Bulk(Some(value))
    );
}

#[test]
fn concurrent_writers_serialize_per_key() {
    let server = TestServer::start();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let addr = server.addr;
        handles.push(std::thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            for _ in 0..50 {
                roundtrip(&mut conn, &[b"HINCRBY", b"counter", b"n", b"1"]);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut conn = server.connect();
    assert_eq!(roundtrip(&mut conn, &[b"HGET", b"counter", b"n"]), bulk("200"));
}
