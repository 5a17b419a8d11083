//! RESP codec
//!
//! Server side: `read_argv` frames one request, `write_reply` serializes
//! one [`Reply`]. Client side (the CLI and MIGRATE's outbound leg):
//! `encode_argv` builds a request, `read_resp_value` parses one reply
//! into an owned [`RespValue`].

use std::io::{BufRead, Read, Write};

use crate::command::Reply;
use crate::error::{Result, SetdbError};

/// Arguments above this size indicate a broken or hostile client.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

fn protocol_error(msg: &str) -> SetdbError {
    SetdbError::Protocol(msg.to_string())
}

// =============================================================================
// Request reading
// =============================================================================

/// Read one request. Returns `None` on a clean EOF before any bytes of a
/// request were consumed.
pub fn read_argv<R: BufRead>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>> {
    let first = {
        let buf = reader.fill_buf()?;
        match buf.first() {
            None => return Ok(None),
            Some(&b) => b,
        }
    };
    if first != b'*' {
        return read_inline(reader).map(Some);
    }

    let argc = read_length(reader, b'*')?;
    if argc < 0 {
        return Err(protocol_error("invalid multibulk length"));
    }
    let mut args = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        let len = read_length(reader, b'$')?;
        if !(0..=MAX_BULK_LEN).contains(&len) {
            return Err(protocol_error("invalid bulk length"));
        }
        let mut arg = vec![0u8; len as usize];
        reader.read_exact(&mut arg)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != *b"\r\n" {
            return Err(protocol_error("expected CRLF after argument"));
        }
        args.push(arg);
    }
    Ok(Some(args))
}

/// Old-style inline request: space-separated words on one line.
fn read_inline<R: BufRead>(reader: &mut R) -> Result<Vec<Vec<u8>>> {
    let line = read_line(reader)?;
    Ok(line
        .split(|&b| b == b' ')
        .filter(|word| !word.is_empty())
        .map(|word| word.to_vec())
        .collect())
}

/// Read a length line such as `$3\r\n` or `*2\r\n`.
fn read_length<R: BufRead>(reader: &mut R, prefix: u8) -> Result<i64> {
    let mut lead = [0u8; 1];
    reader.read_exact(&mut lead)?;
    if lead[0] != prefix {
        return Err(protocol_error("invalid length"));
    }
    let line = read_line(reader)?;
    if line.is_empty() {
        return Err(protocol_error("missing length"));
    }
    std::str::from_utf8(&line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| protocol_error("length is not a valid integer"))
}

/// Read up to `\n`, stripping the trailing CRLF.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    if line.last() != Some(&b'\n') {
        return Err(protocol_error("unterminated line"));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

// =============================================================================
// Reply writing
// =============================================================================

/// Serialize one reply. Streamed arrays are drained here; their backing
/// snapshot is released when the stream drops at the end of this call.
pub fn write_reply<W: Write>(writer: &mut W, reply: Reply<'_>) -> std::io::Result<()> {
    match reply {
        Reply::Nil => writer.write_all(b"$-1\r\n"),
        Reply::NilArray => writer.write_all(b"*-1\r\n"),
        Reply::Simple(s) => {
            writer.write_all(b"+")?;
            writer.write_all(s.as_bytes())?;
            writer.write_all(b"\r\n")
        }
        Reply::Error(e) => {
            writer.write_all(b"-ERR ")?;
            writer.write_all(e.to_string().as_bytes())?;
            writer.write_all(b"\r\n")
        }
        Reply::Int(n) => write!(writer, ":{}\r\n", n),
        Reply::Bulk(b) => {
            write!(writer, "${}\r\n", b.len())?;
            writer.write_all(&b)?;
            writer.write_all(b"\r\n")
        }
        Reply::Array(items) => {
            write!(writer, "*{}\r\n", items.len())?;
            for item in items {
                write_reply(writer, item)?;
            }
            Ok(())
        }
        Reply::Stream(stream) => {
            write!(writer, "*{}\r\n", stream.len)?;
            for item in stream.iter {
                write_reply(writer, item)?;
            }
            Ok(())
        }
    }
}

// =============================================================================
// Client side
// =============================================================================

/// Encode a request in multi-bulk form.
pub fn encode_argv(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// An owned, fully-parsed reply, as seen from the client side.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

/// Parse one reply from a server.
pub fn read_resp_value<R: BufRead>(reader: &mut R) -> Result<RespValue> {
    let mut lead = [0u8; 1];
    reader.read_exact(&mut lead)?;
    let line = read_line(reader)?;
    match lead[0] {
        b'+' => Ok(RespValue::Simple(String::from_utf8_lossy(&line).into_owned())),
        b'-' => Ok(RespValue::Error(String::from_utf8_lossy(&line).into_owned())),
        b':' => std::str::from_utf8(&line)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(RespValue::Int)
            .ok_or_else(|| protocol_error("invalid integer reply")),
        b'$' => {
            let len: i64 = std::str::from_utf8(&line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| protocol_error("invalid bulk length"))?;
            if len < 0 {
                return Ok(RespValue::Bulk(None));
            }
            if len > MAX_BULK_LEN {
                return Err(protocol_error("invalid bulk length"));
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf)?;
            Ok(RespValue::Bulk(Some(payload)))
        }
        b'*' => {
            let len: i64 = std::str::from_utf8(&line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| protocol_error("invalid multibulk length"))?;
            if len < 0 {
                return Ok(RespValue::Array(None));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_resp_value(reader)?);
            }
            Ok(RespValue::Array(Some(items)))
        }
        _ => Err(protocol_error("unexpected reply type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_multibulk_request() {
        let mut input = Cursor::new(b"*2\r\n$4\r\nECHO\r\n$3\r\nfoo\r\n".to_vec());
        let argv = read_argv(&mut input).unwrap().unwrap();
        assert_eq!(argv, vec![b"ECHO".to_vec(), b"foo".to_vec()]);
    }

    #[test]
    fn reads_inline_request() {
        let mut input = Cursor::new(b"PING\r\n".to_vec());
        let argv = read_argv(&mut input).unwrap().unwrap();
        assert_eq!(argv, vec![b"PING".to_vec()]);

        let mut input = Cursor::new(b"SET  foo  bar\r\n".to_vec());
        let argv = read_argv(&mut input).unwrap().unwrap();
        assert_eq!(argv, vec![b"SET".to_vec(), b"foo".to_vec(), b"bar".to_vec()]);
    }

    #[test]
    fn eof_is_clean() {
        let mut input = Cursor::new(Vec::new());
        assert!(read_argv(&mut input).unwrap().is_none());
    }

    #[test]
    fn bad_framing_is_a_protocol_error() {
        let mut input = Cursor::new(b"*x\r\n".to_vec());
        assert!(matches!(
            read_argv(&mut input),
            Err(SetdbError::Protocol(_))
        ));

        let mut input = Cursor::new(b"*1\r\n$3\r\nfooXX".to_vec());
        assert!(matches!(
            read_argv(&mut input),
            Err(SetdbError::Protocol(_)) | Err(SetdbError::Io(_))
        ));
    }

    fn rendered(reply: Reply<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        write_reply(&mut out, reply).unwrap();
        out
    }

    #[test]
    fn writes_every_reply_variant() {
        assert_eq!(rendered(Reply::Nil), b"$-1\r\n");
        assert_eq!(rendered(Reply::NilArray), b"*-1\r\n");
        assert_eq!(rendered(Reply::Simple("OK")), b"+OK\r\n");
        assert_eq!(rendered(Reply::Int(-5)), b":-5\r\n");
        assert_eq!(rendered(Reply::Bulk(b"hi".to_vec())), b"$2\r\nhi\r\n");
        assert_eq!(
            rendered(Reply::Error(SetdbError::Syntax)),
            b"-ERR syntax error\r\n"
        );
        assert_eq!(
            rendered(Reply::Array(vec![Reply::Int(1), Reply::Nil])),
            b"*2\r\n:1\r\n$-1\r\n"
        );
    }

    #[test]
    fn streams_write_count_then_body() {
        let items = vec![Reply::Bulk(b"a".to_vec()), Reply::Bulk(b"b".to_vec())];
        let reply = Reply::stream(2, items.into_iter());
        assert_eq!(rendered(reply), b"*2\r\n$1\r\na\r\n$1\r\nb\r\n");
    }

    #[test]
    fn client_roundtrip() {
        let encoded = encode_argv(&[b"SET", b"k", b"v"]);
        let mut cursor = Cursor::new(encoded);
        let argv = read_argv(&mut cursor).unwrap().unwrap();
        assert_eq!(argv[0], b"SET");

        let mut reply = Cursor::new(b"*2\r\n$1\r\na\r\n$-1\r\n".to_vec());
        assert_eq!(
            read_resp_value(&mut reply).unwrap(),
            RespValue::Array(Some(vec![
                RespValue::Bulk(Some(b"a".to_vec())),
                RespValue::Bulk(None)
            ]))
        );
    }
}
