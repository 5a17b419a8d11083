//! Connection Handler
//!
//! Owns one client socket: frames RESP requests, runs them through the
//! dispatcher, and serializes replies. A protocol error is reported to
//! the client and then closes the connection; everything else is
//! answered and the loop continues.

use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::command::{Dispatcher, Reply};
use crate::error::{Result, SetdbError};
use crate::protocol::{read_argv, write_reply};

/// Handles a single client connection
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: String,
}

impl Connection {
    pub fn new(stream: TcpStream, read_timeout_ms: u64, write_timeout_ms: u64) -> Result<Connection> {
        // accepted sockets may inherit the listener's non-blocking mode
        stream.set_nonblocking(false)?;
        if read_timeout_ms > 0 {
            stream.set_read_timeout(Some(Duration::from_millis(read_timeout_ms)))?;
        }
        if write_timeout_ms > 0 {
            stream.set_write_timeout(Some(Duration::from_millis(write_timeout_ms)))?;
        }

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(Connection {
            reader,
            writer,
            peer,
        })
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    /// Serve the connection until EOF, an I/O failure, or a protocol
    /// error.
    pub fn handle(&mut self, dispatcher: &Dispatcher) -> Result<()> {
        loop {
            match read_argv(&mut self.reader) {
                Ok(None) => return Ok(()),
                Ok(Some(argv)) => {
                    if argv.is_empty() {
                        continue;
                    }
                    let reply = dispatcher.dispatch(&argv);
                    let fatal = matches!(&reply, Reply::Error(e) if e.is_fatal());
                    write_reply(&mut self.writer, reply)?;
                    self.writer.flush()?;
                    if fatal {
                        return Ok(());
                    }
                }
                Err(SetdbError::Protocol(msg)) => {
                    tracing::debug!("protocol error from {}: {}", self.peer, msg);
                    let _ = write_reply(&mut self.writer, Reply::Error(SetdbError::Protocol(msg)));
                    let _ = self.writer.flush();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}
