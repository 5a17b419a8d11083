//! SetDB CLI Client
//!
//! One-shot RESP round trip: encode the command, write it on a single
//! stream, read the reply back from the same stream. Sequential
//! write-then-read on one socket avoids the pitfalls of splitting a
//! TcpStream into separately-owned reader/writer handles.

use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use setdb::protocol::{encode_argv, read_resp_value, RespValue};

/// SetDB CLI
#[derive(Parser, Debug)]
#[command(name = "setdb-cli")]
#[command(about = "Command-line client for SetDB")]
#[command(version)]
struct Args {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:12345")]
    server: String,

    /// Connection timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout: u64,

    /// Command and its arguments, e.g. `set foo bar`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout);

    let addr = match args.server.parse() {
        Ok(a) => a,
        Err(_) => {
            eprintln!("invalid server address: {}", args.server);
            return ExitCode::FAILURE;
        }
    };
    let mut stream = match TcpStream::connect_timeout(&addr, timeout) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to connect to {}: {}", args.server, e);
            return ExitCode::FAILURE;
        }
    };
    let _ = stream.set_read_timeout(Some(timeout));
    let _ = stream.set_write_timeout(Some(timeout));
    let _ = stream.set_nodelay(true);

    let argv: Vec<&[u8]> = args.command.iter().map(|s| s.as_bytes()).collect();
    let request = encode_argv(&argv);
    if let Err(e) = stream.write_all(&request).and_then(|_| stream.flush()) {
        eprintln!("failed to send command: {}", e);
        return ExitCode::FAILURE;
    }

    let mut reader = BufReader::new(&stream);
    match read_resp_value(&mut reader) {
        Ok(value) => {
            let failed = matches!(value, RespValue::Error(_));
            print_value(&value, 0);
            if failed {
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            eprintln!("failed to read reply: {}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn print_value(value: &RespValue, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        RespValue::Simple(s) => println!("{}{}", pad, s),
        RespValue::Error(msg) => eprintln!("{}(error) {}", pad, msg),
        RespValue::Int(n) => println!("{}(integer) {}", pad, n),
        RespValue::Bulk(None) => println!("{}(nil)", pad),
        RespValue::Bulk(Some(bytes)) => match std::str::from_utf8(bytes) {
            Ok(s) => println!("{}{}", pad, s),
            Err(_) => println!("{}{:?}", pad, bytes),
        },
        RespValue::Array(None) => println!("{}(nil)", pad),
        RespValue::Array(Some(items)) => {
            if items.is_empty() {
                println!("{}(empty list or set)", pad);
            }
            for (i, item) in items.iter().enumerate() {
                print!("{}{}) ", pad, i + 1);
                print_inline(item);
            }
        }
    }
}

fn print_inline(value: &RespValue) {
    match value {
        RespValue::Simple(s) => println!("{}", s),
        RespValue::Error(msg) => println!("(error) {}", msg),
        RespValue::Int(n) => println!("(integer) {}", n),
        RespValue::Bulk(None) | RespValue::Array(None) => println!("(nil)"),
        RespValue::Bulk(Some(bytes)) => match std::str::from_utf8(bytes) {
            Ok(s) => println!("\"{}\"", s),
            Err(_) => println!("{:?}", bytes),
        },
        RespValue::Array(Some(items)) => println!("(array of {})", items.len()),
    }
}
