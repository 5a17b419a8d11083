//! TCP Server
//!
//! Accepts connections and dispatches to worker threads.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::command::Dispatcher;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Result, SetdbError};

use super::Connection;

/// Message sent to worker threads
enum WorkerMessage {
    /// New client connection to handle
    NewConnection(TcpStream),
    /// Signal to shutdown
    Shutdown,
}

/// TCP server for SetDB
///
/// ## Architecture
/// - Main thread accepts connections
/// - Worker thread pool handles client I/O
/// - Shared Engine reference for all workers
pub struct Server {
    /// Server configuration
    config: Config,

    /// Shared command engine
    engine: Arc<Engine>,

    /// Bound TCP listener
    listener: TcpListener,

    /// Worker thread handles
    workers: Vec<JoinHandle<()>>,

    /// Shutdown flag
    shutdown: Arc<AtomicBool>,

    /// Active connection count
    active_connections: Arc<AtomicUsize>,
}

impl Server {
    /// Bind to the configured address. The listener is non-blocking so
    /// the accept loop can poll the shutdown flag.
    pub fn bind(config: Config, engine: Arc<Engine>) -> Result<Server> {
        let listener = TcpListener::bind(&config.listen_addr).map_err(|e| {
            SetdbError::Io(std::io::Error::other(format!(
                "failed to bind to {}: {}",
                config.listen_addr, e
            )))
        })?;
        listener.set_nonblocking(true)?;

        Ok(Server {
            config,
            engine,
            listener,
            workers: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Start the worker pool and accept connections until shutdown.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!("listening on {}", self.config.listen_addr);

        let num_workers = num_cpus();
        let (sender, receiver) = bounded::<WorkerMessage>(self.config.max_connections);

        tracing::info!("starting {} worker threads", num_workers);
        for worker_id in 0..num_workers {
            let worker = Worker {
                id: worker_id,
                receiver: receiver.clone(),
                engine: Arc::clone(&self.engine),
                active_connections: Arc::clone(&self.active_connections),
                read_timeout_ms: self.config.read_timeout_ms,
                write_timeout_ms: self.config.write_timeout_ms,
            };
            let handle = thread::Builder::new()
                .name(format!("setdb-worker-{}", worker_id))
                .spawn(move || worker.run())
                .map_err(|e| {
                    SetdbError::Io(std::io::Error::other(format!("failed to spawn worker: {}", e)))
                })?;
            self.workers.push(handle);
        }

        self.accept_loop(&sender);
        self.cleanup(&sender);
        Ok(())
    }

    fn accept_loop(&self, sender: &Sender<WorkerMessage>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let current = self.active_connections.load(Ordering::Relaxed);
                    if current >= self.config.max_connections {
                        tracing::warn!(
                            "connection limit reached ({}/{}), rejecting {}",
                            current,
                            self.config.max_connections,
                            addr
                        );
                        drop(stream);
                        continue;
                    }

                    tracing::debug!("accepted connection from {}", addr);
                    if let Err(e) = sender.send(WorkerMessage::NewConnection(stream)) {
                        tracing::error!("failed to dispatch connection: {}", e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // no pending connections, poll the shutdown flag
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    if !self.shutdown.load(Ordering::Relaxed) {
                        tracing::error!("accept error: {}", e);
                    }
                }
            }
        }
    }

    fn cleanup(&mut self, sender: &Sender<WorkerMessage>) {
        tracing::info!("shutting down server...");
        for _ in 0..self.workers.len() {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!("worker thread panicked: {:?}", e);
            }
        }
        tracing::info!("server shutdown complete");
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// The bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// Worker thread that handles client connections
struct Worker {
    id: usize,
    receiver: Receiver<WorkerMessage>,
    engine: Arc<Engine>,
    active_connections: Arc<AtomicUsize>,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
}

impl Worker {
    fn run(self) {
        tracing::debug!("worker {} started", self.id);
        // streamed replies borrow the dispatcher, so each worker owns one
        let dispatcher = Dispatcher::new(Arc::clone(&self.engine));

        loop {
            match self.receiver.recv() {
                Ok(WorkerMessage::NewConnection(stream)) => {
                    self.handle_connection(stream, &dispatcher);
                }
                Ok(WorkerMessage::Shutdown) => {
                    tracing::debug!("worker {} received shutdown signal", self.id);
                    break;
                }
                Err(_) => {
                    tracing::debug!("worker {} channel closed", self.id);
                    break;
                }
            }
        }

        tracing::debug!("worker {} stopped", self.id);
    }

    fn handle_connection(&self, stream: TcpStream, dispatcher: &Dispatcher) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);

        match Connection::new(stream, self.read_timeout_ms, self.write_timeout_ms) {
            Ok(mut conn) => {
                if let Err(e) = conn.handle(dispatcher) {
                    tracing::debug!("connection {} ended: {}", conn.peer_addr(), e);
                }
            }
            Err(e) => tracing::error!("failed to set up connection: {}", e),
        }

        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Worker thread count
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}
