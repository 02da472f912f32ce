//! TCP listener for worker connections.
//!
//! The accept loop runs on its own thread with a non-blocking listener
//! polled every 10 ms, so `stop` takes effect promptly. Each accepted socket
//! gets a `ServerConnection` on a fresh thread; the orchestrator learns about
//! it through `CommanderEvent::ConnectionCreated` before that thread starts.
//!
//! `stop` ends accepting but keeps the socket bound; established connections
//! are not affected. The socket is closed when the `Server` is dropped.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::connection::{ConnectionSettings, ServerConnection};
use super::event::{CommanderEvent, ConnectionId, EventSender};


const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Decides whether a peer may connect. Refused sockets are closed at once.
pub type ConnectionFilter = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;


pub struct Server {
    listener: TcpListener,
    settings: ConnectionSettings,
    filter: Option<ConnectionFilter>,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl Server {
    pub fn bind(address: &str, port: u16, settings: ConnectionSettings) -> std::io::Result<Server> {
        let listener = TcpListener::bind((address, port))?;
        log::info!("listening for workers on {}", listener.local_addr()?);
        Ok(Server {
            listener,
            settings,
            filter: None,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
            connections: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Applies to connections accepted after the next `start`.
    pub fn set_connection_filter(&mut self, filter: ConnectionFilter) {
        self.filter = Some(filter);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start accepting. Calling it while already running does nothing.
    pub fn start(&mut self, events: EventSender) -> std::io::Result<()> {
        if self.accept_thread.is_some() {
            return Ok(());
        }
        let listener = self.listener.try_clone()?;
        listener.set_nonblocking(true)?;
        self.running.store(true, Ordering::SeqCst);

        let accept = AcceptLoop {
            listener,
            settings: self.settings,
            filter: self.filter.clone(),
            running: Arc::clone(&self.running),
            connections: Arc::clone(&self.connections),
            next_id: Arc::clone(&self.next_id),
            events,
        };
        let handle = thread::Builder::new()
            .name("accept".into())
            .spawn(move || accept.run())?;
        self.accept_thread = Some(handle);
        Ok(())
    }

    /// Stop accepting and wait for the accept thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }

    /// Wait for every connection thread started so far.
    pub fn join_connections(&self) {
        let handles: Vec<JoinHandle<()>> = self.connections.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}


struct AcceptLoop {
    listener: TcpListener,
    settings: ConnectionSettings,
    filter: Option<ConnectionFilter>,
    running: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
    events: EventSender,
}

impl AcceptLoop {
    fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.admit(stream, peer) {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    let _ = self.events.send(CommanderEvent::ListenerFailed { error: e.to_string() });
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Returns false once the orchestrator has gone away.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) -> bool {
        if let Some(filter) = &self.filter {
            if !filter(&peer) {
                log::info!("refused connection from {}", peer);
                return true;
            }
        }
        if let Err(e) = stream.set_nonblocking(false) {
            log::warn!("dropping connection from {}: {}", peer, e);
            return true;
        }
        let socket = match stream.try_clone() {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("dropping connection from {}: {}", peer, e);
                return true;
            }
        };

        let id: ConnectionId = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (commands, command_rx) = mpsc::channel();
        if self
            .events
            .send(CommanderEvent::ConnectionCreated { id, peer, commands, socket })
            .is_err()
        {
            return false;
        }
        log::debug!("connection {} from {}", id, peer);

        let connection = ServerConnection::new(id, stream, self.settings);
        let events = self.events.clone();
        match thread::Builder::new()
            .name(format!("conn-{}", id))
            .spawn(move || connection.serve(command_rx, events))
        {
            Ok(handle) => self.connections.lock().push(handle),
            Err(e) => {
                log::error!("cannot start thread for connection {}: {}", id, e);
                let _ = self.events.send(CommanderEvent::ConnectionFailed {
                    id,
                    hostname: None,
                    error: e.to_string(),
                });
            }
        }
        true
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
