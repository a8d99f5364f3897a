// TCP listener for the mobility server.
//
// Architecture: one listener thread plus one thread per connection.
//
// - **Listener thread**: non-blocking `accept()` polled against the
//   `keep_running` flag, sleeping briefly when no connection is waiting, so
//   `ServerHandle::stop` takes effect within one poll interval.
// - **Connection threads**: each runs `connection::serve_connection` to
//   completion on its own stream. Connections share only the read-only
//   config and the `ServerServices` collaborators; no agents or buffers are
//   shared.
//
// Stopping the server stops accepting; connections already in progress run
// until their client finishes or their socket times out.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use ambler_prng::Sha256Mixer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionError, ServerServices, serve_connection};
use crate::mobility::RandomWaypoint;
use crate::state_channel::TracingStateSink;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for the listener to exit.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl ServerServices {
    /// Random-waypoint mobility, SHA-256 seed mixing, and logged state
    /// changes.
    pub fn reference(config: &ServerConfig) -> Self {
        Self {
            model: Arc::new(RandomWaypoint::new(config.mobility.clone())),
            mixer: Arc::new(Sha256Mixer),
            sink: Arc::new(TracingStateSink),
        }
    }
}

/// Start a server with the reference collaborators. Returns a handle for
/// stopping it and the bound address (useful with port 0).
pub fn start_server(config: ServerConfig) -> io::Result<(ServerHandle, SocketAddr)> {
    let services = ServerServices::reference(&config);
    start_server_with(config, services)
}

/// Start a server with caller-supplied collaborators.
pub fn start_server_with(
    config: ServerConfig,
    services: ServerServices,
) -> io::Result<(ServerHandle, SocketAddr)> {
    config
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let bind = config
        .listen_addr()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(bind)?;
    let addr = listener.local_addr()?;
    // Non-blocking so the accept loop can check keep_running.
    listener.set_nonblocking(true)?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_listener = keep_running.clone();
    let config = Arc::new(config);
    let thread = thread::spawn(move || {
        accept_loop(listener, config, services, keep_running_listener);
    });

    info!(%addr, "mobility server listening");
    Ok((
        ServerHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    services: ServerServices,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let config = config.clone();
                let services = services.clone();
                thread::spawn(move || handle_connection(stream, peer, &config, &services));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "accept failed, listener exiting");
                break;
            }
        }
    }
    debug!("listener stopped");
}

fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    services: &ServerServices,
) {
    info!(%peer, "connection accepted");
    if let Err(e) = stream.set_nonblocking(false) {
        warn!(%peer, error = %e, "cannot configure socket");
        return;
    }
    match serve_connection(stream, peer, config, services) {
        Ok(end) => info!(%peer, ?end, "connection closed"),
        Err(ConnectionError::Protocol(e)) if e.is_refusal() => {
            info!(%peer, reason = %e, "connection refused");
        }
        Err(ConnectionError::Protocol(e)) => {
            warn!(%peer, error = %e, "connection dropped");
        }
        // Already logged by the connection when it sent Terminate.
        Err(ConnectionError::Model(_)) => {}
    }
}
