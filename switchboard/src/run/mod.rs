// This module contains the event loops and the matching algorithms.
mod event_loop;

// This module contains the process-wide registry and the accept loop.
mod server;

// Re-exports.
pub use event_loop::{EventLoop, LoopHandle, ResultError};
pub use server::{AutoLock, ConnTable, Server};

use crate::config::Config;
use color_eyre::eyre::Report;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// Starts the broker and serves the accept loop on the calling thread,
/// forever.
pub fn start(config: Config) -> Result<(), Report> {
    let (server, listener) = bind(config)?;
    server.accept_loop(listener)
}

/// Starts the broker with the accept loop on a background thread and
/// returns a handle carrying the bound address. Used by tests and
/// embedders; the loops run until the process exits.
pub fn spawn(config: Config) -> Result<Handle, Report> {
    let (server, listener) = bind(config)?;
    let addr = listener.local_addr()?;
    let accept_server = server.clone();
    thread::Builder::new()
        .name("accept".to_string())
        .spawn(move || {
            if let Err(e) = accept_server.accept_loop(listener) {
                error!("accept loop ended: {:?}", e);
            }
        })?;
    Ok(Handle { addr, server })
}

fn bind(config: Config) -> Result<(Arc<Server>, TcpListener), Report> {
    let server = Arc::new(Server::new(config));
    Server::start_loops(&server)?;
    let listener = TcpListener::bind((config.host(), config.port()))?;
    info!("server started on {}", listener.local_addr()?);
    Ok((server, listener))
}

/// A running broker.
pub struct Handle {
    addr: SocketAddr,
    server: Arc<Server>,
}

impl Handle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}
