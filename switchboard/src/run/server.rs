use super::event_loop::{EventLoop, LoopHandle};
use crate::config::{Config, MAX_CONNECTIONS};
use crate::conn::Connection;
use crate::id::IdGen;
use crate::pending::PendingTable;
use crate::queue::QueueLine;
use crate::trie::{IllegalName, NameTrie};
use color_eyre::eyre::{eyre, Report};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::mem;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// The connection table: slot `fd` holds the connection for that file
/// descriptor. Slots are written by accept and cleared by the owning
/// loop's close path; cross-loop readers go through the per-slot lock.
pub struct ConnTable {
    slots: Box<[RwLock<Option<Arc<Connection>>>]>,
    max_fd: AtomicUsize,
}

impl ConnTable {
    fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|_| RwLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            max_fd: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, fd: usize) -> Option<Arc<Connection>> {
        self.slots.get(fd)?.read().clone()
    }

    pub fn set(&self, fd: usize, conn: Arc<Connection>) {
        let mut slot = self.slots[fd].write();
        if slot.is_some() {
            panic!("connection slot {} is not empty", fd);
        }
        *slot = Some(conn);
        self.max_fd.fetch_max(fd, Ordering::Relaxed);
    }

    pub fn clear(&self, fd: usize) -> Option<Arc<Connection>> {
        self.slots[fd].write().take()
    }

    pub fn max_fd(&self) -> usize {
        self.max_fd.load(Ordering::Relaxed)
    }
}

/// Holds every other loop's `del_lock`; dropping releases them. While an
/// autolock is held, no excluded loop can migrate or re-match its
/// connections under our feet.
pub struct AutoLock {
    handles: Vec<Arc<LoopHandle>>,
}

impl Drop for AutoLock {
    fn drop(&mut self) {
        for handle in self.handles.iter().rev() {
            // SAFETY: `Server::autolock` locked this mutex and forgot the
            // guard; this is the matching unlock.
            unsafe { handle.del_lock.force_unlock() };
        }
    }
}

#[derive(Debug, Serialize)]
struct QueueDetails {
    name: String,
    info: String,
    last_worker: u64,
    clients: usize,
    workers: usize,
}

/// Process-wide registry: connection table, capability registry, pending
/// responses and the event loops.
pub struct Server {
    config: Config,
    table: ConnTable,
    trie: NameTrie,
    queue_list: RwLock<Vec<Arc<QueueLine>>>,
    pending: PendingTable,
    idgen: IdGen,
    // serializes rare registrations (new queue lines)
    global_lock: Mutex<()>,
    loops: RwLock<Vec<Arc<LoopHandle>>>,
    active_loop: AtomicUsize,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            table: ConnTable::new(MAX_CONNECTIONS),
            trie: NameTrie::new(),
            queue_list: RwLock::new(Vec::new()),
            pending: PendingTable::new(),
            idgen: IdGen::new(),
            global_lock: Mutex::new(()),
            loops: RwLock::new(Vec::new()),
            active_loop: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &ConnTable {
        &self.table
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn idgen(&self) -> &IdGen {
        &self.idgen
    }

    pub fn loop_handle(&self, index: usize) -> Arc<LoopHandle> {
        self.loops.read()[index].clone()
    }

    pub(crate) fn install_loops(&self, handles: Vec<Arc<LoopHandle>>) {
        *self.loops.write() = handles;
    }

    /// Spawns one event-loop thread per configured loop and installs
    /// their handles.
    pub fn start_loops(server: &Arc<Server>) -> Result<(), Report> {
        let threads = server.config.threads();
        let mut loops = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let (event_loop, handle) = EventLoop::new(index, server.clone())?;
            loops.push(event_loop);
            handles.push(handle);
        }
        server.install_loops(handles);
        for event_loop in loops {
            let index = event_loop.index();
            thread::Builder::new()
                .name(format!("loop-{}", index))
                .spawn(move || event_loop.run_safe())?;
        }
        Ok(())
    }

    /// Acquires every loop's `del_lock` except `except`, in index order.
    pub fn autolock(&self, except: Option<usize>) -> AutoLock {
        let loops = self.loops.read().clone();
        let mut held = Vec::with_capacity(loops.len());
        for (index, handle) in loops.into_iter().enumerate() {
            if Some(index) == except {
                continue;
            }
            mem::forget(handle.del_lock.lock());
            held.push(handle);
        }
        AutoLock { handles: held }
    }

    /// Returns the queue line for `name`. With `create` set, a missing
    /// line is registered under the global lock (double-checked, since
    /// another loop may have registered it first).
    pub fn get_queue(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<QueueLine>>, IllegalName> {
        let n = self.trie.find(name.as_bytes());
        if n != 0 {
            return Ok(Some(self.queue_list.read()[(n - 1) as usize].clone()));
        }
        if !create {
            return Ok(None);
        }

        let _global = self.global_lock.lock();
        let n = self.trie.find(name.as_bytes());
        if n != 0 {
            return Ok(Some(self.queue_list.read()[(n - 1) as usize].clone()));
        }

        let line = Arc::new(QueueLine::new(name, self.config.threads()));
        let mut list = self.queue_list.write();
        list.push(line.clone());
        self.trie.add(name.as_bytes(), list.len() as u16)?;
        Ok(Some(line))
    }

    /// Introspection: one JSON entry per capability with queue depths.
    pub fn details(&self) -> String {
        let list = self.queue_list.read().clone();
        let details: Vec<QueueDetails> = list
            .iter()
            .map(|line| {
                let queues = line.lock();
                let (clients, workers) = queues
                    .iter()
                    .fold((0, 0), |(c, w), q| (c + q.clients.len(), w + q.workers.len()));
                QueueDetails {
                    name: line.name().to_string(),
                    info: line.info(),
                    last_worker: line.last_worker(),
                    clients,
                    workers,
                }
            })
            .collect();
        serde_json::to_string(&details).expect("queue details should serialize")
    }

    /// Rebalance hook: asks for the connection behind `fd` to be served
    /// by `nloop`. The move happens on the connection's next activity via
    /// the migration protocol.
    pub fn set_preferred_loop(&self, fd: usize, nloop: usize) -> bool {
        if nloop >= self.config.threads() {
            return false;
        }
        match self.table.get(fd) {
            Some(conn) => {
                conn.set_need_loop(nloop);
                true
            }
            None => false,
        }
    }

    /// Serves the accept loop forever, distributing new connections
    /// round-robin over the event loops.
    pub fn accept_loop(&self, listener: TcpListener) -> Result<(), Report> {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.accept_one(stream) {
                warn!("connection rejected: {}", e);
            }
        }
        Ok(())
    }

    fn accept_one(&self, stream: std::net::TcpStream) -> Result<(), Report> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.config.tcp_nodelay())?;
        let fd = stream.as_raw_fd() as usize;
        if fd >= MAX_CONNECTIONS {
            return Err(eyre!("socket fd ({}) >= {}", fd, MAX_CONNECTIONS));
        }

        let stream = mio::net::TcpStream::from_std(stream);
        let conn = Arc::new(Connection::new(fd, stream));
        self.table.set(fd, conn.clone());
        debug!("connect fd {}", fd);

        let loops = self.loops.read();
        let index = self.active_loop.fetch_add(1, Ordering::Relaxed) % loops.len();
        if let Err(e) = loops[index].accept(&conn) {
            self.table.clear(fd);
            return Err(eyre!("registering fd {} with loop {}: {}", fd, index, e));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(threads: usize) -> Arc<Server> {
        let mut config = Config::new("127.0.0.1".parse().unwrap(), 0);
        config.set_threads(threads);
        Arc::new(Server::new(config))
    }

    #[test]
    fn get_queue_registers_once() {
        let server = server(2);
        assert!(server.get_queue("jobs/run", false).unwrap().is_none());

        let first = server.get_queue("jobs/run", true).unwrap().unwrap();
        let second = server.get_queue("jobs/run", false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "jobs/run");
    }

    #[test]
    fn wildcard_queues_resolve_for_descendants() {
        let server = server(1);
        let line = server.get_queue("math/*", true).unwrap().unwrap();
        let via_wildcard = server.get_queue("math/add", false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&line, &via_wildcard));
    }

    #[test]
    fn illegal_names_are_refused() {
        let server = server(1);
        assert!(server.get_queue("bad\u{1}name", true).is_err());
    }

    #[test]
    fn details_lists_queues() {
        let server = server(1);
        server.get_queue("a", true).unwrap();
        server.get_queue("b", true).unwrap();
        let details = server.details();
        assert!(details.contains("\"a\""));
        assert!(details.contains("\"b\""));
    }
}
