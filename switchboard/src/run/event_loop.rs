use super::server::Server;
use crate::config::{BUF_SIZE, MAX_CONNECTIONS};
use crate::conn::{Connection, Status};
use crate::queue;
use crate::wire::{json, Request, Response};
use color_eyre::eyre::Report;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

const WAKER_TOKEN: Token = Token(MAX_CONNECTIONS);

/// A request broke the protocol badly enough that the only answer is to
/// drop the connection.
#[derive(Debug, Clone, Copy)]
pub struct Violation(&'static str);

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker result could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultError {
    /// No client is waiting under this id.
    UnknownId,
    /// The waiting client disconnected in the meantime.
    ClientGone,
}

/// The cross-thread face of one event loop: everything other threads may
/// touch. The loop thread itself owns the `Poll` inside `EventLoop`.
pub struct LoopHandle {
    index: usize,
    registry: Registry,
    waker: Waker,
    /// Held by `Server::autolock` to keep this loop from migrating or
    /// re-matching its connections while another loop inspects them.
    pub del_lock: Mutex<()>,
    accept_request: AtomicBool,
}

impl LoopHandle {
    /// Assumes ownership of `conn`: pins it to this loop and registers
    /// its socket for readiness.
    pub fn accept(&self, conn: &Arc<Connection>) -> io::Result<()> {
        if conn.is_closed() {
            panic!("accept: connection is closed");
        }
        conn.set_nloop(self.index);
        conn.set_need_loop(self.index);
        conn.register(&self.registry)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Asks this loop to re-run matching for its migrated connections.
    pub fn request_accept(&self) -> io::Result<()> {
        self.accept_request.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

/// One event-driven worker thread: owns a `Poll`, services the
/// connections pinned to it and runs the matching algorithms.
pub struct EventLoop {
    index: usize,
    poll: Poll,
    server: Arc<Server>,
    handle: Arc<LoopHandle>,
}

/// Visits the local loop first, then every other loop in index order.
fn scan_order(self_loop: usize, threads: usize) -> impl Iterator<Item = usize> {
    std::iter::once(self_loop).chain((0..threads).filter(move |i| *i != self_loop))
}

impl EventLoop {
    pub fn new(index: usize, server: Arc<Server>) -> Result<(EventLoop, Arc<LoopHandle>), Report> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let handle = Arc::new(LoopHandle {
            index,
            registry,
            waker,
            del_lock: Mutex::new(()),
            accept_request: AtomicBool::new(false),
        });
        let event_loop = EventLoop {
            index,
            poll,
            server,
            handle: handle.clone(),
        };
        Ok((event_loop, handle))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Runs the loop, logging the error that killed it. Errors escaping
    /// `run` are invariant violations; the supervisor may restart the
    /// process.
    pub fn run_safe(mut self) {
        if let Err(e) = self.run() {
            error!("fatal error in loop {}: {:?}", self.index, e);
        }
    }

    fn run(&mut self) -> Result<(), Report> {
        let mut events = Events::with_capacity(1024);
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let mut need_migrate = false;
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let fd = token.0;
                let conn = match self.server.table().get(fd) {
                    Some(conn) => conn,
                    None => continue,
                };
                if conn.nloop() != self.index {
                    warn!(
                        "loop {}: event for fd {} pinned to loop {}",
                        self.index,
                        fd,
                        conn.nloop()
                    );
                    continue;
                }

                if event.is_error() {
                    debug!("socket error event on fd {}", fd);
                    self.close(fd);
                    continue;
                }
                if event.is_readable() || event.is_read_closed() {
                    self.on_readable(&conn, &mut buf);
                }
                if !conn.is_closed() && event.is_writable() {
                    self.on_writable(&conn);
                }

                if conn.go_loop() {
                    need_migrate = true;
                }
            }

            if need_migrate {
                self.migrate_marked();
            }
            if self.handle.accept_request.load(Ordering::SeqCst) {
                self.match_migrated();
            }
        }
    }

    // --- socket events ---

    fn on_readable(&self, conn: &Arc<Connection>, buf: &mut [u8]) {
        loop {
            let n = match conn.read_into(buf) {
                Ok(0) => {
                    self.close(conn.fd());
                    return;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("recv error on fd {}: {}", conn.fd(), e);
                    self.close(conn.fd());
                    return;
                }
            };
            conn.feed(&buf[..n]);

            loop {
                match conn.next_request() {
                    Ok(Some(request)) => {
                        if let Err(violation) = self.dispatch(conn, request) {
                            debug!("closing fd {}: {}", conn.fd(), violation);
                            self.close(conn.fd());
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("closing fd {}: {}", conn.fd(), e);
                        self.close(conn.fd());
                        return;
                    }
                }
            }
        }
    }

    fn on_writable(&self, conn: &Arc<Connection>) {
        if let Err(e) = conn.flush(self.handle.registry()) {
            debug!("send error on fd {}: {}", conn.fd(), e);
            self.close(conn.fd());
        }
    }

    fn close(&self, fd: usize) {
        let conn = match self.server.table().get(fd) {
            Some(conn) => conn,
            None => panic!("close: no connection for fd {}", fd),
        };
        debug!("disconnect fd {}", fd);
        conn.set_closed();
        self.on_disconnect(&conn);
        self.server.table().clear(fd);
        let _ = conn.deregister(self.handle.registry());
        conn.shutdown();
    }

    // --- request dispatch ---

    fn dispatch(&self, conn: &Arc<Connection>, request: Request) -> Result<(), Violation> {
        match request.path.as_str() {
            "/rpc/add" => self.handle_worker_add(conn, request, false),
            "/rpc/worker" => self.handle_worker_add(conn, request, true),
            "/rpc/result" => self.handle_worker_result(conn, request),
            "/rpc/details" => {
                let body = self.server.details();
                self.send(conn, Response::ok().body(body.into_bytes().into()));
                Ok(())
            }
            path if path.starts_with("/rpc/") => {
                self.send(conn, self.error_404());
                Ok(())
            }
            _ => self.handle_client(conn, request),
        }
    }

    fn handle_worker_add(
        &self,
        conn: &Arc<Connection>,
        request: Request,
        worker_mode: bool,
    ) -> Result<(), Violation> {
        if conn.status() != Status::Net {
            return Err(Violation("worker registration on a busy connection"));
        }

        let names = match request.name {
            Some(ref name) if !name.trim().is_empty() => name.clone(),
            _ => String::from_utf8_lossy(&request.body).trim().to_string(),
        };
        if names.is_empty() {
            self.send(
                conn,
                Response::error("400 Bad Request", -1, "no capability name", self.jsonrpc2()),
            );
            return Ok(());
        }

        conn.set_noid(request.noid);
        conn.set_fail_on_disconnect(request.fail_on_disconnect);
        conn.set_worker_mode(worker_mode);
        conn.set_info(request.info.as_deref().unwrap_or(""));
        conn.set_worker_names(&names);

        self.add_worker(&names, conn)
    }

    fn handle_worker_result(
        &self,
        conn: &Arc<Connection>,
        request: Request,
    ) -> Result<(), Violation> {
        // set when an error response already answered this request, so
        // the tail below does not ack a second time
        let mut answered = false;

        if conn.noid() {
            // noid pairings are implicit: the job this worker holds
            if conn.status() != Status::WorkerWaitResult {
                return Err(Violation("result from a noid worker with no job"));
            }
            conn.set_body(request.body.clone());
            if let Err(e) = self.worker_result_noid(conn) {
                debug!("noid result dropped: {:?}", e);
            }
        } else {
            if conn.status() != Status::Net {
                return Err(Violation("result on a busy connection"));
            }
            let id = request
                .id
                .clone()
                .or_else(|| json::extract_id(&request.body));
            match id {
                Some(id) => {
                    conn.set_body(request.body.clone());
                    match self.worker_result(&id, Some(conn)) {
                        Err(ResultError::UnknownId) => {
                            self.send(
                                conn,
                                Response::error(
                                    "400 Bad Request",
                                    -1,
                                    "unknown id",
                                    self.jsonrpc2(),
                                ),
                            );
                            answered = true;
                        }
                        Err(ResultError::ClientGone) => {
                            debug!("result for id {} dropped, client is gone", id)
                        }
                        Ok(()) => {}
                    }
                }
                None => {
                    self.send(
                        conn,
                        Response::error("400 Bad Request", -1, "no id", self.jsonrpc2()),
                    );
                    answered = true;
                }
            }
        }

        // a worker-mode worker goes back into the long-poll queue on
        // every outcome; its next job is the next response it reads
        if conn.worker_mode() {
            let names = conn.worker_names();
            self.add_worker(&names, conn)
        } else {
            if !answered {
                self.send(conn, Response::ok());
            }
            Ok(())
        }
    }

    fn handle_client(&self, conn: &Arc<Connection>, request: Request) -> Result<(), Violation> {
        if conn.status() != Status::Net {
            return Err(Violation("request on a connection awaiting a result"));
        }

        let name = request.path[1..].to_string();
        conn.set_name(&name);
        conn.set_id(request.id.as_deref().unwrap_or(""));
        conn.set_body(request.body);
        conn.set_priority(request.priority);
        conn.set_noid(request.noid);
        conn.set_fail_on_disconnect(request.fail_on_disconnect);

        if conn.need_loop() != self.index {
            // this loop is giving the connection away; let the target
            // loop run the matching after the hand-off
            conn.set_status(Status::Migration);
            conn.set_go_loop(true);
            return Ok(());
        }

        self.client_request(&name, conn);
        Ok(())
    }

    // --- matching ---

    /// Registers a worker for each listed capability, stopping at the
    /// first one that matched a waiting client.
    fn add_worker(&self, names: &str, worker: &Arc<Connection>) -> Result<(), Violation> {
        for name in names
            .split(|c: char| c == ',' || c == ' ')
            .map(str::trim)
            .filter(|name| !name.is_empty())
        {
            if self.offer_worker(name, worker)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Offers `worker` for `name`: hands it a waiting client if one
    /// exists (local loop preferred), otherwise parks it. Returns whether
    /// a client was matched.
    fn offer_worker(&self, name: &str, worker: &Arc<Connection>) -> Result<bool, Violation> {
        let name = name.strip_prefix('/').unwrap_or(name);
        let line = self
            .server
            .get_queue(name, true)
            .map_err(|_| Violation("illegal capability name"))?
            .expect("get_queue with create always returns a line");

        let info = worker.info();
        if !info.is_empty() {
            line.set_info(&info);
        }
        line.touch_last_worker();

        let threads = self.server.config().threads();
        let mut paired: Option<Arc<Connection>> = None;
        let mut sid = String::new();
        let mut rejected: Vec<Arc<Connection>> = Vec::new();

        let mut queues = line.lock();
        'scan: for rloop in scan_order(self.index, threads) {
            while let Some(client) = queues[rloop].clients.pop_front() {
                if client.is_closed() {
                    debug!("dropping closed client fd {}", client.fd());
                    continue;
                }
                if !client.claim(Status::ClientWaitResult, Status::Busy) {
                    debug!("client fd {} was claimed elsewhere", client.fd());
                    continue;
                }
                if worker.noid() {
                    paired = Some(client);
                    break 'scan;
                }
                let id = client.resolve_id(self.server.idgen());
                if self.server.pending().contains(&id) {
                    debug!("collision id {}", id);
                    client.enqueue(&self.error_collision().encode());
                    client.set_status(Status::Net);
                    rejected.push(client);
                    continue;
                }
                sid = id;
                paired = Some(client);
                break 'scan;
            }
        }

        let matched = if let Some(ref client) = paired {
            // the worker should end up on the client's loop
            worker.set_need_loop(client.nloop());
            if worker.fail_on_disconnect() || worker.noid() {
                worker.set_peer(client.clone());
            }
            if worker.noid() {
                worker.set_status(Status::WorkerWaitResult);
                worker.enqueue(
                    &Response::ok()
                        .header("Name", name)
                        .body(client.body())
                        .encode(),
                );
            } else {
                worker.enqueue(
                    &Response::ok()
                        .header("Id", sid.as_str())
                        .header("Name", name)
                        .body(client.body())
                        .encode(),
                );
                self.server.pending().insert(sid.clone(), client.clone());
                worker.set_status(Status::Net);
            }
            true
        } else {
            let local = &mut queues[self.index];
            // drop closed entries and any previous registration of this
            // same worker before parking it
            local
                .workers
                .retain(|w| !w.is_closed() && !Arc::ptr_eq(w, worker));
            local.workers.push_back(worker.clone());
            worker.set_status(Status::WorkerWaitJob);
            false
        };
        drop(queues);

        for client in &rejected {
            self.arm_write(client);
        }
        if let Some(ref client) = paired {
            self.arm_write(client);
        }
        self.arm_write(worker);
        Ok(matched)
    }

    /// Matches a client against a waiting worker (local loop preferred)
    /// or parks it by priority.
    fn client_request(&self, name: &str, client: &Arc<Connection>) {
        let line = match self.server.get_queue(name, false) {
            Ok(Some(line)) => line,
            _ => {
                debug!("404 no method {}", name);
                self.send(client, self.error_404());
                return;
            }
        };

        let threads = self.server.config().threads();
        let mut found: Option<Arc<Connection>> = None;

        let mut queues = line.lock();
        'scan: for rloop in scan_order(self.index, threads) {
            while let Some(worker) = queues[rloop].workers.pop_front() {
                if worker.is_closed() {
                    debug!("dropping closed worker fd {}", worker.fd());
                    continue;
                }
                if !worker.claim(Status::WorkerWaitJob, Status::Busy) {
                    debug!("worker fd {} is not ready", worker.fd());
                    continue;
                }
                found = Some(worker);
                break 'scan;
            }
        }

        if let Some(ref worker) = found {
            worker.set_need_loop(self.index);
            if worker.noid() {
                worker.set_peer(client.clone());
                worker.set_status(Status::WorkerWaitResult);
                worker.enqueue(
                    &Response::ok()
                        .header("Name", name)
                        .body(client.body())
                        .encode(),
                );
            } else {
                let id = client.resolve_id(self.server.idgen());
                if self.server.pending().contains(&id) {
                    // put the worker back where it came from, first in line
                    worker.set_status(Status::WorkerWaitJob);
                    queues[worker.nloop()].workers.push_front(worker.clone());
                    drop(queues);
                    debug!("400 collision id on {}", name);
                    self.send(client, self.error_collision());
                    return;
                }
                if worker.fail_on_disconnect() {
                    worker.set_peer(client.clone());
                }
                worker.enqueue(
                    &Response::ok()
                        .header("Id", id.as_str())
                        .header("Name", name)
                        .body(client.body())
                        .encode(),
                );
                self.server.pending().insert(id, client.clone());
                worker.set_status(Status::Net);
            }
        } else {
            queue::insert_by_priority(&mut queues[self.index].clients, client.clone());
        }
        client.set_status(Status::ClientWaitResult);
        drop(queues);

        if let Some(ref worker) = found {
            self.arm_write(worker);
        }
        self.arm_write(client);
    }

    /// Delivers a worker's body to the client registered under `id`, or
    /// a 503 when the worker is gone.
    fn worker_result(&self, id: &str, worker: Option<&Arc<Connection>>) -> Result<(), ResultError> {
        let client = match self.server.pending().remove(id) {
            Some(client) => client,
            None => return Err(ResultError::UnknownId),
        };
        if let Some(worker) = worker {
            worker.take_peer();
        }
        if client.is_closed() {
            return Err(ResultError::ClientGone);
        }

        match worker {
            Some(worker) => client.enqueue(
                &Response::ok()
                    .header("Id", id)
                    .body(worker.body())
                    .encode(),
            ),
            None => client.enqueue(
                &Response::error(
                    "503 Service Unavailable",
                    -1,
                    "Service Unavailable",
                    self.jsonrpc2(),
                )
                .header("Id", id)
                .encode(),
            ),
        }
        client.set_status(Status::Net);
        self.arm_write(&client);

        if let Some(worker) = worker {
            if worker.nloop() != worker.need_loop() {
                self.migrate(worker, &client);
            }
        }
        Ok(())
    }

    /// Delivers a noid worker's body to its implicitly paired client.
    fn worker_result_noid(&self, worker: &Arc<Connection>) -> Result<(), ResultError> {
        let client = worker
            .take_peer()
            .unwrap_or_else(|| panic!("no paired client for a noid result"));

        if !worker.worker_mode() {
            worker.set_noid(false);
            worker.set_fail_on_disconnect(false);
        }
        worker.set_status(Status::Net);

        if client.is_closed() {
            return Err(ResultError::ClientGone);
        }
        client.set_status(Status::Net);
        client.enqueue(&Response::ok().body(worker.body()).encode());
        self.arm_write(&client);

        if worker.nloop() != worker.need_loop() {
            self.migrate(worker, &client);
        }
        Ok(())
    }

    /// Failure propagation for a closing connection.
    fn on_disconnect(&self, conn: &Arc<Connection>) {
        if conn.status() == Status::ClientWaitResult && !conn.id().is_empty() {
            // drop the pending entry registered on this client's behalf
            self.server.pending().remove(&conn.id());
        }
        if !conn.fail_on_disconnect() {
            return;
        }
        if conn.noid() {
            if conn.status() == Status::WorkerWaitResult {
                let client = conn
                    .peer()
                    .unwrap_or_else(|| panic!("no client paired with a noid worker"));
                if !client.is_closed() {
                    client.enqueue(
                        &Response::error(
                            "503 Service Unavailable",
                            -1,
                            "Service Unavailable",
                            self.jsonrpc2(),
                        )
                        .encode(),
                    );
                    self.arm_write(&client);
                }
                client.set_status(Status::Net);
            } else if conn.peer().is_some() {
                panic!("client linked to a worker with no job in flight");
            }
        } else if let Some(client) = conn.peer() {
            let _ = self.worker_result(&client.id(), None);
        }
        conn.take_peer();
    }

    // --- migration ---

    /// Marks a worker/client pair for a move to the worker's preferred
    /// loop after the current event batch.
    fn migrate(&self, worker: &Arc<Connection>, client: &Arc<Connection>) {
        if self.index == worker.need_loop() {
            warn!("migrate: connection is already on the target loop");
        }
        worker.set_go_loop(true);
        client.set_go_loop(true);
        client.set_need_loop(worker.need_loop());
        debug!(
            "migrate: loop {} -> {}, fds {} {}",
            self.index,
            worker.need_loop(),
            worker.fd(),
            client.fd()
        );
    }

    /// Hands every marked connection of this loop over to its preferred
    /// loop. Runs after an event batch, with every other loop held off.
    fn migrate_marked(&self) {
        let _guard = self.server.autolock(Some(self.index));
        for fd in 0..=self.server.table().max_fd() {
            let conn = match self.server.table().get(fd) {
                Some(conn) => conn,
                None => continue,
            };
            if conn.nloop() != self.index {
                continue;
            }
            if !conn.go_loop() || conn.need_loop() == self.index {
                continue;
            }
            conn.set_go_loop(false);
            if conn.is_closed() {
                continue;
            }
            let _ = conn.deregister(self.handle.registry());
            debug!(
                "migrate fd {}: loop {} -> {}",
                fd,
                self.index,
                conn.need_loop()
            );
            let target = self.server.loop_handle(conn.need_loop());
            if let Err(e) = target.accept(&conn) {
                warn!("migration register failed for fd {}: {}", fd, e);
                continue;
            }
            if conn.status() == Status::Migration {
                if let Err(e) = target.request_accept() {
                    warn!("waking loop {} failed: {}", conn.need_loop(), e);
                }
            }
        }
    }

    /// Re-runs matching for connections that were handed to this loop
    /// with a request already parsed.
    fn match_migrated(&self) {
        let _guard = self.server.autolock(Some(self.index));
        self.handle.accept_request.store(false, Ordering::SeqCst);
        for fd in 0..=self.server.table().max_fd() {
            let conn = match self.server.table().get(fd) {
                Some(conn) => conn,
                None => continue,
            };
            if conn.nloop() != self.index {
                continue;
            }
            if conn.status() != Status::Migration || conn.is_closed() {
                continue;
            }
            let name = conn.name();
            self.client_request(&name, &conn);
        }
    }

    // --- helpers ---

    fn send(&self, conn: &Arc<Connection>, response: Response) {
        conn.enqueue(&response.encode());
        self.arm_write(conn);
    }

    /// Arms write readiness on the connection's owning loop; safe from
    /// any loop thread.
    fn arm_write(&self, conn: &Arc<Connection>) {
        let handle = self.server.loop_handle(conn.nloop());
        if let Err(e) = conn.arm_write(handle.registry()) {
            trace!("arming write on fd {} failed: {}", conn.fd(), e);
        }
    }

    fn jsonrpc2(&self) -> bool {
        self.server.config().jsonrpc2()
    }

    fn error_404(&self) -> Response {
        Response::error("404 Not Found", -32601, "Method not found", self.jsonrpc2())
    }

    fn error_collision(&self) -> Response {
        Response::error("400 Collision Id", -1, "Collision Id", self.jsonrpc2())
    }
}
