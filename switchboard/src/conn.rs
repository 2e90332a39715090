use crate::id::IdGen;
use crate::wire::{self, ParseError, Request};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Connection status. Transitions that claim or release a queue slot are
/// confirmed under the per-connection mutex (`claim`); everything else
/// reads and writes the atomic directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Plain socket traffic, nothing in flight.
    Net = 0,
    /// Claimed by a matching operation, between queues.
    Busy = 1,
    /// Client parked or registered, waiting for a result.
    ClientWaitResult = 2,
    /// Worker parked, waiting for a job.
    WorkerWaitJob = 3,
    /// Worker holds a job in noid mode, result pending.
    WorkerWaitResult = 4,
    /// Request received, but it must be matched by another loop.
    Migration = 5,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Net,
            1 => Status::Busy,
            2 => Status::ClientWaitResult,
            3 => Status::WorkerWaitJob,
            4 => Status::WorkerWaitResult,
            5 => Status::Migration,
            _ => unreachable!("invalid status value {}", v),
        }
    }
}

/// Per-socket state: the status machine, buffers, the parsed request
/// descriptor and the optional link to a paired connection.
///
/// Reference counting is `Arc`: the connection table, each queue slot,
/// each pending-table entry and the worker-side peer link own one clone
/// apiece, and the value is freed when the last one drops.
pub struct Connection {
    fd: usize,
    stream: Mutex<TcpStream>,
    status: AtomicU8,
    // confirms status transitions; see `claim`
    transition: Mutex<()>,
    closed: AtomicBool,

    nloop: AtomicUsize,
    need_loop: AtomicUsize,
    go_loop: AtomicBool,

    recv_buf: Mutex<BytesMut>,
    send_buf: Mutex<BytesMut>,

    // paired client, owned from the worker side
    peer: Mutex<Option<Arc<Connection>>>,

    // request descriptor of the last parsed request
    name: Mutex<String>,
    id: Mutex<String>,
    body: Mutex<Bytes>,
    info: Mutex<String>,
    worker_names: Mutex<String>,
    priority: AtomicI32,
    noid: AtomicBool,
    fail_on_disconnect: AtomicBool,
    worker_mode: AtomicBool,
}

impl Connection {
    pub fn new(fd: usize, stream: TcpStream) -> Self {
        Self {
            fd,
            stream: Mutex::new(stream),
            status: AtomicU8::new(Status::Net as u8),
            transition: Mutex::new(()),
            closed: AtomicBool::new(false),
            nloop: AtomicUsize::new(0),
            need_loop: AtomicUsize::new(0),
            go_loop: AtomicBool::new(false),
            recv_buf: Mutex::new(BytesMut::new()),
            send_buf: Mutex::new(BytesMut::new()),
            peer: Mutex::new(None),
            name: Mutex::new(String::new()),
            id: Mutex::new(String::new()),
            body: Mutex::new(Bytes::new()),
            info: Mutex::new(String::new()),
            worker_names: Mutex::new(String::new()),
            priority: AtomicI32::new(0),
            noid: AtomicBool::new(false),
            fail_on_disconnect: AtomicBool::new(false),
            worker_mode: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> usize {
        self.fd
    }

    pub fn token(&self) -> Token {
        Token(self.fd)
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Moves `from -> to` if the status still is `from` once the
    /// transition lock is held. The unlocked pre-check keeps the common
    /// mismatch case cheap; the locked re-check is what makes a claim
    /// exclusive against the disconnect path.
    pub fn claim(&self, from: Status, to: Status) -> bool {
        if self.status() != from {
            return false;
        }
        let _guard = self.transition.lock();
        if self.status() != from {
            return false;
        }
        self.set_status(to);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn nloop(&self) -> usize {
        self.nloop.load(Ordering::SeqCst)
    }

    pub fn set_nloop(&self, nloop: usize) {
        self.nloop.store(nloop, Ordering::SeqCst);
    }

    pub fn need_loop(&self) -> usize {
        self.need_loop.load(Ordering::SeqCst)
    }

    pub fn set_need_loop(&self, need_loop: usize) {
        self.need_loop.store(need_loop, Ordering::SeqCst);
    }

    pub fn go_loop(&self) -> bool {
        self.go_loop.load(Ordering::SeqCst)
    }

    pub fn set_go_loop(&self, go_loop: bool) {
        self.go_loop.store(go_loop, Ordering::SeqCst);
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
    }

    pub fn noid(&self) -> bool {
        self.noid.load(Ordering::SeqCst)
    }

    pub fn set_noid(&self, noid: bool) {
        self.noid.store(noid, Ordering::SeqCst);
    }

    pub fn fail_on_disconnect(&self) -> bool {
        self.fail_on_disconnect.load(Ordering::SeqCst)
    }

    pub fn set_fail_on_disconnect(&self, fail: bool) {
        self.fail_on_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn worker_mode(&self) -> bool {
        self.worker_mode.load(Ordering::SeqCst)
    }

    pub fn set_worker_mode(&self, worker_mode: bool) {
        self.worker_mode.store(worker_mode, Ordering::SeqCst);
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_string();
    }

    pub fn id(&self) -> String {
        self.id.lock().clone()
    }

    pub fn set_id(&self, id: &str) {
        *self.id.lock() = id.to_string();
    }

    pub fn body(&self) -> Bytes {
        self.body.lock().clone()
    }

    pub fn set_body(&self, body: Bytes) {
        *self.body.lock() = body;
    }

    pub fn info(&self) -> String {
        self.info.lock().clone()
    }

    pub fn set_info(&self, info: &str) {
        *self.info.lock() = info.to_string();
    }

    pub fn worker_names(&self) -> String {
        self.worker_names.lock().clone()
    }

    pub fn set_worker_names(&self, names: &str) {
        *self.worker_names.lock() = names.to_string();
    }

    pub fn set_peer(&self, peer: Arc<Connection>) {
        *self.peer.lock() = Some(peer);
    }

    pub fn peer(&self) -> Option<Arc<Connection>> {
        self.peer.lock().clone()
    }

    pub fn take_peer(&self) -> Option<Arc<Connection>> {
        self.peer.lock().take()
    }

    /// Returns the response id for this request, resolving it on first
    /// use: an id supplied up front wins, then the body's JSON `"id"`
    /// member, then a generated one.
    pub fn resolve_id(&self, gen: &IdGen) -> String {
        let mut id = self.id.lock();
        if id.is_empty() {
            *id = match wire::json::extract_id(&self.body.lock()) {
                Some(found) => found,
                None => gen.next_id(),
            };
        }
        id.clone()
    }

    // --- socket side ---

    pub fn feed(&self, data: &[u8]) {
        self.recv_buf.lock().extend_from_slice(data);
    }

    /// Takes the next complete request off the receive buffer.
    pub fn next_request(&self) -> Result<Option<Request>, ParseError> {
        let mut recv_buf = self.recv_buf.lock();
        match wire::http::parse(&recv_buf)? {
            Some((request, consumed)) => {
                let _ = recv_buf.split_to(consumed);
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// Appends raw response bytes; write readiness is armed separately.
    pub fn enqueue(&self, data: &[u8]) {
        self.send_buf.lock().extend_from_slice(data);
    }

    pub fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.lock().read(buf)
    }

    /// Drains the send buffer to the socket. Interest is adjusted under
    /// the buffer lock so a concurrent `arm_write` cannot be lost.
    pub fn flush(&self, registry: &Registry) -> io::Result<()> {
        let mut send_buf = self.send_buf.lock();
        while !send_buf.is_empty() {
            let mut stream = self.stream.lock();
            match stream.write(&send_buf[..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    drop(stream);
                    let _ = send_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let interest = if send_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        registry.reregister(&mut *self.stream.lock(), self.token(), interest)
    }

    /// Arms write readiness on the owning loop if data is pending. Safe
    /// to call from any thread.
    pub fn arm_write(&self, registry: &Registry) -> io::Result<()> {
        let send_buf = self.send_buf.lock();
        if send_buf.is_empty() {
            return Ok(());
        }
        registry.reregister(
            &mut *self.stream.lock(),
            self.token(),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// First registration with a loop's poll registry.
    pub fn register(&self, registry: &Registry) -> io::Result<()> {
        let send_buf = self.send_buf.lock();
        let interest = if send_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        registry.register(&mut *self.stream.lock(), self.token(), interest)
    }

    pub fn deregister(&self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut *self.stream.lock())
    }

    /// Closes the OS-level stream; stale queue entries may keep the value
    /// alive a little longer, but the peer sees the disconnect now.
    pub fn shutdown(&self) {
        let _ = self.stream.lock().shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .field("nloop", &self.nloop())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::os::unix::io::AsRawFd;

    /// Builds a connection over a loopback socket pair; the remote end is
    /// returned so the socket stays open for the duration of a test.
    pub(crate) fn connection() -> (Arc<Connection>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        let fd = local.as_raw_fd() as usize;
        let conn = Arc::new(Connection::new(fd, TcpStream::from_std(local)));
        (conn, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn claim_is_exclusive() {
        let (conn, _remote) = testutil::connection();
        conn.set_status(Status::ClientWaitResult);

        assert!(conn.claim(Status::ClientWaitResult, Status::Busy));
        assert_eq!(conn.status(), Status::Busy);

        // a second claimant sees the transition and backs off
        assert!(!conn.claim(Status::ClientWaitResult, Status::Busy));
    }

    #[test]
    fn requests_come_off_the_receive_buffer() {
        let (conn, _remote) = testutil::connection();
        conn.feed(b"POST /echo HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi");
        let request = conn.next_request().unwrap().expect("request is complete");
        assert_eq!(request.path, "/echo");
        assert_eq!(&request.body[..], b"hi");
        assert!(conn.next_request().unwrap().is_none());
    }

    #[test]
    fn id_resolution_order() {
        let gen = IdGen::new();

        let (conn, _remote) = testutil::connection();
        conn.set_id("given");
        assert_eq!(conn.resolve_id(&gen), "given");

        let (conn, _remote) = testutil::connection();
        conn.set_body(Bytes::from_static(b"{\"id\": 42, \"params\": []}"));
        assert_eq!(conn.resolve_id(&gen), "42");

        let (conn, _remote) = testutil::connection();
        conn.set_body(Bytes::from_static(b"{}"));
        let generated = conn.resolve_id(&gen);
        assert!(generated.starts_with('g'));
        // resolution is sticky
        assert_eq!(conn.resolve_id(&gen), generated);
    }
}
