use crate::conn::Connection;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Waiting connections of one capability on one loop. Workers are plain
/// FIFO; clients are kept ordered by priority, front first.
#[derive(Debug, Default)]
pub struct Queue {
    pub workers: VecDeque<Arc<Connection>>,
    pub clients: VecDeque<Arc<Connection>>,
}

/// All per-loop queues of one capability, plus diagnostics state. The
/// mutex covers every queue mutation and the critical section that pops
/// one side and checks the other.
#[derive(Debug)]
pub struct QueueLine {
    name: String,
    last_worker: AtomicU64,
    info: Mutex<String>,
    queues: Mutex<Box<[Queue]>>,
}

impl QueueLine {
    pub fn new(name: &str, nloops: usize) -> Self {
        let queues = (0..nloops)
            .map(|_| Queue::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            name: name.to_string(),
            last_worker: AtomicU64::new(0),
            info: Mutex::new(String::new()),
            queues: Mutex::new(queues),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records that a worker was seen for this capability just now.
    pub fn touch_last_worker(&self) {
        self.last_worker.store(unix_secs(), Ordering::Relaxed);
    }

    pub fn last_worker(&self) -> u64 {
        self.last_worker.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> String {
        self.info.lock().clone()
    }

    pub fn set_info(&self, info: &str) {
        *self.info.lock() = info.to_string();
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<[Queue]>> {
        self.queues.lock()
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Inserts `client` keeping the deque ordered by priority with FIFO
/// order within one level: scan from the back and place the newcomer
/// right behind the first entry whose priority is at least its own.
pub fn insert_by_priority(clients: &mut VecDeque<Arc<Connection>>, client: Arc<Connection>) {
    let priority = client.priority();
    for i in (0..clients.len()).rev() {
        if clients[i].priority() >= priority {
            clients.insert(i + 1, client);
            return;
        }
    }
    clients.push_front(client);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil;

    fn client(priority: i32) -> (Arc<Connection>, std::net::TcpStream) {
        let (conn, remote) = testutil::connection();
        conn.set_priority(priority);
        (conn, remote)
    }

    #[test]
    fn priority_orders_front_first() {
        let mut clients = VecDeque::new();
        let (a, _ra) = client(0);
        let (b, _rb) = client(5);
        let (c, _rc) = client(3);

        insert_by_priority(&mut clients, a.clone());
        insert_by_priority(&mut clients, b.clone());
        insert_by_priority(&mut clients, c.clone());

        let order: Vec<usize> = clients.iter().map(|conn| conn.fd()).collect();
        assert_eq!(order, vec![b.fd(), c.fd(), a.fd()]);
    }

    #[test]
    fn fifo_within_one_priority() {
        let mut clients = VecDeque::new();
        let (a, _ra) = client(2);
        let (b, _rb) = client(2);
        let (c, _rc) = client(2);

        insert_by_priority(&mut clients, a.clone());
        insert_by_priority(&mut clients, b.clone());
        insert_by_priority(&mut clients, c.clone());

        let order: Vec<usize> = clients.iter().map(|conn| conn.fd()).collect();
        assert_eq!(order, vec![a.fd(), b.fd(), c.fd()]);
    }

    #[test]
    fn queue_line_diagnostics() {
        let line = QueueLine::new("jobs/run", 4);
        assert_eq!(line.name(), "jobs/run");
        assert_eq!(line.lock().len(), 4);
        assert_eq!(line.last_worker(), 0);

        line.touch_last_worker();
        assert!(line.last_worker() > 0);

        line.set_info("v2 worker fleet");
        assert_eq!(line.info(), "v2 worker fleet");
    }
}
