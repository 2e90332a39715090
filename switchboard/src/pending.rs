use crate::conn::Connection;
use crate::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Map from response id to the client waiting for that response. An
/// entry owns one clone of the client, dropped when the entry leaves the
/// table. The mutex is the `wait_lock` of the locking order described in
/// `run`.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, Arc<Connection>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn insert(&self, id: String, client: Arc<Connection>) {
        self.entries.lock().insert(id, client);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.entries.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testutil;

    #[test]
    fn insert_contains_remove() {
        let pending = PendingTable::new();
        let (client, _remote) = testutil::connection();

        assert!(!pending.contains("7"));
        pending.insert("7".to_string(), client.clone());
        assert!(pending.contains("7"));
        assert_eq!(pending.len(), 1);

        let popped = pending.remove("7").expect("entry exists");
        assert!(Arc::ptr_eq(&popped, &client));
        assert!(pending.is_empty());
        assert!(pending.remove("7").is_none());
    }
}
