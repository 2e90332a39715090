use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generates response ids for clients that did not provide one.
///
/// Ids only have to be unique while a request is in flight; starting the
/// sequence at a random point keeps a restarted broker from handing out
/// ids that long-polling workers may still hold from a previous run.
#[derive(Debug)]
pub struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        let start = rand::thread_rng().gen::<u64>();
        Self {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("g{:016x}", seq)
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let gen = IdGen::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with('g'));
    }
}
