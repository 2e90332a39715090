use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicPtr, Ordering};

// Child slots cover the printable range: byte 32 maps to slot 0.
const ALPHABET: usize = 96;

// Capacity policy: start tiny, double while small, then grow linearly.
const INITIAL_CAP: usize = 4;
const DOUBLE_UNTIL: usize = 512;
const GROW_BY: usize = 256;

/// One trie node. `end` is the id assigned when a name terminates exactly
/// at this node; `wild` is the id assigned when a `*` terminated here and
/// acts as the default for every descendant.
#[derive(Clone, Copy)]
struct Step {
    end: u16,
    wild: u16,
    next: [u16; ALPHABET],
}

impl Step {
    const EMPTY: Step = Step {
        end: 0,
        wild: 0,
        next: [0; ALPHABET],
    };
}

// The buffer readers walk. Node ids count from 1; node `n` lives at
// `steps[n - 1]` and node 1 is the root.
struct Snapshot {
    steps: Vec<Step>,
}

struct Writer {
    cap: usize,
    // Old snapshots are parked here instead of being freed, so a reader
    // that loaded the previous pointer can finish its walk. They are
    // released when the trie itself is dropped.
    retired: Vec<Box<Snapshot>>,
}

/// A name was offered with a byte outside the printable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalName;

impl fmt::Display for IllegalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name contains a byte outside the printable range")
    }
}

impl std::error::Error for IllegalName {}

/// Read-mostly map from capability names to dense non-zero u16 ids.
///
/// Names may end with `*`, which makes the id the default for every name
/// below that prefix. One writer at a time mutates a shadow copy of the
/// node buffer and publishes it with a single pointer swap; readers load
/// the pointer once and walk that snapshot without taking any lock.
pub struct NameTrie {
    published: AtomicPtr<Snapshot>,
    writer: Mutex<Writer>,
}

// SAFETY: the raw pointer always refers to a heap snapshot owned either
// by `published` or by the writer's retired list, and snapshots are only
// freed in `drop`, which requires exclusive access.
unsafe impl Send for NameTrie {}
unsafe impl Sync for NameTrie {}

impl NameTrie {
    pub fn new() -> Self {
        let root = Box::new(Snapshot {
            steps: vec![Step::EMPTY],
        });
        Self {
            published: AtomicPtr::new(Box::into_raw(root)),
            writer: Mutex::new(Writer {
                cap: INITIAL_CAP,
                retired: Vec::new(),
            }),
        }
    }

    /// Registers `name -> value`. `value` must be a non-zero id assigned
    /// by the caller. A trailing `*` registers the value as the wildcard
    /// default for the whole prefix.
    pub fn add(&self, name: &[u8], value: u16) -> Result<(), IllegalName> {
        let mut writer = self.writer.lock();

        // build the shadow buffer; readers keep walking the old snapshot
        // until the swap below
        let current = unsafe { &*self.published.load(Ordering::Acquire) };
        let mut steps = Vec::with_capacity(writer.cap.max(current.steps.len()));
        steps.extend_from_slice(&current.steps);

        let mut nstep = 1usize;
        let mut i = 0;
        loop {
            if i >= name.len() {
                steps[nstep - 1].end = value;
                break;
            }
            let c = name[i];
            if c == b'*' {
                steps[nstep - 1].wild = value;
                break;
            }
            if c < 32 || c >= 128 {
                return Err(IllegalName);
            }
            let slot = (c - 32) as usize;
            let mut next = steps[nstep - 1].next[slot] as usize;
            if next == 0 {
                next = Self::alloc(&mut steps, &mut writer.cap);
                steps[nstep - 1].next[slot] = next as u16;
            }
            nstep = next;
            i += 1;
        }

        let fresh = Box::into_raw(Box::new(Snapshot { steps }));
        let old = self.published.swap(fresh, Ordering::AcqRel);
        // SAFETY: `old` came out of `published`, which always holds a
        // pointer produced by `Box::into_raw`.
        writer.retired.push(unsafe { Box::from_raw(old) });
        Ok(())
    }

    fn alloc(steps: &mut Vec<Step>, cap: &mut usize) -> usize {
        if steps.len() >= *cap {
            *cap = if *cap >= DOUBLE_UNTIL {
                *cap + GROW_BY
            } else {
                *cap * 2
            };
        }
        steps.push(Step::EMPTY);
        steps.len()
    }

    /// Looks `name` up. Exact matches win; otherwise the id of the most
    /// specific wildcard ancestor is returned, or 0 when nothing matches.
    /// A byte outside the printable range ends the walk at the wildcard
    /// seen so far.
    pub fn find(&self, name: &[u8]) -> u16 {
        // SAFETY: snapshots stay alive until `drop`, so the loaded
        // pointer is valid for the whole walk.
        let snapshot = unsafe { &*self.published.load(Ordering::Acquire) };
        let mut wild = 0;
        let mut step = &snapshot.steps[0];
        let mut i = 0;
        loop {
            if step.wild != 0 {
                wild = step.wild;
            }
            if i >= name.len() {
                return if step.end != 0 { step.end } else { wild };
            }
            let c = name[i];
            if c < 32 || c >= 128 {
                return wild;
            }
            let next = step.next[(c - 32) as usize];
            if next == 0 {
                return wild;
            }
            step = &snapshot.steps[(next - 1) as usize];
            i += 1;
        }
    }
}

impl Default for NameTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NameTrie {
    fn drop(&mut self) {
        let published = *self.published.get_mut();
        // SAFETY: exclusive access; nothing can load the pointer anymore.
        drop(unsafe { Box::from_raw(published) });
        // retired snapshots drop with the writer state
    }
}

impl fmt::Debug for NameTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameTrie").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashMap;
    use quickcheck_macros::quickcheck;
    use std::sync::Arc;

    #[test]
    fn exact_match() {
        let trie = NameTrie::new();
        trie.add(b"test/command", 1).unwrap();
        assert_eq!(trie.find(b"test/command"), 1);
        assert_eq!(trie.find(b"test/comman"), 0);
        assert_eq!(trie.find(b"test/commands"), 0);
        assert_eq!(trie.find(b""), 0);
    }

    #[test]
    fn wildcard_prefix() {
        let trie = NameTrie::new();
        trie.add(b"math/*", 7).unwrap();
        assert_eq!(trie.find(b"math/add"), 7);
        assert_eq!(trie.find(b"math/sub"), 7);
        assert_eq!(trie.find(b"math/"), 7);
        assert_eq!(trie.find(b"other"), 0);
    }

    #[test]
    fn exact_wins_over_wildcard() {
        let trie = NameTrie::new();
        trie.add(b"math/*", 1).unwrap();
        trie.add(b"math/add", 2).unwrap();
        assert_eq!(trie.find(b"math/add"), 2);
        assert_eq!(trie.find(b"math/sub"), 1);
    }

    #[test]
    fn deeper_wildcard_overrides() {
        let trie = NameTrie::new();
        trie.add(b"a/*", 1).unwrap();
        trie.add(b"a/b/*", 2).unwrap();
        assert_eq!(trie.find(b"a/x"), 1);
        assert_eq!(trie.find(b"a/b/x"), 2);
    }

    #[test]
    fn illegal_bytes() {
        let trie = NameTrie::new();
        assert_eq!(trie.add(b"na\x01me", 1), Err(IllegalName));
        trie.add(b"na*", 2).unwrap();
        // the walk stops at the bad byte and falls back to the wildcard
        assert_eq!(trie.find(b"na\x01me"), 2);
    }

    #[test]
    fn grows_past_every_capacity_step() {
        let trie = NameTrie::new();
        // each name allocates a fresh path, well past the doubling range
        for i in 0..700u16 {
            let name = format!("queue/{}", i);
            trie.add(name.as_bytes(), i + 1).unwrap();
        }
        for i in 0..700u16 {
            let name = format!("queue/{}", i);
            assert_eq!(trie.find(name.as_bytes()), i + 1);
        }
    }

    #[test]
    fn readers_see_published_snapshots() {
        let trie = Arc::new(NameTrie::new());
        trie.add(b"base", 1).unwrap();

        let reader = {
            let trie = trie.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    assert_eq!(trie.find(b"base"), 1);
                }
            })
        };
        for i in 2..200u16 {
            let name = format!("grow/{}", i);
            trie.add(name.as_bytes(), i).unwrap();
        }
        reader.join().unwrap();
        assert_eq!(trie.find(b"grow/100"), 100);
    }

    fn legal(name: &str) -> String {
        name.chars()
            .filter(|c| (*c as u32) >= 32 && (*c as u32) < 128 && *c != '*')
            .collect()
    }

    #[quickcheck]
    fn add_then_find(names: Vec<String>) -> bool {
        let trie = NameTrie::new();
        let mut expected: HashMap<String, u16> = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            let name = legal(name);
            let value = (i % 60_000 + 1) as u16;
            trie.add(name.as_bytes(), value).unwrap();
            expected.insert(name, value);
        }
        expected
            .iter()
            .all(|(name, value)| trie.find(name.as_bytes()) == *value)
    }

    #[quickcheck]
    fn wildcard_covers_descendants(prefix: String, rest: String) -> bool {
        let prefix = legal(&prefix);
        let rest = legal(&rest);
        let trie = NameTrie::new();
        trie.add(format!("{}*", prefix).as_bytes(), 9).unwrap();
        trie.find(format!("{}{}", prefix, rest).as_bytes()) == 9
    }
}
