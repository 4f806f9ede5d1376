//! Per-plugin reference store.
//!
//! Callables passed across the wire are parked here under short numeric
//! ids so the remote side can invoke them by id. Ids are dense and
//! recycled; a plain entry may be fetched exactly once, a shared entry
//! lives until the provider disposes it explicitly.

use parking_lot::Mutex;

use gantry_core::{Callable, Error, Result};

enum Slot {
    Empty,
    Once(Callable),
    Shared(Callable),
    /// A consumed one-shot entry. Kept as a tombstone so the id is not
    /// handed out again while a caller may still hold cleanup duties for
    /// it; recycled on dispose.
    Used,
}

#[derive(Default)]
struct StoreState {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// Maps short numeric ids to live local callables.
#[derive(Default)]
pub struct ReferenceStore {
    inner: Mutex<StoreState>,
}

impl ReferenceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, slot: Slot) -> u64 {
        let mut state = self.inner.lock();
        match state.free.pop() {
            Some(index) => {
                state.slots[index] = slot;
                index as u64
            }
            None => {
                state.slots.push(slot);
                (state.slots.len() - 1) as u64
            }
        }
    }

    /// Parks a one-shot callback; the id is released when fetched.
    pub fn put(&self, callable: Callable) -> u64 {
        self.insert(Slot::Once(callable))
    }

    /// Parks a long-lived reference; released only by [`dispose`].
    ///
    /// [`dispose`]: ReferenceStore::dispose
    pub fn put_shared(&self, callable: Callable) -> u64 {
        self.insert(Slot::Shared(callable))
    }

    /// Retrieves a callable by id. One-shot entries are consumed; a second
    /// fetch of the same id fails.
    pub fn fetch(&self, id: u64) -> Result<Callable> {
        let mut state = self.inner.lock();
        let index = id as usize;
        match state.slots.get_mut(index) {
            Some(slot @ Slot::Once(_)) => {
                let Slot::Once(callable) = std::mem::replace(slot, Slot::Used) else {
                    unreachable!()
                };
                Ok(callable)
            }
            Some(Slot::Shared(callable)) => Ok(callable.clone()),
            _ => Err(Error::BadRequest(format!(
                "callback can only be called once (id {id})"
            ))),
        }
    }

    /// Releases an entry, recycling its id.
    pub fn dispose(&self, id: u64) -> Result<()> {
        let mut state = self.inner.lock();
        let index = id as usize;
        match state.slots.get_mut(index) {
            Some(slot @ (Slot::Shared(_) | Slot::Once(_) | Slot::Used)) => {
                *slot = Slot::Empty;
                state.free.push(index);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("reference {id}"))),
        }
    }

    /// Drops every entry (used when the owning plugin goes away).
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.slots.clear();
        state.free.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let state = self.inner.lock();
        state
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Once(_) | Slot::Shared(_)))
            .count()
    }

    /// True when no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ReferenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReferenceStore({} live)", self.len())
    }
}
