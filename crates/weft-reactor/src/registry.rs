//! Generation-checked socket map shared by every backend.
//!
//! A free-list slab where each slot carries a generation counter. The
//! generation is bumped whenever a slot is vacated, and handles embed the
//! generation they were issued with, so a handle that outlived its socket
//! resolves to nothing instead of to whatever reused the slot.

use std::sync::{Mutex, MutexGuard, PoisonError};

use weft_types::{EventContext, SocketHandle};

use crate::{Interest, SocketRole};

/// One socket's bookkeeping.
pub(crate) struct Entry<S> {
    pub role: SocketRole,
    pub context: EventContext,
    pub interest: Interest,
    pub socket: S,
}

struct Slot<S> {
    generation: u32,
    entry: Option<Entry<S>>,
}

struct Slots<S> {
    slots: Vec<Slot<S>>,
    free: Vec<u32>,
    live: usize,
}

/// Mutex-protected arena of sockets keyed by [`SocketHandle`].
pub(crate) struct Registry<S> {
    inner: Mutex<Slots<S>>,
}

impl<S> Registry<S> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, role: SocketRole, socket: S) -> SocketHandle {
        let mut inner = self.lock();
        let entry = Entry {
            role,
            context: EventContext::NONE,
            interest: Interest::NONE,
            socket,
        };
        inner.live += 1;

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.entry = Some(entry);
            return SocketHandle::new(index, slot.generation);
        }

        let index = inner.slots.len() as u32;
        // Generation 0 is never issued, so a zeroed handle never resolves.
        inner.slots.push(Slot {
            generation: 1,
            entry: Some(entry),
        });
        SocketHandle::new(index, 1)
    }

    /// Runs `f` on the live entry for `handle`.
    pub(crate) fn with<R>(&self, handle: SocketHandle, f: impl FnOnce(&mut Entry<S>) -> R) -> Option<R> {
        let mut inner = self.lock();
        let slot = inner.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_mut().map(f)
    }

    /// Runs `f` on every live entry, in slot order.
    pub(crate) fn for_each(&self, mut f: impl FnMut(SocketHandle, &mut Entry<S>)) {
        let mut inner = self.lock();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            let handle = SocketHandle::new(index as u32, slot.generation);
            if let Some(entry) = slot.entry.as_mut() {
                f(handle, entry);
            }
        }
    }

    /// Removes the entry and retires the handle.
    pub(crate) fn remove(&self, handle: SocketHandle) -> Option<Entry<S>> {
        let mut inner = self.lock();
        let index = handle.index();
        let slot = inner.slots.get_mut(index as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        inner.free.push(index);
        inner.live -= 1;
        Some(entry)
    }

    pub(crate) fn contains(&self, handle: SocketHandle) -> bool {
        self.with(handle, |_| ()).is_some()
    }

    pub(crate) fn snapshot(&self) -> Vec<(SocketHandle, SocketRole)> {
        let mut handles = Vec::new();
        self.for_each(|handle, entry| handles.push((handle, entry.role)));
        handles
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_handle_never_resolves_after_slot_reuse() {
        let registry = Registry::new();
        let first = registry.insert(SocketRole::Connection, "first");
        assert!(registry.remove(first).is_some());

        let second = registry.insert(SocketRole::Connection, "second");
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);

        assert!(registry.with(first, |e| e.socket).is_none());
        assert_eq!(registry.with(second, |e| e.socket), Some("second"));
        assert!(registry.remove(first).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let handle = registry.insert(SocketRole::Listener, 1u8);
        assert!(registry.remove(handle).is_some());
        assert!(registry.remove(handle).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn snapshot_lists_live_entries_with_roles() {
        let registry = Registry::new();
        let listener = registry.insert(SocketRole::Listener, ());
        let conn = registry.insert(SocketRole::Connection, ());
        let gone = registry.insert(SocketRole::Connection, ());
        registry.remove(gone);

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot,
            vec![(listener, SocketRole::Listener), (conn, SocketRole::Connection)]
        );
        assert!(registry.contains(conn));
        assert!(!registry.contains(gone));
    }

    #[test]
    fn new_entries_start_with_no_context_and_no_interest() {
        let registry = Registry::new();
        let handle = registry.insert(SocketRole::Connection, ());
        let (context, interest) = registry.with(handle, |e| (e.context, e.interest)).unwrap();
        assert_eq!(context, EventContext::NONE);
        assert!(interest.is_empty());
    }

    proptest::proptest! {
        /// Any interleaving of inserts and removes leaves every removed
        /// handle dead and every live handle resolving to its own socket.
        #[test]
        fn stale_handles_never_resolve(ops in proptest::collection::vec(proptest::option::of(0usize..8), 1..64)) {
            let registry = Registry::new();
            let mut live: Vec<(SocketHandle, usize)> = Vec::new();
            let mut dead: Vec<SocketHandle> = Vec::new();

            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    Some(pick) if !live.is_empty() => {
                        let (handle, _) = live.swap_remove(pick % live.len());
                        proptest::prop_assert!(registry.remove(handle).is_some());
                        dead.push(handle);
                    }
                    _ => live.push((registry.insert(SocketRole::Connection, n), n)),
                }
            }

            for handle in &dead {
                proptest::prop_assert!(!registry.contains(*handle));
            }
            for (handle, value) in &live {
                proptest::prop_assert_eq!(registry.with(*handle, |e| e.socket), Some(*value));
            }
            proptest::prop_assert_eq!(registry.len(), live.len());
        }
    }
}
