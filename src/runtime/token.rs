//! Handle allocation and readiness token mapping.
//!
//! Every Connection and Acceptor lives in a slab-backed `Registry` owned by
//! the hive. Applications only ever hold generational handles into it, so a
//! handle that outlives its entry is detected instead of aliasing whatever
//! reuses the slot.
//!
//! The mio `Token` for a registered socket is derived from the slot index and
//! the kind of entry; the generation is not part of the token because a
//! socket is always deregistered before its slot is released.

use mio::Token;
use slab::Slab;
use std::fmt;

/// Generational index into a `Registry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u32,
}

impl Handle {
    /// Slot index inside the registry.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Identifies a Connection owned by a hive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) Handle);

/// Identifies an Acceptor owned by a hive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcceptorId(pub(crate) Handle);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}.{}", self.0.index, self.0.generation)
    }
}

impl fmt::Display for AcceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acceptor-{}.{}", self.0.index, self.0.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: T,
}

/// Arena of entries addressed by generational handles.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct Registry<T> {
    slots: Slab<Slot<T>>,
    next_generation: u32,
    capacity: usize,
}

impl<T> Registry<T> {
    /// Create a registry holding at most `capacity` live entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity.min(1024)),
            next_generation: 0,
            capacity,
        }
    }

    /// Insert a new entry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        if self.slots.len() >= self.capacity {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let index = self.slots.insert(Slot { generation, value });
        Some(Handle { index, generation })
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &mut slot.value)
    }

    /// Remove an entry, returning it if the handle was still live.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if self.contains(handle) {
            Some(self.slots.remove(handle.index).value)
        } else {
            None
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Resolve the live handle currently occupying `index`.
    pub fn handle_at(&self, index: usize) -> Option<Handle> {
        self.slots.get(index).map(|slot| Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().map(|(index, slot)| {
            (
                Handle {
                    index,
                    generation: slot.generation,
                },
                &slot.value,
            )
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().map(|(index, slot)| {
            (
                Handle {
                    index,
                    generation: slot.generation,
                },
                &mut slot.value,
            )
        })
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<T> {
        self.slots.drain().map(|slot| slot.value).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

/// What a readiness token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Cross-thread stop notification.
    Waker,
    Acceptor(usize),
    Connection(usize),
}

/// Reserved for the hive's `mio::Waker`.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// High bit marks acceptor slots; connection slots use the index directly.
const ACCEPTOR_TAG: usize = 1 << (usize::BITS - 1);

impl Source {
    pub fn token(self) -> Token {
        match self {
            Source::Waker => WAKER_TOKEN,
            Source::Acceptor(index) => Token(ACCEPTOR_TAG | index),
            Source::Connection(index) => Token(index),
        }
    }

    pub fn from_token(token: Token) -> Self {
        match token {
            WAKER_TOKEN => Source::Waker,
            Token(raw) if raw & ACCEPTOR_TAG != 0 => Source::Acceptor(raw & !ACCEPTOR_TAG),
            Token(raw) => Source::Connection(raw),
        }
    }
}
