//! Registry of live connections.
//!
//! Connections are stored in slots addressed by a [`Key`]. A vacated slot is reused
//! by a later insert with a bumped generation, so a stale key never resolves to the
//! connection that took its place.
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

/// Identifies one entry of a [`Registry`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Key {
    index: usize,
    generation: u64,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}:{})", self.index, self.generation)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { value: T, generation: u64 },
    Vacant { next_free: Option<usize>, generation: u64 },
}

#[derive(Debug)]
pub(crate) struct Registry<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> Key {
        self.len += 1;

        if let Some(index) = self.free_head {
            if let Slot::Vacant {
                next_free,
                generation,
            } = self.slots[index]
            {
                self.free_head = next_free;
                self.slots[index] = Slot::Occupied { value, generation };
                return Key { index, generation };
            }
            unreachable!("free list pointed to an occupied slot");
        }

        let index = self.slots.len();
        self.slots.push(Slot::Occupied {
            value,
            generation: 0,
        });
        Key {
            index,
            generation: 0,
        }
    }

    /// Removes the entry for `key`. Returns `None` if the key is stale.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index)?;
        if !matches!(slot, Slot::Occupied { generation, .. } if *generation == key.generation) {
            return None;
        }

        let vacant = Slot::Vacant {
            next_free: self.free_head,
            generation: key.generation.wrapping_add(1),
        };
        match std::mem::replace(slot, vacant) {
            Slot::Occupied { value, .. } => {
                self.free_head = Some(key.index);
                self.len -= 1;
                Some(value)
            }
            Slot::Vacant { .. } => unreachable!("slot checked to be occupied"),
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: Key) -> Option<&T> {
        match self.slots.get(key.index)? {
            Slot::Occupied { value, generation } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { value, generation } => Some((
                    Key {
                        index,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

/// Keeps a value in a shared [`Registry`] and removes it when dropped.
pub(crate) struct Registration<T> {
    key: Key,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Registration<T> {
    pub fn register(registry: &Arc<Mutex<Registry<T>>>, value: T) -> Self {
        let key = registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value);

        Self {
            key,
            registry: Arc::clone(registry),
        }
    }

    pub const fn key(&self) -> Key {
        self.key
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        let removed = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.key);
        // the value may hold resources whose drop must not run under the lock
        drop(removed);
    }
}

impl<T> fmt::Debug for Registration<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .finish()
    }
}
