//! Handle tables: stable references into relocatable storage.
//!
//! A [`Handle`] names a slot by index plus a generation stamp. The table's
//! backing `Vec` may grow, shrink or be compacted, moving every object in
//! memory, but the handle value never changes. A freed slot gets a fresh
//! generation on reuse, so a stale handle fails to resolve instead of
//! aliasing the new occupant.
//!
//! Tables live inside the graph guarded by the global critical section, so a
//! handle can only be resolved by code holding that lock.

use crate::GuiError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Which table a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    Window,
    Resource,
    Controls,
    Pixmap,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Window => "window",
            HandleKind::Resource => "resource",
            HandleKind::Controls => "control array",
            HandleKind::Pixmap => "pixmap",
        };
        f.write_str(name)
    }
}

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Packed value, for logs and for payloads crossing into the script.
    pub fn raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

impl<T> Serialize for Handle<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.raw())
    }
}

impl<'de, T> Deserialize<'de> for Handle<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self::from_raw)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant,
}

pub struct HandleTable<T> {
    kind: HandleKind,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    limit: usize,
    next_generation: u32,
}

impl<T> HandleTable<T> {
    pub fn new(kind: HandleKind, limit: usize) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            limit,
            next_generation: 1,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `value` and hand back its handle. Exhaustion, either of the
    /// configured limit or of memory, is reported as `OutOfMemory`.
    pub fn allocate(&mut self, value: T) -> Result<Handle<T>, GuiError> {
        if self.live >= self.limit {
            return Err(GuiError::out_of_memory(format!(
                "{} table full ({} live)",
                self.kind, self.live
            )));
        }
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.try_reserve(1).map_err(|e| {
                    GuiError::out_of_memory(format!("{} table: {}", self.kind, e))
                })?;
                self.slots.push(Slot::Vacant);
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[index as usize] = Slot::Occupied { generation, value };
        self.live += 1;
        Ok(Handle::new(index, generation))
    }

    /// Remove and return the object. Resolving the handle afterwards fails.
    pub fn free(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match &*slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }
        let Slot::Occupied { value, .. } = std::mem::replace(slot, Slot::Vacant) else {
            return None;
        };
        self.free.push(handle.index);
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Like [`get`](Self::get) but with the error every command reports for
    /// a dead handle.
    pub fn deref(&self, handle: Handle<T>) -> Result<&T, GuiError> {
        self.get(handle)
            .ok_or_else(|| GuiError::invalid_handle(self.kind, handle.raw()))
    }

    pub fn deref_mut(&mut self, handle: Handle<T>) -> Result<&mut T, GuiError> {
        let kind = self.kind;
        self.get_mut(handle)
            .ok_or_else(|| GuiError::invalid_handle(kind, handle.raw()))
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn handles(&self) -> Vec<Handle<T>> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(Handle::new(i as u32, *generation)),
                Slot::Vacant => None,
            })
            .collect()
    }

    /// Drop trailing vacant slots and release spare capacity. Live objects
    /// may move; their handles stay valid.
    pub fn compact(&mut self) {
        while matches!(self.slots.last(), Some(Slot::Vacant)) {
            self.slots.pop();
        }
        let len = self.slots.len() as u32;
        self.free.retain(|&i| i < len);
        self.slots.shrink_to_fit();
        self.free.shrink_to_fit();
    }
}

impl<T: Default> HandleTable<Vec<T>> {
    /// Grow or shrink the array behind `handle`. The storage may move, so no
    /// reference into the old array survives this call; the handle does.
    pub fn resize(
        &mut self,
        handle: Handle<Vec<T>>,
        new_len: usize,
    ) -> Result<Handle<Vec<T>>, GuiError> {
        let kind = self.kind;
        let array = self.deref_mut(handle)?;
        if new_len > array.len() {
            array
                .try_reserve_exact(new_len - array.len())
                .map_err(|e| GuiError::out_of_memory(format!("{} resize: {}", kind, e)))?;
        }
        array.resize_with(new_len, T::default);
        Ok(handle)
    }
}
