use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Generational slot handle. The generation is never zero, so a packed
/// handle of 0 can mean "none" wherever handles live in atomics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Handle {
    pub idx: u32,
    pub gen: u32,
}

impl Handle {
    pub fn pack(self) -> u64 {
        (self.idx as u64) << 32 | self.gen as u64
    }

    pub fn unpack(bits: u64) -> Option<Handle> {
        if bits == 0 {
            None
        } else {
            Some(Handle { idx: (bits >> 32) as u32, gen: bits as u32 })
        }
    }
}

struct Slot<T> {
    gen: u32,
    item: Option<Arc<T>>,
}

/// Slotted arena with generation checks. Stale handles resolve to `None`
/// instead of aliasing whatever reused the slot. Lookups hand out `Arc`
/// clones so callers never hold the table lock across their own work.
pub(crate) struct Arena<T> {
    slots: RwLock<Vec<Slot<T>>>,
    free: Mutex<Vec<u32>>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena { slots: RwLock::new(Vec::new()), free: Mutex::new(Vec::new()) }
    }

    pub fn insert(&self, item: T) -> Handle {
        let item = Arc::new(item);
        let reused = self.free.lock().pop();
        let mut slots = self.slots.write();
        match reused {
            Some(idx) => {
                let slot = &mut slots[idx as usize];
                slot.gen = slot.gen.wrapping_add(1).max(1);
                slot.item = Some(item);
                Handle { idx, gen: slot.gen }
            }
            None => {
                let idx = slots.len() as u32;
                slots.push(Slot { gen: 1, item: Some(item) });
                Handle { idx, gen: 1 }
            }
        }
    }

    pub fn get(&self, h: Handle) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let slot = slots.get(h.idx as usize)?;
        if slot.gen != h.gen {
            return None;
        }
        slot.item.clone()
    }

    pub fn remove(&self, h: Handle) -> Option<Arc<T>> {
        let item = {
            let mut slots = self.slots.write();
            let slot = slots.get_mut(h.idx as usize)?;
            if slot.gen != h.gen {
                return None;
            }
            slot.item.take()?
        };
        self.free.lock().push(h.idx);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_resolves_to_none() {
        let arena: Arena<u32> = Arena::new();
        let a = arena.insert(7);
        assert_eq!(*arena.get(a).unwrap(), 7);

        arena.remove(a).unwrap();
        assert!(arena.get(a).is_none());

        // The slot is reused under a new generation.
        let b = arena.insert(8);
        assert_eq!(b.idx, a.idx);
        assert_ne!(b.gen, a.gen);
        assert!(arena.get(a).is_none());
        assert_eq!(*arena.get(b).unwrap(), 8);
    }

    #[test]
    fn pack_round_trip() {
        let h = Handle { idx: 3, gen: 9 };
        assert_eq!(Handle::unpack(h.pack()), Some(h));
        assert_eq!(Handle::unpack(0), None);
    }

    #[test]
    fn remove_twice_is_none() {
        let arena: Arena<u32> = Arena::new();
        let a = arena.insert(1);
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
    }
}
