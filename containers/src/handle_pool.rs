use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use derivative::Derivative;

use crate::error::PoolError;

/// Generational handle into a [`HandlePool`].
///
/// `index == -1` is the invalid sentinel. A handle is valid against its pool
/// iff the slot it names is allocated and the slot's generation still matches.
#[derive(Ord, PartialOrd, Derivative)]
#[derivative(Debug)]
pub struct Handle<T> {
    index: i32,
    generation: u32,
    #[derivative(Debug = "ignore")]
    _marker: PhantomData<T>,
}

impl<T> Handle<T> {
    pub const INVALID: Handle<T> = Handle {
        index: -1,
        generation: 0,
        _marker: PhantomData,
    };

    pub fn new(index: i32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_invalid(&self) -> bool {
        self.index == -1
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

unsafe impl<T> Send for Handle<T> {}

unsafe impl<T> Sync for Handle<T> {}

/// A free slot stores the index of the next free slot, the in-place encoding
/// of an intrusive free list.
#[derive(Debug)]
enum Slot<T> {
    Free { next: i32 },
    Occupied(T),
}

impl<T> Slot<T> {
    fn is_occupied(&self) -> bool {
        matches!(self, Slot::Occupied(_))
    }
}

#[derive(Debug)]
struct PoolInner<T> {
    slots: Vec<Slot<T>>,
    generations: Vec<u32>,
    first_free: i32,
    count: u32,
}

/// Fixed-capacity generational pool.
///
/// Acquire and release lock the pool; access goes through the `with` /
/// `with_mut` closure accessors so handles can be shared freely across
/// threads while stale ones fail the validity test instead of aliasing a
/// recycled slot.
#[derive(Debug)]
pub struct HandlePool<T> {
    inner: Arc<RwLock<PoolInner<T>>>,
    capacity: u32,
}

impl<T> Clone for HandlePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> HandlePool<T> {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "handle pool capacity must be nonzero");
        let mut slots = Vec::with_capacity(capacity as usize);
        for slot_index in 0..capacity {
            let next = if slot_index + 1 < capacity {
                (slot_index + 1) as i32
            } else {
                -1
            };
            slots.push(Slot::Free { next });
        }
        Self {
            inner: Arc::new(RwLock::new(PoolInner {
                slots,
                generations: vec![0; capacity as usize],
                first_free: 0,
                count: 0,
            })),
            capacity,
        }
    }

    /// Pop the free list and move `value` into the slot.
    pub fn acquire(&self, value: T) -> Result<Handle<T>, PoolError> {
        let mut inner = self.inner.write()?;
        let index = inner.first_free;
        if index < 0 {
            return Err(PoolError::Exhausted);
        }
        let next = match inner.slots[index as usize] {
            Slot::Free { next } => next,
            Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
        };
        inner.slots[index as usize] = Slot::Occupied(value);
        inner.first_free = next;
        inner.count += 1;
        let generation = inner.generations[index as usize];
        Ok(Handle::new(index, generation))
    }

    /// Push the slot back on the free list, bump its generation and return the
    /// resource. Stale handles fail with [`PoolError::InvalidHandle`].
    pub fn release(&self, handle: Handle<T>) -> Result<T, PoolError> {
        let mut inner = self.inner.write()?;
        if !Self::is_valid_locked(&inner, &handle) {
            return Err(PoolError::InvalidHandle);
        }
        let index = handle.index as usize;
        let next = inner.first_free;
        let previous = std::mem::replace(&mut inner.slots[index], Slot::Free { next });
        inner.first_free = handle.index;
        inner.generations[index] = inner.generations[index].wrapping_add(1);
        inner.count -= 1;
        match previous {
            Slot::Occupied(value) => Ok(value),
            Slot::Free { .. } => unreachable!("validity check admitted a free slot"),
        }
    }

    pub fn is_valid(&self, handle: &Handle<T>) -> bool {
        self.inner
            .read()
            .map(|inner| Self::is_valid_locked(&inner, handle))
            .unwrap_or(false)
    }

    fn is_valid_locked(inner: &PoolInner<T>, handle: &Handle<T>) -> bool {
        handle.index >= 0
            && (handle.index as usize) < inner.slots.len()
            && inner.slots[handle.index as usize].is_occupied()
            && inner.generations[handle.index as usize] == handle.generation
    }

    pub fn with<R, F: FnOnce(&T) -> R>(&self, handle: &Handle<T>, f: F) -> Result<R, PoolError> {
        let inner = self.inner.read()?;
        if !Self::is_valid_locked(&inner, handle) {
            return Err(PoolError::InvalidHandle);
        }
        match &inner.slots[handle.index as usize] {
            Slot::Occupied(value) => Ok(f(value)),
            Slot::Free { .. } => unreachable!(),
        }
    }

    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(
        &self,
        handle: &Handle<T>,
        f: F,
    ) -> Result<R, PoolError> {
        let mut inner = self.inner.write()?;
        if !Self::is_valid_locked(&inner, handle) {
            return Err(PoolError::InvalidHandle);
        }
        match &mut inner.slots[handle.index as usize] {
            Slot::Occupied(value) => Ok(f(value)),
            Slot::Free { .. } => unreachable!(),
        }
    }

    /// Swap the slot's value without releasing the handle. The generation is
    /// untouched, so outstanding handles stay valid.
    pub fn replace(&self, handle: &Handle<T>, value: T) -> Result<T, PoolError> {
        self.with_mut(handle, |slot| std::mem::replace(slot, value))
    }

    /// Snapshot of the live handles, in slot-index order.
    pub fn iter_handles(&self) -> Vec<Handle<T>> {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_occupied())
            .map(|(index, _)| Handle::new(index as i32, inner.generations[index]))
            .collect()
    }

    pub fn len(&self) -> u32 {
        self.inner.read().map(|inner| inner.count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl<T: Clone> HandlePool<T> {
    pub fn get_cloned(&self, handle: &Handle<T>) -> Result<T, PoolError> {
        self.with(handle, |value| value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_valid_handle() {
        let pool = HandlePool::new(4);
        let handle = pool.acquire(7u32).unwrap();
        assert!(pool.is_valid(&handle));
        assert_eq!(pool.get_cloned(&handle).unwrap(), 7);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn release_invalidates_and_bumps_generation() {
        let pool = HandlePool::new(4);
        let handle = pool.acquire(1u32).unwrap();
        assert_eq!(pool.release(handle).unwrap(), 1);
        assert!(!pool.is_valid(&handle));

        // The recycled slot must come back with a newer generation.
        let reused = pool.acquire(2u32).unwrap();
        assert_eq!(reused.index(), handle.index());
        assert!(reused.generation() > handle.generation());
        assert!(!pool.is_valid(&handle));
        assert!(pool.is_valid(&reused));
    }

    #[test]
    fn exhaustion_is_an_error() {
        let pool = HandlePool::new(2);
        let _a = pool.acquire(0u8).unwrap();
        let _b = pool.acquire(1u8).unwrap();
        assert_eq!(pool.acquire(2u8), Err(PoolError::Exhausted));
    }

    #[test]
    fn release_of_stale_handle_fails() {
        let pool = HandlePool::new(2);
        let handle = pool.acquire(0u8).unwrap();
        pool.release(handle).unwrap();
        assert_eq!(pool.release(handle), Err(PoolError::InvalidHandle));
        assert_eq!(pool.release(Handle::INVALID), Err(PoolError::InvalidHandle));
    }

    #[test]
    fn iteration_is_in_index_order() {
        let pool = HandlePool::new(8);
        let a = pool.acquire("a").unwrap();
        let b = pool.acquire("b").unwrap();
        let c = pool.acquire("c").unwrap();
        pool.release(b).unwrap();

        let handles = pool.iter_handles();
        assert_eq!(handles, vec![a, c]);

        // Freed slots are reused head-first, so the next acquire lands in b's
        // slot and iteration order stays index order, not insertion order.
        let d = pool.acquire("d").unwrap();
        assert_eq!(d.index(), b.index());
        assert_eq!(pool.iter_handles(), vec![a, d, c]);
    }

    #[test]
    fn replace_keeps_handle_valid() {
        let pool = HandlePool::new(2);
        let handle = pool.acquire(10u32).unwrap();
        assert_eq!(pool.replace(&handle, 20).unwrap(), 10);
        assert!(pool.is_valid(&handle));
        assert_eq!(pool.get_cloned(&handle).unwrap(), 20);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = HandlePool::new(64);
        let mut threads = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            threads.push(std::thread::spawn(move || {
                for value in 0..1000u32 {
                    let handle = pool.acquire(value).unwrap();
                    assert_eq!(pool.get_cloned(&handle).unwrap(), value);
                    pool.release(handle).unwrap();
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(pool.len(), 0);
    }
}
