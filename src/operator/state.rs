//! Fixed-size, cache-line-padded per-thread state table.
//!
//! The protocol guarantees a given `tid` is only ever driven by one
//! thread at a time, so each slot only needs interior mutability, not
//! cross-thread synchronization. A `parking_lot::Mutex` per slot gives us
//! that safely without `unsafe`; contention never happens in practice
//! since no other thread ever touches a slot it doesn't own.

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

/// A table of `T`, one slot per thread id, sized once at `init` time.
pub struct PerThread<T> {
    slots: Vec<CachePadded<Mutex<T>>>,
}

impl<T> PerThread<T> {
    pub fn new(n: usize, mut make: impl FnMut(usize) -> T) -> Self {
        let slots = (0..n).map(|tid| CachePadded::new(Mutex::new(make(tid)))).collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, tid: usize) -> MutexGuard<'_, T> {
        self.slots[tid].lock()
    }
}
