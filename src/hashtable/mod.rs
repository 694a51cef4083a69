//! The hash table shared by hash join and hash aggregation: a fixed-size
//! array of bucket heads, each a singly-linked chain of fixed-capacity
//! pages.

mod hasher;

pub use hasher::{HashFn, TupleHasher};

use crate::memory::{AllocOrigin, AllocPolicy, LinkedTupleBuffer, Page, PageIterator};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::memory::NumaAllocator;

struct BucketHead {
    head: AtomicPtr<LinkedTupleBuffer>,
    /// Guards linking a new page onto the tail; the common-case
    /// tail-bump allocation never takes this.
    link_lock: Mutex<()>,
    spills: AtomicUsize,
}

impl Default for BucketHead {
    fn default() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            link_lock: Mutex::new(()),
            spills: AtomicUsize::new(0),
        }
    }
}

/// Fixed-size array of bucket heads; each bucket is a linked list of
/// equal-size pages. Buckets are never freed until [`HashTable::destroy`];
/// clearing only resets `free` cursors.
pub struct HashTable {
    buckets: Vec<BucketHead>,
    bucket_capacity_bytes: usize,
    tuple_size: usize,
    policy: AllocPolicy,
    allocator: Arc<NumaAllocator>,
    origin: AllocOrigin,
}

impl HashTable {
    pub fn new(
        nbuckets: usize,
        bucket_capacity_bytes: usize,
        tuple_size: usize,
        policy: AllocPolicy,
        allocator: Arc<NumaAllocator>,
        origin: AllocOrigin,
    ) -> Self {
        let mut buckets = Vec::with_capacity(nbuckets);
        buckets.resize_with(nbuckets, BucketHead::default);
        Self { buckets, bucket_capacity_bytes, tuple_size, policy, allocator, origin }
    }

    pub fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    fn new_page(&self, bucket: usize) -> Box<LinkedTupleBuffer> {
        let page = Page::new_for_bucket(
            Arc::clone(&self.allocator),
            self.bucket_capacity_bytes,
            self.tuple_size,
            self.origin,
            &self.policy,
            bucket,
        );
        LinkedTupleBuffer::new(page)
    }

    /// Reset `free` cursors of every page in buckets `[start, nbuckets)`
    /// with the given `step`, leaving the chain structure (and thus the
    /// allocated pages) intact. Called by a thread group after `init` and
    /// again before each new build phase.
    pub fn bucket_clear(&self, start: usize, step: usize) {
        let mut i = start;
        while i < self.buckets.len() {
            let mut node = self.buckets[i].head.load(Ordering::Acquire);
            while !node.is_null() {
                unsafe {
                    (*node).page.clear();
                    node = (*node).next();
                }
            }
            i += step;
        }
    }

    /// Non-atomic allocation: returns a tuple-sized slot in bucket `h`'s
    /// last page, extending the chain if full. For single-producer-per-
    /// bucket callers (e.g. `GenericAggregate` in `ThreadLocal` mode).
    pub fn allocate(&self, h: usize) -> *mut u8 {
        self.allocate_impl(h, false)
    }

    /// Atomic allocation: safe under concurrent inserts to the same
    /// bucket from multiple threads. The tail-page bump is always a
    /// lock-free `fetch_add`-style CAS; only linking a new page takes the
    /// bucket's short critical section.
    pub fn atomic_allocate(&self, h: usize) -> *mut u8 {
        self.allocate_impl(h, true)
    }

    fn allocate_impl(&self, h: usize, atomic: bool) -> *mut u8 {
        let bucket = &self.buckets[h];

        loop {
            let head = bucket.head.load(Ordering::Acquire);
            if head.is_null() {
                // First page in this bucket: take the lock to install it.
                let guard = bucket.link_lock.lock();
                // Re-check: another thread may have installed it while we
                // waited for the lock.
                if bucket.head.load(Ordering::Acquire).is_null() {
                    let node = Box::into_raw(self.new_page(h));
                    bucket.head.store(node, Ordering::Release);
                }
                drop(guard);
                continue;
            }

            let tail = find_tail(head);
            let slot = if atomic {
                unsafe { (*tail).page.atomic_allocate(1) }
            } else {
                unsafe { (*tail).page.allocate_tuple() }
            };
            if let Some(ptr) = slot {
                return ptr;
            }

            // Tail is full: link a new page under the short critical
            // section, then retry the allocation against the new tail.
            let guard = bucket.link_lock.lock();
            let tail_now = find_tail(bucket.head.load(Ordering::Acquire));
            // Another thread may have already linked a page while we
            // waited; only link if `tail_now` is still the page we saw.
            if std::ptr::eq(tail_now, tail) {
                let node = Box::into_raw(self.new_page(h));
                unsafe { (*tail_now).set_next(node) };
                bucket.spills.fetch_add(1, Ordering::Relaxed);
            }
            drop(guard);
        }
    }

    /// Raw head pointer of bucket `h`'s chain, for callers (hash join
    /// probe) that need to walk it with their own resumable cursor instead
    /// of borrowing a [`HashTableIterator`].
    pub fn bucket_head_ptr(&self, h: usize) -> *mut LinkedTupleBuffer {
        self.buckets[h].head.load(Ordering::Acquire)
    }

    pub fn lock_bucket(&self, h: usize) -> parking_lot::MutexGuard<'_, ()> {
        self.buckets[h].link_lock.lock()
    }

    pub fn stat_spills(&self, h: usize) -> usize {
        self.buckets[h].spills.load(Ordering::Relaxed)
    }

    /// Create an unplaced iterator; call [`HashTableIterator::place`] or
    /// construct via [`HashTable::place_iterator`] before using.
    pub fn create_iterator(&self) -> HashTableIterator<'_> {
        HashTableIterator { table: self, bucket: 0, node: std::ptr::null_mut(), page_iter: None }
    }

    pub fn place_iterator(&self, it: &mut HashTableIterator<'_>, bucket: usize) {
        it.bucket = bucket;
        it.node = self.buckets[bucket].head.load(Ordering::Acquire);
        it.page_iter = None;
    }

    /// Free every page in every bucket plus the bucket-head array itself.
    /// Must only be called by the group leader after all group members
    /// have finished reading (arrived at the teardown barrier).
    pub fn destroy(&mut self) {
        for bucket in &self.buckets {
            let mut node = bucket.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
            while !node.is_null() {
                let boxed = unsafe { Box::from_raw(node) };
                node = boxed.next();
                drop(boxed);
            }
        }
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn find_tail(mut node: *mut LinkedTupleBuffer) -> *mut LinkedTupleBuffer {
    debug_assert!(!node.is_null());
    loop {
        let next = unsafe { (*node).next() };
        if next.is_null() {
            return node;
        }
        node = next;
    }
}

/// Traverses buckets `[start, nbuckets)` with stride `step`, scanning
/// each bucket's page chain in tuple order. Construct with
/// [`HashTable::create_iterator`], then [`HashTable::place_iterator`] to
/// seed a single-bucket traversal (hash join probe), or use
/// [`HashTableIterator::next_bucket_range`] to sweep a range (aggregation
/// emit).
pub struct HashTableIterator<'a> {
    table: &'a HashTable,
    bucket: usize,
    node: *mut LinkedTupleBuffer,
    page_iter: Option<PageIterator<'a>>,
}

impl<'a> HashTableIterator<'a> {
    /// Advance to the next tuple in the currently placed bucket, moving
    /// across page boundaries within the chain as needed. Returns `None`
    /// once the bucket's chain is exhausted.
    pub fn next(&mut self) -> Option<*const u8> {
        loop {
            if let Some(iter) = self.page_iter.as_mut() {
                if let Some(tup) = iter.next() {
                    return Some(tup);
                }
            }
            if self.node.is_null() {
                return None;
            }
            let page: &'a Page = unsafe { &(*self.node).page };
            self.page_iter = Some(page.create_iterator());
            self.node = unsafe { (*self.node).next() };
        }
    }

    pub fn reset(&mut self) {
        self.table.place_iterator_raw(self);
    }
}

impl HashTable {
    fn place_iterator_raw(&self, it: &mut HashTableIterator<'_>) {
        it.node = self.buckets[it.bucket].head.load(Ordering::Acquire);
        it.page_iter = None;
    }
}

unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NumaAllocator;

    fn table(nbuckets: usize) -> HashTable {
        HashTable::new(
            nbuckets,
            256,
            8,
            AllocPolicy::Local,
            Arc::new(NumaAllocator::new()),
            *b"TEST",
        )
    }

    #[test]
    fn allocate_extends_chain_when_page_fills() {
        let ht = table(1);
        // bucket_capacity_bytes=256, tuple_size=8 -> 32 tuples per page.
        for i in 0..40 {
            let slot = ht.atomic_allocate(0);
            unsafe { *(slot as *mut i64) = i };
        }
        let mut it = ht.create_iterator();
        ht.place_iterator(&mut it, 0);
        let mut count = 0;
        while it.next().is_some() {
            count += 1;
        }
        assert_eq!(count, 40);
    }

    #[test]
    fn concurrent_atomic_allocate_preserves_all_inserts() {
        let ht = Arc::new(table(1));
        let mut handles = vec![];
        for t in 0..8 {
            let ht = Arc::clone(&ht);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let slot = ht.atomic_allocate(0);
                    unsafe { *(slot as *mut i64) = t * 50 + i };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut it = ht.create_iterator();
        ht.place_iterator(&mut it, 0);
        let mut seen = std::collections::HashSet::new();
        while let Some(tup) = it.next() {
            let v = unsafe { *(tup as *const i64) };
            assert!(seen.insert(v), "duplicate value {v}");
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn bucket_clear_resets_without_freeing_pages() {
        let ht = table(2);
        ht.atomic_allocate(0);
        ht.bucket_clear(0, 1);
        let mut it = ht.create_iterator();
        ht.place_iterator(&mut it, 0);
        assert!(it.next().is_none());
    }
}
