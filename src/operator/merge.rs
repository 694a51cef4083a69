//! `MergeOp`: the fan-in/thread-count-changing operator. Spawns its own
//! internal worker threads to drive the child subtree (each with its own,
//! merge-local thread id), and serves pages to its caller(s) round-robin
//! across those workers' mailboxes.
//!
//! Thread-id scopes are isolated at this boundary: the tree walkers never
//! recurse across a `MergeOp` (`children()` reports [`Children::Zero`]),
//! so the ids a parent plan drives `thread_init`/`thread_close` with never
//! collide with the internal worker ids below. `MergeOp` threads the child
//! subtree's lifecycle through itself instead: workers run
//! `thread_init_tree`/`scan_start`/`get_next`/`scan_stop`/`thread_close_tree`
//! on `child`, and `destroy` walks it once all workers have stopped.

use super::{
    destroy_tree, thread_close_tree, thread_init_tree, Children, GetNextResult, IndexData,
    Operator, PerThread, ResultCode, ThreadId,
};
use crate::memory::Page;
use crate::schema::Schema;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

enum SlotState {
    Empty,
    Full(ResultCode, Page),
}

struct Slot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

struct MergeInner {
    child: Arc<dyn Operator>,
    nthreads: usize,
    stack_size: usize,
    slots: Vec<Slot>,
    worker_done: Vec<AtomicBool>,
    spawned: AtomicBool,
    running: Mutex<bool>,
    running_cv: Condvar,
    stopping: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    empty_page: Page,
}

pub struct MergeOp {
    inner: Arc<MergeInner>,
    schema: Schema,
    rr: PerThread<usize>,
}

impl MergeOp {
    /// `max_consumers` bounds the number of distinct external thread ids
    /// that will call `get_next` on this merge (usually 1).
    pub fn new(child: Arc<dyn Operator>, nthreads: usize, stack_size: usize, max_consumers: usize) -> Self {
        assert!(nthreads > 0, "merge requires at least one worker");
        let schema = child.out_schema().clone();
        let empty_page = Page::new(
            Arc::new(crate::memory::NumaAllocator::new()),
            0,
            schema.tuple_size().max(1),
            *b"Mrge",
            0,
        );
        let slots = (0..nthreads).map(|_| Slot { state: Mutex::new(SlotState::Empty), cv: Condvar::new() }).collect();
        let worker_done = (0..nthreads).map(|_| AtomicBool::new(false)).collect();
        let inner = Arc::new(MergeInner {
            child,
            nthreads,
            stack_size,
            slots,
            worker_done,
            spawned: AtomicBool::new(false),
            running: Mutex::new(false),
            running_cv: Condvar::new(),
            stopping: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            empty_page,
        });
        Self { inner, schema, rr: PerThread::new(max_consumers, |_| 0usize) }
    }
}

fn deposit(slot: &Slot, code: ResultCode, page: Page, stopping: &AtomicBool) -> bool {
    let mut state = slot.state.lock();
    loop {
        if stopping.load(Ordering::Acquire) {
            return true;
        }
        match &*state {
            SlotState::Empty => break,
            SlotState::Full(..) => slot.cv.wait(&mut state),
        }
    }
    *state = SlotState::Full(code, page);
    slot.cv.notify_all();
    false
}

fn worker_loop(inner: Arc<MergeInner>, tid: ThreadId) {
    thread_init_tree(&inner.child, tid);

    {
        let mut running = inner.running.lock();
        while !*running {
            inner.running_cv.wait(&mut running);
        }
    }

    let code = inner.child.scan_start(tid, None);
    if code.is_error() {
        deposit(&inner.slots[tid], ResultCode::Error, inner.empty_page.snapshot(), &inner.stopping);
    } else {
        loop {
            let result = inner.child.get_next(tid);
            let code = result.code;
            let stop = deposit(&inner.slots[tid], code, result.page, &inner.stopping);
            if stop || code != ResultCode::Ready {
                break;
            }
        }
    }

    inner.child.scan_stop(tid);
    thread_close_tree(&inner.child, tid);
}

impl Operator for MergeOp {
    fn out_schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Children<'_> {
        Children::Zero
    }

    fn thread_init(&self, _tid: ThreadId) {
        if self.inner.spawned.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(workers = self.inner.nthreads, stack_size = self.inner.stack_size, "merge: spawning workers");
        let mut workers = self.inner.workers.lock();
        for wtid in 0..self.inner.nthreads {
            let inner = Arc::clone(&self.inner);
            let handle = std::thread::Builder::new()
                .name(format!("merge-worker-{wtid}"))
                .stack_size(self.inner.stack_size)
                .spawn(move || worker_loop(inner, wtid))
                .expect("spawn merge worker thread");
            workers.push(handle);
        }
    }

    fn scan_start(&self, _tid: ThreadId, _index_data: Option<&IndexData>) -> ResultCode {
        *self.inner.running.lock() = true;
        self.inner.running_cv.notify_all();
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let n = self.inner.nthreads;
        let mut pos = *self.rr.get(tid);
        for _ in 0..n {
            let i = pos % n;
            pos += 1;
            if self.inner.worker_done[i].load(Ordering::Acquire) {
                continue;
            }
            let mut state = self.inner.slots[i].state.lock();
            loop {
                match &*state {
                    SlotState::Full(..) => break,
                    SlotState::Empty => self.inner.slots[i].cv.wait(&mut state),
                }
            }
            let SlotState::Full(code, page) = std::mem::replace(&mut *state, SlotState::Empty) else {
                unreachable!()
            };
            drop(state);
            self.inner.slots[i].cv.notify_all();
            *self.rr.get(tid) = pos;

            if code != ResultCode::Ready {
                self.inner.worker_done[i].store(true, Ordering::Release);
            }
            let overall = if code == ResultCode::Error {
                ResultCode::Error
            } else if self.inner.worker_done.iter().all(|d| d.load(Ordering::Acquire)) {
                ResultCode::Finished
            } else {
                ResultCode::Ready
            };
            return GetNextResult { code: overall, page };
        }
        GetNextResult::finished(self.inner.empty_page.snapshot())
    }

    fn scan_stop(&self, _tid: ThreadId) -> ResultCode {
        self.inner.stopping.store(true, Ordering::Release);
        for slot in &self.inner.slots {
            let _guard = slot.state.lock();
            slot.cv.notify_all();
        }
        ResultCode::Ready
    }

    fn thread_close(&self, _tid: ThreadId) {
        let handles = std::mem::take(&mut *self.inner.workers.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn destroy(&self) {
        destroy_tree(&self.inner.child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::NumaAllocator;
    use crate::operator::stateless::IntGeneratorOp;
    use crate::schema::{ColumnSpec, ColumnType};

    fn schema_i() -> Schema {
        let mut s = Schema::new();
        s.add(ColumnSpec::new(ColumnType::Integer));
        s
    }

    #[test]
    fn merge_delivers_every_row_produced_by_workers() {
        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let v = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, v.as_ptr());
        });
        let nthreads = 4;
        let generator: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_i(), 1000, 256, allocator, gen, nthreads));
        let merge = MergeOp::new(generator, nthreads, 1 << 20, 1);

        merge.thread_init(0);
        assert_eq!(merge.scan_start(0, None), ResultCode::Ready);

        let mut total = 0usize;
        loop {
            let result = merge.get_next(0);
            total += result.page.tuple_count();
            if result.code != ResultCode::Ready {
                assert_eq!(result.code, ResultCode::Finished);
                break;
            }
        }
        assert_eq!(total, 1000);

        merge.scan_stop(0);
        merge.thread_close(0);
        merge.destroy();
    }
}
