//! `PartitionOp`: range/hash range-partitions the child's output across
//! `npartitions` contiguous regions, shared by every thread in the group.
//!
//! Two passes per the original: pass one drains the child once per
//! thread, keeping the returned pages (no copy needed -- pages are cheap
//! to hold onto) while building a local per-partition histogram. After a
//! barrier, the group leader turns the per-thread histograms into a
//! prefix sum -- each thread's per-partition output region -- and
//! allocates one contiguous page per partition sized to its total. A
//! second barrier releases those offsets; pass two re-walks the same
//! staged pages, writing each tuple straight into its assigned slot.

use super::{Children, GetNextResult, IndexData, Operator, PerThread, ResultCode, ThreadId};
use crate::concurrent::Barrier;
use crate::hashtable::TupleHasher;
use crate::memory::{NumaAllocator, Page};
use crate::schema::Schema;
use parking_lot::Mutex;
use std::sync::Arc;

struct EmitState {
    out: Page,
    partition: usize,
    pos: usize,
}

pub struct PartitionOp {
    child: Arc<dyn Operator>,
    partition_fn: TupleHasher,
    npartitions: usize,
    group_size: usize,
    histograms: PerThread<Vec<usize>>,
    offsets: PerThread<Vec<usize>>,
    staging: PerThread<Vec<Page>>,
    write_cursor: PerThread<Vec<usize>>,
    output_pages: Mutex<Vec<Page>>,
    hist_barrier: Barrier,
    alloc_barrier: Barrier,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    emit: PerThread<EmitState>,
}

impl PartitionOp {
    pub fn new(
        child: Arc<dyn Operator>,
        partition_fn: TupleHasher,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        group_size: usize,
    ) -> Self {
        let npartitions = partition_fn.buckets();
        let tuple_size = child.out_schema().tuple_size();
        Self {
            histograms: PerThread::new(group_size, |_| vec![0usize; npartitions]),
            offsets: PerThread::new(group_size, |_| vec![0usize; npartitions]),
            staging: PerThread::new(group_size, |_| Vec::new()),
            write_cursor: PerThread::new(group_size, |_| vec![0usize; npartitions]),
            output_pages: Mutex::new(Vec::new()),
            hist_barrier: Barrier::new(group_size),
            alloc_barrier: Barrier::new(group_size),
            emit: PerThread::new(group_size, move |tid| EmitState {
                out: Page::new_local(Arc::new(NumaAllocator::new()), 0, tuple_size.max(1), *b"PRTo"),
                partition: tid,
                pos: 0,
            }),
            child,
            partition_fn,
            npartitions,
            group_size,
            buffsize,
            allocator,
        }
    }
}

impl Operator for PartitionOp {
    fn out_schema(&self) -> &Schema {
        self.child.out_schema()
    }

    fn children(&self) -> Children<'_> {
        Children::Single(&self.child)
    }

    fn thread_init(&self, tid: ThreadId) {
        let mut st = self.emit.get(tid);
        st.out = Page::new_local(Arc::clone(&self.allocator), self.buffsize, self.child.out_schema().tuple_size(), *b"PRTo");
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        let code = self.child.scan_start(tid, index_data);
        if code.is_error() {
            return ResultCode::Error;
        }

        // Pass 1: drain the child once, keeping every page and tallying
        // each tuple's destination partition.
        {
            let mut staging = self.staging.get(tid);
            let mut hist = self.histograms.get(tid);
            loop {
                let result = self.child.get_next(tid);
                let has_data = result.page.tuple_count() > 0;
                if has_data {
                    for tup in result.page.create_iterator() {
                        let p = unsafe { self.partition_fn.hash(tup) };
                        hist[p] += 1;
                    }
                    staging.push(result.page);
                }
                if result.code != ResultCode::Ready {
                    if result.code == ResultCode::Error {
                        return ResultCode::Error;
                    }
                    break;
                }
            }
        }
        self.child.scan_stop(tid);
        self.hist_barrier.arrive_and_wait();

        if tid == 0 {
            let tuple_size = self.child.out_schema().tuple_size();
            let mut totals = vec![0usize; self.npartitions];
            let mut running = vec![0usize; self.npartitions];
            for t in 0..self.group_size {
                let hist = self.histograms.get(t);
                let mut off = self.offsets.get(t);
                for p in 0..self.npartitions {
                    off[p] = running[p];
                    running[p] += hist[p];
                    totals[p] += hist[p];
                }
            }
            let pages = totals
                .iter()
                .map(|&total| {
                    let page = Page::new_local(Arc::clone(&self.allocator), total * tuple_size, tuple_size, *b"PRTd");
                    if total > 0 {
                        page.allocate(total * tuple_size);
                    }
                    page
                })
                .collect();
            tracing::debug!(partitions = self.npartitions, totals = ?totals, "partition: output regions allocated");
            *self.output_pages.lock() = pages;
        }
        self.alloc_barrier.arrive_and_wait();

        // Pass 2: re-walk the staged pages, writing each tuple into its
        // assigned slot in the shared per-partition output page.
        {
            let output_pages = self.output_pages.lock();
            let mut cursor = self.write_cursor.get(tid);
            {
                let offsets = self.offsets.get(tid);
                cursor.copy_from_slice(&offsets);
            }
            let staging = self.staging.get(tid);
            for page in staging.iter() {
                for tup in page.create_iterator() {
                    let p = unsafe { self.partition_fn.hash(tup) };
                    let slot = output_pages[p].tuple_offset(cursor[p]);
                    unsafe { self.child.out_schema().copy_tuple(slot, tup) };
                    cursor[p] += 1;
                }
            }
        }

        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let mut st = self.emit.get(tid);
        let out = st.out.snapshot();
        out.clear();
        let output_pages = self.output_pages.lock();

        loop {
            if st.partition >= self.npartitions {
                return GetNextResult::finished(out);
            }
            let page = &output_pages[st.partition];
            for tup in page.range_iterator(st.pos, page.tuple_count()) {
                match out.allocate_tuple() {
                    Some(slot) => {
                        unsafe { self.child.out_schema().copy_tuple(slot, tup) };
                        st.pos += 1;
                    }
                    None => return GetNextResult::ready(out),
                }
            }
            st.partition += self.group_size;
            st.pos = 0;
        }
    }

    fn scan_stop(&self, _tid: ThreadId) -> ResultCode {
        ResultCode::Ready
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtable::HashFn;
    use crate::operator::stateless::{IntGeneratorOp, ThreadIdPrepend};
    use crate::schema::{ColumnSpec, ColumnType};

    fn schema_i() -> Schema {
        let mut s = Schema::new();
        s.add(ColumnSpec::new(ColumnType::Integer));
        s
    }

    #[test]
    fn range_partition_preserves_every_row() {
        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let v = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, v.as_ptr());
        });
        let generator: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_i(), 100, 256, Arc::clone(&allocator), gen, 1));
        let tagged: Arc<dyn Operator> = Arc::new(ThreadIdPrepend::new(generator, 256, Arc::clone(&allocator), 1));

        let partition_fn = TupleHasher::new(4, ColumnType::Integer, 4, HashFn::ExactRange { min: 0, max: 99 });
        let part = PartitionOp::new(tagged, partition_fn, 4096, allocator, 1);

        part.thread_init(0);
        assert_eq!(part.scan_start(0, None), ResultCode::Ready);

        let mut seen = vec![];
        loop {
            let result = part.get_next(0);
            for tup in result.page.create_iterator() {
                let mut buf = [0u8; 4];
                unsafe { std::ptr::copy_nonoverlapping(tup.add(4), buf.as_mut_ptr(), 4) };
                seen.push(i32::from_ne_bytes(buf));
            }
            if result.code != ResultCode::Ready {
                break;
            }
        }
        seen.sort();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn hash_modulo_partition_preserves_every_row_in_shuffled_order() {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut values: Vec<i32> = (0..200).collect();
        let mut rng = StdRng::seed_from_u64(7);
        values.shuffle(&mut rng);

        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = {
            let values = values.clone();
            Arc::new(move |i, schema, ptr| unsafe {
                let v = values[i as usize].to_ne_bytes();
                schema.write_data(ptr, 0, v.as_ptr());
            })
        };
        let generator: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_i(), 200, 256, Arc::clone(&allocator), gen, 1));

        let partition_fn = TupleHasher::new(0, ColumnType::Integer, 8, HashFn::Modulo);
        let part = PartitionOp::new(generator, partition_fn, 4096, allocator, 1);

        part.thread_init(0);
        assert_eq!(part.scan_start(0, None), ResultCode::Ready);

        let mut seen = vec![];
        loop {
            let result = part.get_next(0);
            for tup in result.page.create_iterator() {
                let mut buf = [0u8; 4];
                unsafe { std::ptr::copy_nonoverlapping(tup, buf.as_mut_ptr(), 4) };
                seen.push(i32::from_ne_bytes(buf));
            }
            if result.code != ResultCode::Ready {
                break;
            }
        }
        seen.sort();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }
}
