//! Stateless per-tuple operators: generator leaf, filter, project,
//! thread-id tagging, sink, and a passive entropy printer.

use super::{Children, GetNextResult, IndexData, Operator, PerThread, ResultCode, ThreadId};
use crate::memory::{NumaAllocator, Page};
use crate::schema::{Comparator, Schema};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A synthetic zero-input leaf: calls `gen(row_index, schema, tuple_ptr)`
/// to fill each row, round-robining `count` rows across however many
/// threads actually call `scanStart`/`getNext`. No file, mmap or parser
/// involved, so unlike the table loaders this is squarely in scope.
pub struct IntGeneratorOp {
    schema: Schema,
    count: u64,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync>,
    cursor: AtomicU64,
    outputs: PerThread<Option<Page>>,
}

impl IntGeneratorOp {
    pub fn new(
        schema: Schema,
        count: u64,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync>,
        max_threads: usize,
    ) -> Self {
        Self {
            schema,
            count,
            buffsize,
            allocator,
            gen,
            cursor: AtomicU64::new(0),
            outputs: PerThread::new(max_threads, |_| None),
        }
    }
}

impl Operator for IntGeneratorOp {
    fn out_schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Children<'_> {
        Children::Zero
    }

    fn thread_init(&self, tid: ThreadId) {
        let page = Page::new_local(
            Arc::clone(&self.allocator),
            self.buffsize,
            self.schema.tuple_size(),
            *b"GENi",
        );
        *self.outputs.get(tid) = Some(page);
    }

    fn scan_start(&self, _tid: ThreadId, _index_data: Option<&IndexData>) -> ResultCode {
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let guard = self.outputs.get(tid);
        let page = guard.as_ref().expect("thread_init must run before get_next").snapshot();
        drop(guard);
        page.clear();

        loop {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed);
            if i >= self.count {
                return GetNextResult::finished(page);
            }
            let Some(slot) = page.allocate_tuple() else {
                // Rewind: this row belongs to the next page.
                self.cursor.fetch_sub(1, Ordering::Relaxed);
                return GetNextResult::ready(page);
            };
            (self.gen)(i, &self.schema, slot);
        }
    }

    fn scan_stop(&self, _tid: ThreadId) -> ResultCode {
        ResultCode::Ready
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

/// Passes through tuples of `child` for which `field OP value` holds.
pub struct Filter {
    child: Arc<dyn Operator>,
    comparator: Comparator,
    value_buf: Vec<u8>,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    outputs: PerThread<Option<Page>>,
}

impl Filter {
    pub fn new(
        child: Arc<dyn Operator>,
        comparator: Comparator,
        value_buf: Vec<u8>,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        max_threads: usize,
    ) -> Self {
        Self {
            child,
            comparator,
            value_buf,
            buffsize,
            allocator,
            outputs: PerThread::new(max_threads, |_| None),
        }
    }
}

impl Operator for Filter {
    fn out_schema(&self) -> &Schema {
        self.child.out_schema()
    }

    fn children(&self) -> Children<'_> {
        Children::Single(&self.child)
    }

    fn thread_init(&self, tid: ThreadId) {
        let page = Page::new_local(
            Arc::clone(&self.allocator),
            self.buffsize,
            self.child.out_schema().tuple_size(),
            *b"Filt",
        );
        *self.outputs.get(tid) = Some(page);
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        self.child.scan_start(tid, index_data)
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let guard = self.outputs.get(tid);
        let out = guard.as_ref().expect("thread_init must run before get_next").snapshot();
        drop(guard);
        out.clear();

        loop {
            let result = self.child.get_next(tid);
            if result.code == ResultCode::Error {
                return GetNextResult::error(out);
            }

            for tup in result.page.create_iterator() {
                let keep = unsafe { self.comparator.eval(tup, self.value_buf.as_ptr()) };
                if !keep {
                    continue;
                }
                let Some(slot) = out.allocate_tuple() else {
                    // Page is full: the matched tuple is lost if we don't
                    // come back for it, but the protocol never rewinds a
                    // child's page, so size buffsize generously relative
                    // to expected selectivity -- documented limitation.
                    return GetNextResult::ready(out);
                };
                unsafe { self.child.out_schema().copy_tuple(slot, tup) };
            }

            if result.code == ResultCode::Finished {
                return GetNextResult::finished(out);
            }
        }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.child.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

/// Re-projects `child`'s columns through an index list, possibly
/// reordering or dropping columns.
pub struct Project {
    child: Arc<dyn Operator>,
    schema: Schema,
    source_cols: Vec<usize>,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    outputs: PerThread<Option<Page>>,
}

impl Project {
    pub fn new(
        child: Arc<dyn Operator>,
        source_cols: Vec<usize>,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        max_threads: usize,
    ) -> Self {
        let mut schema = Schema::new();
        for &c in &source_cols {
            schema.add(child.out_schema().get(c).clone());
        }
        Self {
            child,
            schema,
            source_cols,
            buffsize,
            allocator,
            outputs: PerThread::new(max_threads, |_| None),
        }
    }
}

impl Operator for Project {
    fn out_schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Children<'_> {
        Children::Single(&self.child)
    }

    fn thread_init(&self, tid: ThreadId) {
        let page = Page::new_local(
            Arc::clone(&self.allocator),
            self.buffsize,
            self.schema.tuple_size(),
            *b"Proj",
        );
        *self.outputs.get(tid) = Some(page);
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        self.child.scan_start(tid, index_data)
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let guard = self.outputs.get(tid);
        let out = guard.as_ref().expect("thread_init must run before get_next").snapshot();
        drop(guard);
        out.clear();

        let result = self.child.get_next(tid);
        if result.code == ResultCode::Error {
            return GetNextResult::error(out);
        }

        for tup in result.page.create_iterator() {
            let Some(slot) = out.allocate_tuple() else { break };
            for (j, &src_col) in self.source_cols.iter().enumerate() {
                unsafe {
                    let src = self.child.out_schema().calc_offset(tup, src_col);
                    self.schema.write_data(slot, j, src);
                }
            }
        }

        GetNextResult { code: result.code, page: out }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.child.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

/// Prepends the calling thread's id as a leading `Integer` column.
pub struct ThreadIdPrepend {
    child: Arc<dyn Operator>,
    schema: Schema,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    outputs: PerThread<Option<Page>>,
}

impl ThreadIdPrepend {
    pub fn new(
        child: Arc<dyn Operator>,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        max_threads: usize,
    ) -> Self {
        let mut schema = Schema::new();
        schema.add(crate::schema::ColumnSpec::new(crate::schema::ColumnType::Integer));
        for i in 0..child.out_schema().columns() {
            schema.add(child.out_schema().get(i).clone());
        }
        Self { child, schema, buffsize, allocator, outputs: PerThread::new(max_threads, |_| None) }
    }
}

impl Operator for ThreadIdPrepend {
    fn out_schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Children<'_> {
        Children::Single(&self.child)
    }

    fn thread_init(&self, tid: ThreadId) {
        let page = Page::new_local(
            Arc::clone(&self.allocator),
            self.buffsize,
            self.schema.tuple_size(),
            *b"TIDp",
        );
        *self.outputs.get(tid) = Some(page);
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        self.child.scan_start(tid, index_data)
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let guard = self.outputs.get(tid);
        let out = guard.as_ref().expect("thread_init must run before get_next").snapshot();
        drop(guard);
        out.clear();

        let result = self.child.get_next(tid);
        if result.code == ResultCode::Error {
            return GetNextResult::error(out);
        }

        let tid_bytes = (tid as i32).to_ne_bytes();
        let child_cols = self.child.out_schema().columns();
        for tup in result.page.create_iterator() {
            let Some(slot) = out.allocate_tuple() else { break };
            unsafe {
                self.schema.write_data(slot, 0, tid_bytes.as_ptr());
                for j in 0..child_cols {
                    let src = self.child.out_schema().calc_offset(tup, j);
                    self.schema.write_data(slot, j + 1, src);
                }
            }
        }

        GetNextResult { code: result.code, page: out }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.child.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

/// A sink: drains `child` completely, discarding every tuple, and reports
/// an empty page. Useful for isolating upstream throughput in benchmarks.
pub struct Consume {
    child: Arc<dyn Operator>,
    schema: Schema,
    allocator: Arc<NumaAllocator>,
    outputs: PerThread<Option<Page>>,
}

impl Consume {
    pub fn new(child: Arc<dyn Operator>, allocator: Arc<NumaAllocator>, max_threads: usize) -> Self {
        let schema = child.out_schema().clone();
        Self { child, schema, allocator, outputs: PerThread::new(max_threads, |_| None) }
    }
}

impl Operator for Consume {
    fn out_schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Children<'_> {
        Children::Single(&self.child)
    }

    fn thread_init(&self, tid: ThreadId) {
        let page = Page::new_local(Arc::clone(&self.allocator), 0, self.schema.tuple_size().max(1), *b"Csme");
        *self.outputs.get(tid) = Some(page);
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        self.child.scan_start(tid, index_data)
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let guard = self.outputs.get(tid);
        let out = guard.as_ref().expect("thread_init must run before get_next").snapshot();
        drop(guard);

        loop {
            let result = self.child.get_next(tid);
            match result.code {
                ResultCode::Ready => continue,
                ResultCode::Finished => return GetNextResult::finished(out),
                ResultCode::Error => return GetNextResult::error(out),
            }
        }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.child.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

/// Passive pass-through that logs the Shannon entropy (bits/tuple) of one
/// column's byte distribution; never changes the stream.
pub struct BitEntropyPrinter {
    child: Arc<dyn Operator>,
    field: usize,
    counts: PerThread<[u64; 256]>,
}

impl BitEntropyPrinter {
    pub fn new(child: Arc<dyn Operator>, field: usize, max_threads: usize) -> Self {
        Self { child, field, counts: PerThread::new(max_threads, |_| [0u64; 256]) }
    }

    pub fn entropy_bits(&self, tid: ThreadId) -> f64 {
        let counts = self.counts.get(tid);
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0.0;
        }
        counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / total as f64;
                -p * p.log2()
            })
            .sum()
    }
}

impl Operator for BitEntropyPrinter {
    fn out_schema(&self) -> &Schema {
        self.child.out_schema()
    }

    fn children(&self) -> Children<'_> {
        Children::Single(&self.child)
    }

    fn thread_init(&self, _tid: ThreadId) {}

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        self.child.scan_start(tid, index_data)
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let result = self.child.get_next(tid);
        let width = self.child.out_schema().column_width(self.field) as usize;
        let offset = self.child.out_schema().offset(self.field);
        let mut counts = self.counts.get(tid);
        for tup in result.page.create_iterator() {
            unsafe {
                let bytes = std::slice::from_raw_parts(tup.add(offset), width);
                for &b in bytes {
                    counts[b as usize] += 1;
                }
            }
        }
        drop(counts);
        result
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.child.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSpec, ColumnType, CompareOp};

    fn schema_ii() -> Schema {
        let mut s = Schema::new();
        s.add(ColumnSpec::new(ColumnType::Integer));
        s.add(ColumnSpec::new(ColumnType::Integer));
        s
    }

    fn collect_all(op: &Arc<dyn Operator>, tid: ThreadId) -> Vec<i32> {
        op.thread_init(tid);
        assert_eq!(op.scan_start(tid, None), ResultCode::Ready);
        let mut values = vec![];
        loop {
            let result = op.get_next(tid);
            for tup in result.page.create_iterator() {
                let mut buf = [0u8; 4];
                unsafe { std::ptr::copy_nonoverlapping(tup, buf.as_mut_ptr(), 4) };
                values.push(i32::from_ne_bytes(buf));
            }
            if result.code != ResultCode::Ready {
                break;
            }
        }
        op.scan_stop(tid);
        op.thread_close(tid);
        values
    }

    #[test]
    fn filter_scan_keeps_only_matching_rows() {
        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let v = (i as i32 + 1).to_ne_bytes();
            schema.write_data(ptr, 0, v.as_ptr());
            schema.write_data(ptr, 1, v.as_ptr());
        });
        let generator: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 20, 4096, Arc::clone(&allocator), gen, 1));

        let value = 10i32.to_ne_bytes().to_vec();
        let comparator = generator.out_schema().create_comparator(0, &schema_ii(), 0, CompareOp::Lt).unwrap();
        let filter: Arc<dyn Operator> =
            Arc::new(Filter::new(generator, comparator, value, 4096, allocator, 1));

        let values = collect_all(&filter, 0);
        assert_eq!(values.len(), 9);
        assert_eq!(values, (1..10).collect::<Vec<_>>());
    }

    #[test]
    fn thread_id_prepend_tags_every_row() {
        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let v = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, v.as_ptr());
            schema.write_data(ptr, 1, v.as_ptr());
        });
        let generator: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 5, 4096, Arc::clone(&allocator), gen, 1));
        let tagged: Arc<dyn Operator> = Arc::new(ThreadIdPrepend::new(generator, 4096, allocator, 1));

        tagged.thread_init(0);
        tagged.scan_start(0, None);
        let result = tagged.get_next(0);
        let first = result.page.create_iterator().next().unwrap();
        let mut buf = [0u8; 4];
        unsafe { std::ptr::copy_nonoverlapping(first, buf.as_mut_ptr(), 4) };
        assert_eq!(i32::from_ne_bytes(buf), 0);
    }
}
