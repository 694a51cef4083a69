//! `GenericAggregate`: hash-based grouping with pluggable per-column
//! aggregate functions. `remember` hashes the incoming tuple's group key,
//! walks the matching bucket looking for an existing group, and either
//! folds into it or starts a new one -- the same shape as the original's
//! lock-if-global / walk-bucket / fold-or-start sequence.

use super::{Children, GetNextResult, IndexData, Operator, PerThread, ResultCode, ThreadId};
use crate::concurrent::Barrier;
use crate::hashtable::HashTable;
use crate::memory::{AllocPolicy, LinkedTupleBuffer, NumaAllocator, Page};
use crate::schema::{ColumnSpec, ColumnType, ConjunctionEqualsEvaluator, Schema};
use parking_lot::Mutex;
use std::sync::Arc;

/// A running aggregate value, folded over one source column. Every
/// accumulator occupies 8 bytes regardless of the source column's width.
pub trait AggregateFunction: Send + Sync {
    /// # Safety
    /// `acc` must be an 8-byte writable slot; `tup` must have a column of
    /// `src_type` readable at `src_offset`.
    unsafe fn start(&self, acc: *mut u8, tup: *const u8, src_offset: usize, src_type: ColumnType);

    /// # Safety
    /// Same as [`Self::start`].
    unsafe fn fold(&self, acc: *mut u8, tup: *const u8, src_offset: usize, src_type: ColumnType);
}

unsafe fn read_i64_typed(tup: *const u8, offset: usize, ty: ColumnType) -> i64 {
    match ty {
        ColumnType::Integer => {
            let mut buf = [0u8; 4];
            std::ptr::copy_nonoverlapping(tup.add(offset), buf.as_mut_ptr(), 4);
            i32::from_ne_bytes(buf) as i64
        }
        ColumnType::Long | ColumnType::Date | ColumnType::Pointer => {
            let mut buf = [0u8; 8];
            std::ptr::copy_nonoverlapping(tup.add(offset), buf.as_mut_ptr(), 8);
            i64::from_ne_bytes(buf)
        }
        ColumnType::Decimal => {
            let mut buf = [0u8; 8];
            std::ptr::copy_nonoverlapping(tup.add(offset), buf.as_mut_ptr(), 8);
            f64::from_ne_bytes(buf) as i64
        }
        ColumnType::Char(_) => panic!("aggregate over a CHAR column is not supported"),
    }
}

unsafe fn read_acc(acc: *const u8) -> i64 {
    let mut buf = [0u8; 8];
    std::ptr::copy_nonoverlapping(acc, buf.as_mut_ptr(), 8);
    i64::from_ne_bytes(buf)
}

unsafe fn write_acc(acc: *mut u8, v: i64) {
    std::ptr::copy_nonoverlapping(v.to_ne_bytes().as_ptr(), acc, 8);
}

pub struct AggregateSum;

impl AggregateFunction for AggregateSum {
    unsafe fn start(&self, acc: *mut u8, tup: *const u8, src_offset: usize, src_type: ColumnType) {
        write_acc(acc, read_i64_typed(tup, src_offset, src_type));
    }
    unsafe fn fold(&self, acc: *mut u8, tup: *const u8, src_offset: usize, src_type: ColumnType) {
        let v = read_i64_typed(tup, src_offset, src_type);
        write_acc(acc, read_acc(acc) + v);
    }
}

pub struct AggregateCount;

impl AggregateFunction for AggregateCount {
    unsafe fn start(&self, acc: *mut u8, _tup: *const u8, _src_offset: usize, _src_type: ColumnType) {
        write_acc(acc, 1);
    }
    unsafe fn fold(&self, acc: *mut u8, _tup: *const u8, _src_offset: usize, _src_type: ColumnType) {
        write_acc(acc, read_acc(acc) + 1);
    }
}

/// One aggregate column: the function plus its source column in the
/// child's schema.
pub struct AggregateSpec {
    pub func: Box<dyn AggregateFunction>,
    pub src_offset: usize,
    pub src_type: ColumnType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// Every thread owns a private table; no locking. Emits partial
    /// per-thread groups -- pair with a second, `Global`-mode aggregate
    /// behind a `Merge` to combine across threads.
    ThreadLocal,
    /// One shared table; a dedup lock per bucket serializes the
    /// look-up-or-insert sequence (page allocation itself stays lock-free).
    Global,
    /// Folds each input tuple into its group's running aggregate as it
    /// streams through, without ever materializing a full build-side
    /// table. Declared for interface parity; constructing a
    /// `GenericAggregate` with this mode fails with `NotYetImplemented`.
    OnTheFly,
}

struct BucketCursor {
    node: *mut LinkedTupleBuffer,
    pos: usize,
}

impl BucketCursor {
    fn next(&mut self) -> Option<*const u8> {
        unsafe {
            loop {
                if self.node.is_null() {
                    return None;
                }
                let page = &(*self.node).page;
                if self.pos < page.tuple_count() {
                    let tup = page.tuple_offset(self.pos) as *const u8;
                    self.pos += 1;
                    return Some(tup);
                }
                self.node = (*self.node).next();
                self.pos = 0;
            }
        }
    }
}

enum Storage {
    Global { table: HashTable, dedup_locks: Vec<Mutex<()>> },
    ThreadLocal { tables: PerThread<HashTable> },
}

impl Storage {
    fn nbuckets(&self) -> usize {
        match self {
            Storage::Global { table, .. } => table.nbuckets(),
            Storage::ThreadLocal { tables } => tables.get(0).nbuckets(),
        }
    }

    fn bucket_head(&self, tid: ThreadId, bucket: usize) -> *mut LinkedTupleBuffer {
        match self {
            Storage::Global { table, .. } => table.bucket_head_ptr(bucket),
            Storage::ThreadLocal { tables } => tables.get(tid).bucket_head_ptr(bucket),
        }
    }
}

struct EmitState {
    out: Page,
    bucket: usize,
    cursor: Option<BucketCursor>,
}

unsafe impl Send for EmitState {}

pub struct GenericAggregate {
    child: Arc<dyn Operator>,
    group_cols: Vec<usize>,
    key_schema: Schema,
    key_eq: ConjunctionEqualsEvaluator,
    aggs: Vec<AggregateSpec>,
    out_schema: Schema,
    storage: Storage,
    mode: AggregateMode,
    group_size: usize,
    build_barrier: Barrier,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    emit: PerThread<EmitState>,
}

impl GenericAggregate {
    pub fn new(
        child: Arc<dyn Operator>,
        group_cols: Vec<usize>,
        aggs: Vec<AggregateSpec>,
        mode: AggregateMode,
        nbuckets: usize,
        bucket_capacity_bytes: usize,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        group_size: usize,
    ) -> crate::error::Result<Self> {
        if mode == AggregateMode::OnTheFly {
            return Err(crate::error::PythiaError::NotYetImplemented("on-the-fly aggregation"));
        }
        let mut key_schema = Schema::new();
        for &c in &group_cols {
            key_schema.add(child.out_schema().get(c).clone());
        }
        let eq_pairs = group_cols
            .iter()
            .enumerate()
            .map(|(i, &c)| (key_schema.offset(i), child.out_schema().offset(c), child.out_schema().column_type(c)))
            .collect();
        let key_eq = ConjunctionEqualsEvaluator::new(eq_pairs);

        let mut out_schema = key_schema.clone();
        for _ in &aggs {
            out_schema.add(ColumnSpec::new(ColumnType::Long));
        }
        let entry_size = out_schema.tuple_size();

        let make_table = || {
            HashTable::new(nbuckets, bucket_capacity_bytes, entry_size, AllocPolicy::Local, Arc::new(NumaAllocator::new()), *b"Aggr")
        };
        let storage = match mode {
            AggregateMode::Global => Storage::Global {
                table: HashTable::new(nbuckets, bucket_capacity_bytes, entry_size, AllocPolicy::Local, Arc::clone(&allocator), *b"Aggr"),
                dedup_locks: (0..nbuckets).map(|_| Mutex::new(())).collect(),
            },
            AggregateMode::ThreadLocal => {
                Storage::ThreadLocal { tables: PerThread::new(group_size, |_| make_table()) }
            }
            AggregateMode::OnTheFly => unreachable!("rejected above"),
        };

        let emit = PerThread::new(group_size, move |tid| EmitState {
            out: Page::new_local(Arc::new(NumaAllocator::new()), 0, entry_size, *b"Aout"),
            bucket: match mode {
                AggregateMode::Global => tid,
                AggregateMode::ThreadLocal => 0,
                AggregateMode::OnTheFly => unreachable!("rejected above"),
            },
            cursor: None,
        });

        Ok(Self {
            child,
            group_cols,
            key_schema,
            key_eq,
            aggs,
            out_schema,
            storage,
            mode,
            group_size,
            build_barrier: Barrier::new(group_size),
            buffsize,
            allocator,
            emit,
        })
    }

    unsafe fn init_entry(&self, slot: *mut u8, tup: *const u8) {
        for (i, &c) in self.group_cols.iter().enumerate() {
            let src = self.child.out_schema().calc_offset(tup, c);
            self.key_schema.write_data(slot, i, src);
        }
        let key_width = self.key_schema.tuple_size();
        for (j, agg) in self.aggs.iter().enumerate() {
            agg.func.start(slot.add(key_width + j * 8), tup, agg.src_offset, agg.src_type);
        }
    }

    unsafe fn fold_entry(&self, slot: *mut u8, tup: *const u8) {
        let key_width = self.key_schema.tuple_size();
        for (j, agg) in self.aggs.iter().enumerate() {
            agg.func.fold(slot.add(key_width + j * 8), tup, agg.src_offset, agg.src_type);
        }
    }

    fn hash_group_key(&self, tup: *const u8) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for &c in &self.group_cols {
            let width = self.child.out_schema().column_width(c) as usize;
            let off = self.child.out_schema().offset(c);
            let bytes = unsafe { std::slice::from_raw_parts(tup.add(off), width) };
            for &b in bytes {
                h = (h ^ b as u64).wrapping_mul(0x100000001b3);
            }
        }
        (h as usize) % self.storage.nbuckets()
    }

    fn remember(&self, tid: ThreadId, tup: *const u8) {
        let h = self.hash_group_key(tup);
        match &self.storage {
            Storage::Global { table, dedup_locks } => {
                let _guard = dedup_locks[h].lock();
                let mut node = table.bucket_head_ptr(h);
                unsafe {
                    while !node.is_null() {
                        let page = &(*node).page;
                        for i in 0..page.tuple_count() {
                            let entry = page.tuple_offset(i);
                            if self.key_eq.eval(entry, tup) {
                                self.fold_entry(entry, tup);
                                return;
                            }
                        }
                        node = (*node).next();
                    }
                }
                let slot = table.atomic_allocate(h);
                unsafe { self.init_entry(slot, tup) };
            }
            Storage::ThreadLocal { tables } => {
                let table = tables.get(tid);
                let mut node = table.bucket_head_ptr(h);
                unsafe {
                    while !node.is_null() {
                        let page = &(*node).page;
                        for i in 0..page.tuple_count() {
                            let entry = page.tuple_offset(i);
                            if self.key_eq.eval(entry, tup) {
                                self.fold_entry(entry, tup);
                                return;
                            }
                        }
                        node = (*node).next();
                    }
                }
                let slot = table.allocate(h);
                unsafe { self.init_entry(slot, tup) };
            }
        }
    }
}

impl Operator for GenericAggregate {
    fn out_schema(&self) -> &Schema {
        &self.out_schema
    }

    fn children(&self) -> Children<'_> {
        Children::Single(&self.child)
    }

    fn thread_init(&self, tid: ThreadId) {
        let mut st = self.emit.get(tid);
        st.out = Page::new_local(Arc::clone(&self.allocator), self.buffsize, self.out_schema.tuple_size(), *b"Aout");
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        let code = self.child.scan_start(tid, index_data);
        if code.is_error() {
            return ResultCode::Error;
        }
        loop {
            let result = self.child.get_next(tid);
            for tup in result.page.create_iterator() {
                self.remember(tid, tup);
            }
            if result.code != ResultCode::Ready {
                if result.code == ResultCode::Error {
                    return ResultCode::Error;
                }
                break;
            }
        }
        self.child.scan_stop(tid);
        self.build_barrier.arrive_and_wait();
        if tid == 0 {
            tracing::debug!(mode = ?self.mode, groups = self.group_cols.len(), "aggregate: build phase complete");
        }
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let mut st = self.emit.get(tid);
        let out = st.out.snapshot();
        out.clear();
        let nbuckets = self.storage.nbuckets();
        let step = match self.mode {
            AggregateMode::Global => self.group_size,
            AggregateMode::ThreadLocal => 1,
            AggregateMode::OnTheFly => unreachable!("rejected at construction"),
        };

        loop {
            if st.cursor.is_none() {
                if st.bucket >= nbuckets {
                    return GetNextResult::finished(out);
                }
                st.cursor = Some(BucketCursor { node: self.storage.bucket_head(tid, st.bucket), pos: 0 });
            }
            while let Some(entry) = st.cursor.as_mut().unwrap().next() {
                match out.allocate_tuple() {
                    Some(slot) => unsafe { self.out_schema.copy_tuple(slot, entry) },
                    None => return GetNextResult::ready(out),
                }
            }
            st.cursor = None;
            st.bucket += step;
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
    use crate::operator::stateless::IntGeneratorOp;
    use crate::schema::ColumnType;

    fn schema_ii() -> Schema {
        let mut s = Schema::new();
        s.add(ColumnSpec::new(ColumnType::Integer));
        s.add(ColumnSpec::new(ColumnType::Integer));
        s
    }

    #[test]
    fn sums_by_composite_group_key() {
        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32 % 3).to_ne_bytes();
            let val = 1i32.to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, val.as_ptr());
        });
        let child: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 30, 4096, Arc::clone(&allocator), gen, 1));

        let aggs = vec![AggregateSpec { func: Box::new(AggregateSum), src_offset: 4, src_type: ColumnType::Integer }];
        let agg = GenericAggregate::new(child, vec![0], aggs, AggregateMode::Global, 8, 4096, 4096, allocator, 1).unwrap();

        agg.thread_init(0);
        assert_eq!(agg.scan_start(0, None), ResultCode::Ready);

        let mut sums = std::collections::HashMap::new();
        loop {
            let result = agg.get_next(0);
            for tup in result.page.create_iterator() {
                let mut key = [0u8; 4];
                let mut sum = [0u8; 8];
                unsafe {
                    std::ptr::copy_nonoverlapping(tup, key.as_mut_ptr(), 4);
                    std::ptr::copy_nonoverlapping(tup.add(4), sum.as_mut_ptr(), 8);
                }
                sums.insert(i32::from_ne_bytes(key), i64::from_ne_bytes(sum));
            }
            if result.code != ResultCode::Ready {
                break;
            }
        }

        assert_eq!(sums.len(), 3);
        // 30 rows, key = i % 3 -> 10 rows per key, each contributing 1.
        for v in sums.values() {
            assert_eq!(*v, 10);
        }
    }

    #[test]
    fn on_the_fly_mode_is_rejected_at_construction() {
        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|_, schema, ptr| unsafe {
            let zero = 0i32.to_ne_bytes();
            schema.write_data(ptr, 0, zero.as_ptr());
            schema.write_data(ptr, 1, zero.as_ptr());
        });
        let child: Arc<dyn Operator> = Arc::new(IntGeneratorOp::new(schema_ii(), 1, 4096, Arc::clone(&allocator), gen, 1));
        let aggs = vec![AggregateSpec { func: Box::new(AggregateSum), src_offset: 4, src_type: ColumnType::Integer }];

        let err = GenericAggregate::new(child, vec![0], aggs, AggregateMode::OnTheFly, 8, 4096, 4096, allocator, 1)
            .err()
            .expect("OnTheFly must be rejected");
        assert!(matches!(err, crate::error::PythiaError::NotYetImplemented(_)));
    }
}
