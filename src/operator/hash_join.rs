//! `HashJoinOp`: symmetric hash join over a build side and a probe side
//! sharing one thread group. Every thread drains the build side fully,
//! inserting into a shared [`HashTable`], then a group barrier gates the
//! switch to probing so no thread starts looking up matches before every
//! insert from every thread has landed.

use super::{Children, GetNextResult, IndexData, Operator, PerThread, ResultCode, ThreadId};
use crate::concurrent::Barrier;
use crate::hashtable::{HashTable, TupleHasher};
use crate::memory::{LinkedTupleBuffer, NumaAllocator, Page};
use crate::schema::{Comparator, Schema};
use std::sync::Arc;

/// Which side of the join a projected output column comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Build,
    Probe,
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectionEntry {
    pub side: Side,
    pub index: usize,
}

/// A resumable walk over one bucket's chain, independent of `HashTable`'s
/// own borrowed iterator: `HashJoinOp` needs this state to live across
/// `get_next` calls inside a `PerThread` table, which a borrow of `self`
/// cannot do. Sound for the same reason `HashTableIterator` is: bucket
/// pages never move or free until the table itself is torn down.
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

struct ProbeState {
    out: Page,
    probe_page: Option<Page>,
    probe_pos: usize,
    probe_done: bool,
    current_probe: Option<*const u8>,
    cursor: Option<BucketCursor>,
    pending_build: Option<*const u8>,
    index_page: Option<Page>,
}

unsafe impl Send for ProbeState {}

pub struct HashJoinOp {
    build: Arc<dyn Operator>,
    probe: Arc<dyn Operator>,
    build_key_col: usize,
    build_hasher: TupleHasher,
    probe_hasher: TupleHasher,
    key_eq: Comparator,
    out_schema: Schema,
    projections: Vec<ProjectionEntry>,
    table: HashTable,
    start_barrier: Barrier,
    build_barrier: Barrier,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    states: PerThread<ProbeState>,
    /// When set, `scanStart` also appends every build key to a per-thread
    /// single-column page and hands it to the probe side's `scanStart` as
    /// the index-data side channel -- the `IndexHashJoinOp` variant.
    index_channel: Option<(Schema, usize)>,
}

impl HashJoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        build: Arc<dyn Operator>,
        probe: Arc<dyn Operator>,
        build_key_col: usize,
        probe_key_col: usize,
        build_hasher: TupleHasher,
        probe_hasher: TupleHasher,
        projections: Vec<ProjectionEntry>,
        buffsize: usize,
        table: HashTable,
        allocator: Arc<NumaAllocator>,
        group_size: usize,
    ) -> crate::error::Result<Self> {
        Self::new_impl(
            build, probe, build_key_col, probe_key_col, build_hasher, probe_hasher, projections, buffsize, table,
            allocator, group_size, None,
        )
    }

    /// Like [`Self::new`], but also builds the index-data side channel
    /// described for `IndexHashJoinOp`: `index_capacity_bytes` must be
    /// sized to hold every build key as a single-column tuple.
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_index_channel(
        build: Arc<dyn Operator>,
        probe: Arc<dyn Operator>,
        build_key_col: usize,
        probe_key_col: usize,
        build_hasher: TupleHasher,
        probe_hasher: TupleHasher,
        projections: Vec<ProjectionEntry>,
        buffsize: usize,
        table: HashTable,
        allocator: Arc<NumaAllocator>,
        group_size: usize,
        index_capacity_bytes: usize,
    ) -> crate::error::Result<Self> {
        Self::new_impl(
            build,
            probe,
            build_key_col,
            probe_key_col,
            build_hasher,
            probe_hasher,
            projections,
            buffsize,
            table,
            allocator,
            group_size,
            Some(index_capacity_bytes),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new_impl(
        build: Arc<dyn Operator>,
        probe: Arc<dyn Operator>,
        build_key_col: usize,
        probe_key_col: usize,
        build_hasher: TupleHasher,
        probe_hasher: TupleHasher,
        projections: Vec<ProjectionEntry>,
        buffsize: usize,
        table: HashTable,
        allocator: Arc<NumaAllocator>,
        group_size: usize,
        index_capacity_bytes: Option<usize>,
    ) -> crate::error::Result<Self> {
        let key_eq = build
            .out_schema()
            .create_comparator(build_key_col, probe.out_schema(), probe_key_col, crate::schema::CompareOp::Eq)?;

        let mut out_schema = Schema::new();
        for p in &projections {
            let src = match p.side {
                Side::Build => build.out_schema(),
                Side::Probe => probe.out_schema(),
            };
            out_schema.add(src.get(p.index).clone());
        }

        let mut key_schema = Schema::new();
        key_schema.add(build.out_schema().get(build_key_col).clone());

        let states = PerThread::new(group_size, |_| ProbeState {
            out: Page::new_local(Arc::new(NumaAllocator::new()), 0, 1, *b"HJou"),
            probe_page: None,
            probe_pos: 0,
            probe_done: false,
            current_probe: None,
            cursor: None,
            pending_build: None,
            index_page: None,
        });

        Ok(Self {
            build,
            probe,
            build_key_col,
            build_hasher,
            probe_hasher,
            key_eq,
            out_schema,
            projections,
            table,
            start_barrier: Barrier::new(group_size),
            build_barrier: Barrier::new(group_size),
            buffsize,
            allocator,
            states,
            index_channel: index_capacity_bytes.map(|cap| (key_schema, cap)),
        })
    }

    unsafe fn construct_output(&self, slot: *mut u8, probe_tup: *const u8, build_tup: *const u8) {
        for (j, p) in self.projections.iter().enumerate() {
            let (schema, tup) = match p.side {
                Side::Build => (self.build.out_schema(), build_tup),
                Side::Probe => (self.probe.out_schema(), probe_tup),
            };
            let src = schema.calc_offset(tup, p.index);
            self.out_schema.write_data(slot, j, src);
        }
    }
}

impl Operator for HashJoinOp {
    fn out_schema(&self) -> &Schema {
        &self.out_schema
    }

    fn children(&self) -> Children<'_> {
        Children::Dual { build: &self.build, probe: &self.probe }
    }

    fn thread_init(&self, tid: ThreadId) {
        let mut st = self.states.get(tid);
        st.out = Page::new_local(Arc::clone(&self.allocator), self.buffsize, self.out_schema.tuple_size(), *b"HJou");
        if let Some((key_schema, capacity)) = &self.index_channel {
            st.index_page = Some(Page::new_local(Arc::clone(&self.allocator), *capacity, key_schema.tuple_size(), *b"HJix"));
        }
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        if tid == 0 {
            self.table.bucket_clear(0, 1);
        }
        self.start_barrier.arrive_and_wait();

        let build_code = self.build.scan_start(tid, None);
        if build_code.is_error() {
            // Still reach the build barrier so group peers waiting on it
            // don't hang on our failure.
            self.build_barrier.arrive_and_wait();
            return ResultCode::Error;
        }

        let index_page = {
            let st = self.states.get(tid);
            st.index_page.as_ref().map(Page::snapshot)
        };
        if let Some(page) = &index_page {
            page.clear();
        }

        loop {
            let result = self.build.get_next(tid);
            for tup in result.page.create_iterator() {
                let h = unsafe { self.build_hasher.hash(tup) };
                let slot = self.table.atomic_allocate(h);
                unsafe { self.build.out_schema().copy_tuple(slot, tup) };
                if let (Some(page), Some((key_schema, _))) = (&index_page, &self.index_channel) {
                    let key_slot = page.allocate_tuple().expect("index channel sized for build volume");
                    let key_src = self.build.out_schema().calc_offset(tup, self.build_key_col);
                    unsafe { key_schema.write_data(key_slot, 0, key_src) };
                }
            }
            if result.code != ResultCode::Ready {
                if result.code == ResultCode::Error {
                    self.build.scan_stop(tid);
                    self.build_barrier.arrive_and_wait();
                    return ResultCode::Error;
                }
                break;
            }
        }
        self.build.scan_stop(tid);
        self.build_barrier.arrive_and_wait();
        if tid == 0 {
            tracing::debug!(buckets = self.table.nbuckets(), "hash join: build phase complete");
        }

        let probe_index_data = match (&index_page, &self.index_channel) {
            (Some(page), Some((key_schema, _))) => Some(IndexData { page: page.snapshot(), schema: key_schema.clone() }),
            _ => index_data.cloned(),
        };
        let probe_code = self.probe.scan_start(tid, probe_index_data.as_ref());
        if probe_code.is_error() {
            return ResultCode::Error;
        }
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let mut st = self.states.get(tid);
        let out = st.out.snapshot();
        out.clear();

        loop {
            if let Some(build_tup) = st.pending_build.take() {
                let probe_tup = st.current_probe.expect("pending match implies an active probe tuple");
                match out.allocate_tuple() {
                    Some(slot) => unsafe { self.construct_output(slot, probe_tup, build_tup) },
                    None => {
                        st.pending_build = Some(build_tup);
                        return GetNextResult::ready(out);
                    }
                }
            }

            if st.current_probe.is_some() {
                while let Some(build_tup) = st.cursor.as_mut().unwrap().next() {
                    let probe_tup = st.current_probe.unwrap();
                    if unsafe { self.key_eq.eval(build_tup, probe_tup) } {
                        match out.allocate_tuple() {
                            Some(slot) => unsafe { self.construct_output(slot, probe_tup, build_tup) },
                            None => {
                                st.pending_build = Some(build_tup);
                                return GetNextResult::ready(out);
                            }
                        }
                    }
                }
                st.current_probe = None;
                st.cursor = None;
            }

            loop {
                if let Some(page) = st.probe_page.as_ref() {
                    if st.probe_pos < page.tuple_count() {
                        let tup = page.tuple_offset(st.probe_pos) as *const u8;
                        st.probe_pos += 1;
                        let bucket = unsafe { self.probe_hasher.hash(tup) };
                        st.current_probe = Some(tup);
                        st.cursor = Some(BucketCursor { node: self.table.bucket_head_ptr(bucket), pos: 0 });
                        break;
                    }
                }
                if st.probe_done {
                    return GetNextResult::finished(out);
                }
                let result = self.probe.get_next(tid);
                if result.code == ResultCode::Error {
                    return GetNextResult::error(out);
                }
                if result.code == ResultCode::Finished {
                    st.probe_done = true;
                }
                st.probe_page = Some(result.page);
                st.probe_pos = 0;
            }
        }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.probe.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {
        // HashTable's own Drop impl frees every bucket chain once the plan
        // is dropped; nothing else to release here.
    }
}

/// `HashJoinOp` variant that also publishes every build key it inserts as
/// an index-data side channel for the probe side's `scanStart`, letting
/// an index-scan probe leaf restrict itself to keys actually present in
/// the build. Identical to `HashJoinOp` otherwise; kept as a distinct
/// type so a plan names it the way the rest of the join family is named.
pub struct IndexHashJoinOp {
    inner: HashJoinOp,
}

impl IndexHashJoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        build: Arc<dyn Operator>,
        probe: Arc<dyn Operator>,
        build_key_col: usize,
        probe_key_col: usize,
        build_hasher: TupleHasher,
        probe_hasher: TupleHasher,
        projections: Vec<ProjectionEntry>,
        buffsize: usize,
        table: HashTable,
        allocator: Arc<NumaAllocator>,
        group_size: usize,
        index_capacity_bytes: usize,
    ) -> crate::error::Result<Self> {
        let inner = HashJoinOp::new_with_index_channel(
            build,
            probe,
            build_key_col,
            probe_key_col,
            build_hasher,
            probe_hasher,
            projections,
            buffsize,
            table,
            allocator,
            group_size,
            index_capacity_bytes,
        )?;
        Ok(Self { inner })
    }
}

impl Operator for IndexHashJoinOp {
    fn out_schema(&self) -> &Schema {
        self.inner.out_schema()
    }

    fn children(&self) -> Children<'_> {
        self.inner.children()
    }

    fn thread_init(&self, tid: ThreadId) {
        self.inner.thread_init(tid)
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        self.inner.scan_start(tid, index_data)
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        self.inner.get_next(tid)
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.inner.scan_stop(tid)
    }

    fn thread_close(&self, tid: ThreadId) {
        self.inner.thread_close(tid)
    }

    fn destroy(&self) {
        self.inner.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashtable::HashFn;
    use crate::memory::AllocPolicy;
    use crate::operator::stateless::IntGeneratorOp;
    use crate::schema::{ColumnSpec, ColumnType};
    use parking_lot::Mutex;

    fn schema_ii() -> Schema {
        let mut s = Schema::new();
        s.add(ColumnSpec::new(ColumnType::Integer));
        s.add(ColumnSpec::new(ColumnType::Integer));
        s
    }

    #[test]
    fn inner_join_matches_on_equal_keys() {
        let allocator = Arc::new(NumaAllocator::new());

        let build_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32).to_ne_bytes();
            let payload = (i as i32 * 100).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, payload.as_ptr());
        });
        let build: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 10, 4096, Arc::clone(&allocator), build_gen, 1));

        let probe_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32 % 5).to_ne_bytes();
            let tag = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, tag.as_ptr());
        });
        let probe: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 15, 4096, Arc::clone(&allocator), probe_gen, 1));

        let table = HashTable::new(8, 4096, 8, AllocPolicy::Local, Arc::clone(&allocator), *b"HJbk");
        let build_hasher = TupleHasher::new(0, ColumnType::Integer, 8, HashFn::Modulo);
        let probe_hasher = TupleHasher::new(0, ColumnType::Integer, 8, HashFn::Modulo);

        let join = HashJoinOp::new(
            build,
            probe,
            0,
            0,
            build_hasher,
            probe_hasher,
            vec![
                ProjectionEntry { side: Side::Probe, index: 0 },
                ProjectionEntry { side: Side::Build, index: 1 },
                ProjectionEntry { side: Side::Probe, index: 1 },
            ],
            4096,
            table,
            allocator,
            1,
        )
        .unwrap();

        join.thread_init(0);
        assert_eq!(join.scan_start(0, None), ResultCode::Ready);

        let mut rows = vec![];
        loop {
            let result = join.get_next(0);
            for tup in result.page.create_iterator() {
                let mut key = [0u8; 4];
                let mut payload = [0u8; 4];
                let mut tag = [0u8; 4];
                unsafe {
                    std::ptr::copy_nonoverlapping(tup, key.as_mut_ptr(), 4);
                    std::ptr::copy_nonoverlapping(tup.add(4), payload.as_mut_ptr(), 4);
                    std::ptr::copy_nonoverlapping(tup.add(8), tag.as_mut_ptr(), 4);
                }
                rows.push((i32::from_ne_bytes(key), i32::from_ne_bytes(payload), i32::from_ne_bytes(tag)));
            }
            if result.code != ResultCode::Ready {
                break;
            }
        }

        // probe rows 0..15 join on key = i % 5 against build keys 0..10,
        // every probe key in [0,5) has exactly one build match.
        assert_eq!(rows.len(), 15);
        for (key, payload, _tag) in &rows {
            assert_eq!(*payload, key * 100);
        }
    }

    /// Wraps a child and records whatever index-data side channel its
    /// `scanStart` receives, forwarding everything else unchanged.
    struct CapturingProbe {
        child: Arc<dyn Operator>,
        captured: Mutex<Vec<i32>>,
    }

    impl Operator for CapturingProbe {
        fn out_schema(&self) -> &Schema {
            self.child.out_schema()
        }
        fn children(&self) -> Children<'_> {
            Children::Single(&self.child)
        }
        fn thread_init(&self, tid: ThreadId) {
            self.child.thread_init(tid)
        }
        fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
            if let Some(data) = index_data {
                let mut seen = self.captured.lock();
                for tup in data.page.create_iterator() {
                    let mut buf = [0u8; 4];
                    unsafe { std::ptr::copy_nonoverlapping(tup, buf.as_mut_ptr(), 4) };
                    seen.push(i32::from_ne_bytes(buf));
                }
            }
            self.child.scan_start(tid, None)
        }
        fn get_next(&self, tid: ThreadId) -> GetNextResult {
            self.child.get_next(tid)
        }
        fn scan_stop(&self, tid: ThreadId) -> ResultCode {
            self.child.scan_stop(tid)
        }
        fn thread_close(&self, tid: ThreadId) {
            self.child.thread_close(tid)
        }
        fn destroy(&self) {
            self.child.destroy()
        }
    }

    #[test]
    fn index_hash_join_publishes_build_keys_to_the_probe_side_channel() {
        let allocator = Arc::new(NumaAllocator::new());
        let build_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, key.as_ptr());
        });
        let build: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 6, 4096, Arc::clone(&allocator), build_gen, 1));

        let probe_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32 % 3).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, key.as_ptr());
        });
        let generator: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 9, 4096, Arc::clone(&allocator), probe_gen, 1));
        let probe = Arc::new(CapturingProbe { child: generator, captured: Mutex::new(vec![]) });
        let probe_handle = Arc::clone(&probe);
        let probe: Arc<dyn Operator> = probe;

        let table = HashTable::new(8, 4096, 8, AllocPolicy::Local, Arc::clone(&allocator), *b"IHJb");
        let build_hasher = TupleHasher::new(0, ColumnType::Integer, 8, HashFn::Modulo);
        let probe_hasher = TupleHasher::new(0, ColumnType::Integer, 8, HashFn::Modulo);

        let join = IndexHashJoinOp::new(
            build,
            probe,
            0,
            0,
            build_hasher,
            probe_hasher,
            vec![ProjectionEntry { side: Side::Probe, index: 0 }],
            4096,
            table,
            allocator,
            1,
            4096,
        )
        .unwrap();

        join.thread_init(0);
        assert_eq!(join.scan_start(0, None), ResultCode::Ready);
        loop {
            let result = join.get_next(0);
            if result.code != ResultCode::Ready {
                break;
            }
        }

        let mut keys = probe_handle.captured.lock().clone();
        keys.sort();
        assert_eq!(keys, (0..6).collect::<Vec<_>>());
    }
}
