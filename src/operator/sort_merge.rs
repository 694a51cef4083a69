//! Sort-merge join family: three operators sharing a typed key comparator
//! and a projection-descriptor output writer, but each driving a genuinely
//! different algorithm over its build/probe children.
//!
//! `SortMergeJoinOp` stages and sorts both sides per thread, then -- after
//! a group barrier -- fans each build thread out across every group
//! member's staged probe tuples (optionally restricted to a `prepartFn`
//! range via binary search). `OldMPSMJoinOp` stages and sorts only the
//! build side; it joins one incoming probe page at a time, rewinding the
//! build cursor to the start for each page, so its output is the
//! concatenation of independently-sorted per-page runs rather than one
//! globally sorted stream. `PresortedPrepartitionedMergeJoinOp` stages
//! neither side: it trusts both children to already arrive in key order
//! over the thread's own aligned range and streams a lockstep merge,
//! buffering only the build tuples of the key currently being matched.

use super::hash_join::{ProjectionEntry, Side};
use super::{Children, GetNextResult, IndexData, Operator, PerThread, ResultCode, ThreadId};
use crate::concurrent::Barrier;
use crate::error::{PythiaError, Result};
use crate::memory::{NumaAllocator, Page};
use crate::schema::{ColumnType, Schema};
use std::cmp::Ordering;
use std::sync::Arc;

/// Compares the key column of two tuples, each read at its own byte
/// offset (the two sides of a join need not place the join column at the
/// same offset in their respective schemas).
fn compare_key(a: *const u8, offset_a: usize, b: *const u8, offset_b: usize, ty: ColumnType) -> Ordering {
    unsafe {
        match ty {
            ColumnType::Integer => {
                let mut x = [0u8; 4];
                let mut y = [0u8; 4];
                std::ptr::copy_nonoverlapping(a.add(offset_a), x.as_mut_ptr(), 4);
                std::ptr::copy_nonoverlapping(b.add(offset_b), y.as_mut_ptr(), 4);
                i32::from_ne_bytes(x).cmp(&i32::from_ne_bytes(y))
            }
            ColumnType::Long | ColumnType::Date | ColumnType::Pointer => {
                let mut x = [0u8; 8];
                let mut y = [0u8; 8];
                std::ptr::copy_nonoverlapping(a.add(offset_a), x.as_mut_ptr(), 8);
                std::ptr::copy_nonoverlapping(b.add(offset_b), y.as_mut_ptr(), 8);
                i64::from_ne_bytes(x).cmp(&i64::from_ne_bytes(y))
            }
            ColumnType::Decimal => {
                let mut x = [0u8; 8];
                let mut y = [0u8; 8];
                std::ptr::copy_nonoverlapping(a.add(offset_a), x.as_mut_ptr(), 8);
                std::ptr::copy_nonoverlapping(b.add(offset_b), y.as_mut_ptr(), 8);
                f64::from_ne_bytes(x).partial_cmp(&f64::from_ne_bytes(y)).unwrap_or(Ordering::Equal)
            }
            ColumnType::Char(_) => unreachable!("sort-merge key type is validated at construction"),
        }
    }
}

/// Reads the key column as an `i64` for `prepartFn` range comparisons --
/// only ever called on the numeric types `check_sortable_key_type` admits.
fn read_key_i64(tup: *const u8, offset: usize, ty: ColumnType) -> i64 {
    unsafe {
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
            ColumnType::Char(_) => unreachable!("sort-merge key type is validated at construction"),
        }
    }
}

/// Sorting supports `INTEGER`, `LONG`/`DATE`/`POINTER`, and `DECIMAL` keys
/// only; a wider key (`CHAR`) is out of scope for this family.
fn check_sortable_key_type(ty: ColumnType) -> Result<()> {
    match ty {
        ColumnType::Integer | ColumnType::Long | ColumnType::Date | ColumnType::Pointer | ColumnType::Decimal => Ok(()),
        ColumnType::Char(_) => Err(PythiaError::NotYetImplemented("sort-merge join over a CHAR key column")),
    }
}

fn join_out_schema(build: &Arc<dyn Operator>, probe: &Arc<dyn Operator>, projections: &[ProjectionEntry]) -> Schema {
    let mut out_schema = Schema::new();
    for p in projections {
        let src = match p.side {
            Side::Build => build.out_schema(),
            Side::Probe => probe.out_schema(),
        };
        out_schema.add(src.get(p.index).clone());
    }
    out_schema
}

unsafe fn construct_output(
    out_schema: &Schema,
    projections: &[ProjectionEntry],
    build_schema: &Schema,
    probe_schema: &Schema,
    slot: *mut u8,
    probe_tup: *const u8,
    build_tup: *const u8,
) {
    for (j, p) in projections.iter().enumerate() {
        let (schema, tup) = match p.side {
            Side::Build => (build_schema, build_tup),
            Side::Probe => (probe_schema, probe_tup),
        };
        let src = schema.calc_offset(tup, p.index);
        out_schema.write_data(slot, j, src);
    }
}

/// `prepartFn`: a uniform split of `[min, max]` into `buckets` ranges,
/// `minimum_for_bucket(i) = min + i*step` -- the same splitter
/// `ExactRangeValueHasher` uses for range partitioning, reused here to
/// restrict each build thread's per-peer probe scan to its own range.
#[derive(Debug, Clone, Copy)]
pub struct PrepartRange {
    pub min: i64,
    pub max: i64,
    pub buckets: usize,
}

impl PrepartRange {
    pub fn minimum_for_bucket(&self, i: usize) -> i64 {
        let span = (self.max - self.min + 1).max(1) as i128;
        self.min + ((span * i as i128) / self.buckets.max(1) as i128) as i64
    }
}

/// Restricts a sorted row list to the key sub-range `[lo, hi)` via binary
/// search, returning an owned copy of the restricted pointer slice.
fn restrict_range(rows: Vec<*const u8>, offset: usize, ty: ColumnType, lo: i64, hi: i64) -> Vec<*const u8> {
    let start = rows.partition_point(|&t| read_key_i64(t, offset, ty) < lo);
    let end = rows.partition_point(|&t| read_key_i64(t, offset, ty) < hi);
    rows[start..end].to_vec()
}

// ---------------------------------------------------------------------
// SortMergeJoinOp
// ---------------------------------------------------------------------

struct ProbeCursor {
    pos: usize,
    run_start: usize,
}

struct SmjState {
    out: Page,
    build_rows: Vec<*const u8>,
    _build_pages: Vec<Page>,
    probe_rows: Vec<*const u8>,
    _probe_pages: Vec<Page>,
    /// Every group member's staged, sorted probe rows, gathered once after
    /// the stage barrier (restricted to this thread's `prepartFn` range
    /// when one is configured). Read-only for the rest of the scan.
    peers: Vec<Vec<*const u8>>,
    cursors: Vec<ProbeCursor>,
    bi: usize,
    k: usize,
    j: usize,
    in_run: bool,
}

unsafe impl Send for SmjState {}

/// Per-thread build/probe staging, a group barrier, then a fan-out merge:
/// each thread's build page is matched against every group member's
/// staged probe page (not just its own), so a build tuple finds every
/// matching probe tuple regardless of which thread produced it.
pub struct SortMergeJoinOp {
    build: Arc<dyn Operator>,
    probe: Arc<dyn Operator>,
    build_key: usize,
    probe_key: usize,
    key_type: ColumnType,
    out_schema: Schema,
    projections: Vec<ProjectionEntry>,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    group_size: usize,
    prepart: Option<PrepartRange>,
    stage_barrier: Barrier,
    stop_barrier: Barrier,
    states: PerThread<SmjState>,
}

impl SortMergeJoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        build: Arc<dyn Operator>,
        probe: Arc<dyn Operator>,
        build_key: usize,
        probe_key: usize,
        projections: Vec<ProjectionEntry>,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        group_size: usize,
        prepart: Option<PrepartRange>,
    ) -> Result<Self> {
        let key_type = build.out_schema().column_type(build_key);
        check_sortable_key_type(key_type)?;
        let out_schema = join_out_schema(&build, &probe, &projections);
        let states = PerThread::new(group_size, |_| SmjState {
            out: Page::new_local(Arc::new(NumaAllocator::new()), 0, 1, *b"SMJo"),
            build_rows: Vec::new(),
            _build_pages: Vec::new(),
            probe_rows: Vec::new(),
            _probe_pages: Vec::new(),
            peers: Vec::new(),
            cursors: Vec::new(),
            bi: 0,
            k: 0,
            j: 0,
            in_run: false,
        });
        Ok(Self {
            build,
            probe,
            build_key,
            probe_key,
            key_type,
            out_schema,
            projections,
            buffsize,
            allocator,
            group_size,
            prepart,
            stage_barrier: Barrier::new(group_size),
            stop_barrier: Barrier::new(group_size),
            states,
        })
    }
}

impl Operator for SortMergeJoinOp {
    fn out_schema(&self) -> &Schema {
        &self.out_schema
    }

    fn children(&self) -> Children<'_> {
        Children::Dual { build: &self.build, probe: &self.probe }
    }

    fn thread_init(&self, tid: ThreadId) {
        let mut st = self.states.get(tid);
        st.out = Page::new_local(Arc::clone(&self.allocator), self.buffsize, self.out_schema.tuple_size(), *b"SMJo");
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        let mut code = ResultCode::Ready;
        if self.build.scan_start(tid, None).is_error() || self.probe.scan_start(tid, index_data).is_error() {
            code = ResultCode::Error;
        }

        if !code.is_error() {
            let mut st = self.states.get(tid);
            st.build_rows.clear();
            st._build_pages.clear();
            loop {
                let result = self.build.get_next(tid);
                if result.page.tuple_count() > 0 {
                    st.build_rows.extend(result.page.create_iterator());
                    st._build_pages.push(result.page);
                }
                if result.code != ResultCode::Ready {
                    if result.code == ResultCode::Error {
                        code = ResultCode::Error;
                    }
                    break;
                }
            }
            self.build.scan_stop(tid);

            if !code.is_error() {
                st.probe_rows.clear();
                st._probe_pages.clear();
                loop {
                    let result = self.probe.get_next(tid);
                    if result.page.tuple_count() > 0 {
                        st.probe_rows.extend(result.page.create_iterator());
                        st._probe_pages.push(result.page);
                    }
                    if result.code != ResultCode::Ready {
                        if result.code == ResultCode::Error {
                            code = ResultCode::Error;
                        }
                        break;
                    }
                }
                self.probe.scan_stop(tid);
            }

            if !code.is_error() {
                let (build_key, probe_key, key_type) = (self.build_key, self.probe_key, self.key_type);
                st.build_rows.sort_by(|&a, &b| compare_key(a, build_key, b, build_key, key_type));
                st.probe_rows.sort_by(|&a, &b| compare_key(a, probe_key, b, probe_key, key_type));
            }
        }

        // Every group member must reach this barrier even on error, so a
        // failing thread doesn't strand its peers waiting here forever.
        self.stage_barrier.arrive_and_wait();
        if code.is_error() {
            return ResultCode::Error;
        }

        let mut peers = Vec::with_capacity(self.group_size);
        for peer in 0..self.group_size {
            let rows = self.states.get(peer).probe_rows.clone();
            let rows = match &self.prepart {
                Some(range) => restrict_range(
                    rows,
                    self.probe_key,
                    self.key_type,
                    range.minimum_for_bucket(tid),
                    range.minimum_for_bucket(tid + 1),
                ),
                None => rows,
            };
            peers.push(rows);
        }

        let mut st = self.states.get(tid);
        st.cursors = (0..self.group_size).map(|_| ProbeCursor { pos: 0, run_start: 0 }).collect();
        st.peers = peers;
        st.bi = 0;
        st.k = 0;
        st.j = 0;
        st.in_run = false;
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let mut st = self.states.get(tid);
        let out = st.out.snapshot();
        out.clear();

        loop {
            if st.bi >= st.build_rows.len() {
                return GetNextResult::finished(out);
            }

            if st.k >= self.group_size {
                let finished_key_tup = st.build_rows[st.bi];
                let next_bi = st.bi + 1;
                let same_key = next_bi < st.build_rows.len()
                    && compare_key(st.build_rows[next_bi], self.build_key, finished_key_tup, self.build_key, self.key_type)
                        == Ordering::Equal;
                st.bi = next_bi;
                st.k = 0;
                st.in_run = false;
                if same_key {
                    for c in st.cursors.iter_mut() {
                        c.pos = c.run_start;
                    }
                }
                continue;
            }

            let build_tup = st.build_rows[st.bi];

            if !st.in_run {
                let k = st.k;
                let mut pos = st.cursors[k].pos;
                while pos < st.peers[k].len()
                    && compare_key(st.peers[k][pos], self.probe_key, build_tup, self.build_key, self.key_type) == Ordering::Less
                {
                    pos += 1;
                }
                st.cursors[k].run_start = pos;
                st.j = pos;
                st.in_run = true;
            }

            let k = st.k;
            let j = st.j;
            if j < st.peers[k].len()
                && compare_key(st.peers[k][j], self.probe_key, build_tup, self.build_key, self.key_type) == Ordering::Equal
            {
                let probe_tup = st.peers[k][j];
                match out.allocate_tuple() {
                    Some(slot) => unsafe {
                        construct_output(
                            &self.out_schema,
                            &self.projections,
                            self.build.out_schema(),
                            self.probe.out_schema(),
                            slot,
                            probe_tup,
                            build_tup,
                        )
                    },
                    None => return GetNextResult::ready(out),
                }
                st.j = j + 1;
            } else {
                st.cursors[k].pos = j;
                st.in_run = false;
                st.k = k + 1;
            }
        }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        let mut st = self.states.get(tid);
        st.build_rows.clear();
        st._build_pages.clear();
        st.probe_rows.clear();
        st._probe_pages.clear();
        st.peers.clear();
        st.cursors.clear();
        drop(st);
        self.stop_barrier.arrive_and_wait();
        ResultCode::Ready
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

// ---------------------------------------------------------------------
// OldMPSMJoinOp
// ---------------------------------------------------------------------

struct OldMpsmState {
    out: Page,
    build_rows: Vec<*const u8>,
    _build_pages: Vec<Page>,
    probe_rows: Vec<*const u8>,
    _probe_pages: Vec<Page>,
    probe_done: bool,
    bi: usize,
    pi: usize,
    run_hi: usize,
    j: usize,
    have_run: bool,
}

unsafe impl Send for OldMpsmState {}

/// Stages and sorts only the build side once. The probe side is streamed
/// page by page; each incoming probe page is sorted on its own and joined
/// against the build array with the build cursor rewound to its start, so
/// distinct probe pages never share a merge run. Output is therefore the
/// concatenation of independently-sorted per-page runs, not one globally
/// sorted stream.
pub struct OldMPSMJoinOp {
    build: Arc<dyn Operator>,
    probe: Arc<dyn Operator>,
    build_key: usize,
    probe_key: usize,
    key_type: ColumnType,
    out_schema: Schema,
    projections: Vec<ProjectionEntry>,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    states: PerThread<OldMpsmState>,
}

impl OldMPSMJoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        build: Arc<dyn Operator>,
        probe: Arc<dyn Operator>,
        build_key: usize,
        probe_key: usize,
        projections: Vec<ProjectionEntry>,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        max_threads: usize,
    ) -> Result<Self> {
        let key_type = build.out_schema().column_type(build_key);
        check_sortable_key_type(key_type)?;
        let out_schema = join_out_schema(&build, &probe, &projections);
        let states = PerThread::new(max_threads, |_| OldMpsmState {
            out: Page::new_local(Arc::new(NumaAllocator::new()), 0, 1, *b"MPSo"),
            build_rows: Vec::new(),
            _build_pages: Vec::new(),
            probe_rows: Vec::new(),
            _probe_pages: Vec::new(),
            probe_done: false,
            bi: 0,
            pi: 0,
            run_hi: 0,
            j: 0,
            have_run: false,
        });
        Ok(Self { build, probe, build_key, probe_key, key_type, out_schema, projections, buffsize, allocator, states })
    }
}

impl Operator for OldMPSMJoinOp {
    fn out_schema(&self) -> &Schema {
        &self.out_schema
    }

    fn children(&self) -> Children<'_> {
        Children::Dual { build: &self.build, probe: &self.probe }
    }

    fn thread_init(&self, tid: ThreadId) {
        let mut st = self.states.get(tid);
        st.out = Page::new_local(Arc::clone(&self.allocator), self.buffsize, self.out_schema.tuple_size(), *b"MPSo");
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        if self.build.scan_start(tid, None).is_error() {
            return ResultCode::Error;
        }
        if self.probe.scan_start(tid, index_data).is_error() {
            return ResultCode::Error;
        }

        let mut st = self.states.get(tid);
        st.build_rows.clear();
        st._build_pages.clear();
        loop {
            let result = self.build.get_next(tid);
            if result.page.tuple_count() > 0 {
                st.build_rows.extend(result.page.create_iterator());
                st._build_pages.push(result.page);
            }
            if result.code != ResultCode::Ready {
                if result.code == ResultCode::Error {
                    return ResultCode::Error;
                }
                break;
            }
        }
        self.build.scan_stop(tid);

        let build_key = self.build_key;
        let key_type = self.key_type;
        st.build_rows.sort_by(|&a, &b| compare_key(a, build_key, b, build_key, key_type));

        st.probe_rows.clear();
        st._probe_pages.clear();
        st.probe_done = false;
        st.bi = 0;
        st.pi = 0;
        st.have_run = false;
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let mut st = self.states.get(tid);
        let out = st.out.snapshot();
        out.clear();

        loop {
            if st.pi >= st.probe_rows.len() {
                if st.probe_done {
                    return GetNextResult::finished(out);
                }
                let result = self.probe.get_next(tid);
                if result.code == ResultCode::Error {
                    return GetNextResult::error(out);
                }
                st.probe_rows.clear();
                st._probe_pages.clear();
                if result.page.tuple_count() > 0 {
                    st.probe_rows.extend(result.page.create_iterator());
                    st._probe_pages.push(result.page);
                    let probe_key = self.probe_key;
                    let key_type = self.key_type;
                    st.probe_rows.sort_by(|&a, &b| compare_key(a, probe_key, b, probe_key, key_type));
                }
                if result.code == ResultCode::Finished {
                    st.probe_done = true;
                }
                // Rewind the build iterator to the start for this page.
                st.pi = 0;
                st.bi = 0;
                st.have_run = false;
                if st.probe_rows.is_empty() {
                    if st.probe_done {
                        return GetNextResult::finished(out);
                    }
                    continue;
                }
            }

            if !st.have_run {
                let key = st.probe_rows[st.pi];
                while st.bi < st.build_rows.len()
                    && compare_key(st.build_rows[st.bi], self.build_key, key, self.probe_key, self.key_type) == Ordering::Less
                {
                    st.bi += 1;
                }
                let mut hi = st.bi;
                while hi < st.build_rows.len()
                    && compare_key(st.build_rows[hi], self.build_key, key, self.probe_key, self.key_type) == Ordering::Equal
                {
                    hi += 1;
                }
                st.run_hi = hi;
                st.j = st.bi;
                st.have_run = true;
            }

            let probe_tup = st.probe_rows[st.pi];
            while st.j < st.run_hi {
                let build_tup = st.build_rows[st.j];
                match out.allocate_tuple() {
                    Some(slot) => unsafe {
                        construct_output(
                            &self.out_schema,
                            &self.projections,
                            self.build.out_schema(),
                            self.probe.out_schema(),
                            slot,
                            probe_tup,
                            build_tup,
                        )
                    },
                    None => return GetNextResult::ready(out),
                }
                st.j += 1;
            }

            st.pi += 1;
            st.have_run = false;
        }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.probe.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

// ---------------------------------------------------------------------
// PresortedPrepartitionedMergeJoinOp
// ---------------------------------------------------------------------

enum Peek {
    Tuple(*const u8),
    Done,
    Error,
}

struct PrepartState {
    out: Page,
    build_page: Option<Page>,
    build_pos: usize,
    build_done: bool,
    probe_page: Option<Page>,
    probe_pos: usize,
    probe_done: bool,
    /// Every build tuple sharing the key currently being matched, up to
    /// `buffer_capacity`. Replayed once per matching probe tuple.
    buffer: Vec<*const u8>,
    _buffer_pages: Vec<Page>,
    buf_j: usize,
    filled: bool,
}

unsafe impl Send for PrepartState {}

/// Neither side is staged: both children are assumed already sorted and
/// aligned on this thread's key range, and are pulled page by page as a
/// plain lockstep merge. The only buffering is `buffer`, sized to hold
/// every tuple of the build side's most-frequently-occurring key, so a
/// run of equal probe keys can be matched against the whole build group
/// without rereading the child.
pub struct PresortedPrepartitionedMergeJoinOp {
    build: Arc<dyn Operator>,
    probe: Arc<dyn Operator>,
    build_key: usize,
    probe_key: usize,
    key_type: ColumnType,
    out_schema: Schema,
    projections: Vec<ProjectionEntry>,
    buffsize: usize,
    allocator: Arc<NumaAllocator>,
    buffer_capacity: usize,
    states: PerThread<PrepartState>,
}

impl PresortedPrepartitionedMergeJoinOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        build: Arc<dyn Operator>,
        probe: Arc<dyn Operator>,
        build_key: usize,
        probe_key: usize,
        projections: Vec<ProjectionEntry>,
        buffsize: usize,
        allocator: Arc<NumaAllocator>,
        max_threads: usize,
        build_buffer_capacity: usize,
    ) -> Result<Self> {
        let key_type = build.out_schema().column_type(build_key);
        check_sortable_key_type(key_type)?;
        let out_schema = join_out_schema(&build, &probe, &projections);
        let buffer_capacity = build_buffer_capacity.max(1);
        let states = PerThread::new(max_threads, move |_| PrepartState {
            out: Page::new_local(Arc::new(NumaAllocator::new()), 0, 1, *b"PPMo"),
            build_page: None,
            build_pos: 0,
            build_done: false,
            probe_page: None,
            probe_pos: 0,
            probe_done: false,
            buffer: Vec::with_capacity(buffer_capacity),
            _buffer_pages: Vec::new(),
            buf_j: 0,
            filled: false,
        });
        Ok(Self {
            build,
            probe,
            build_key,
            probe_key,
            key_type,
            out_schema,
            projections,
            buffsize,
            allocator,
            buffer_capacity,
            states,
        })
    }

    fn peek_build(&self, tid: ThreadId, st: &mut PrepartState) -> Peek {
        loop {
            if let Some(page) = &st.build_page {
                if st.build_pos < page.tuple_count() {
                    return Peek::Tuple(page.tuple_offset(st.build_pos) as *const u8);
                }
            }
            if st.build_done {
                return Peek::Done;
            }
            let result = self.build.get_next(tid);
            if result.code == ResultCode::Error {
                return Peek::Error;
            }
            if result.code == ResultCode::Finished {
                st.build_done = true;
            }
            st.build_page = Some(result.page);
            st.build_pos = 0;
        }
    }

    fn peek_probe(&self, tid: ThreadId, st: &mut PrepartState) -> Peek {
        loop {
            if let Some(page) = &st.probe_page {
                if st.probe_pos < page.tuple_count() {
                    return Peek::Tuple(page.tuple_offset(st.probe_pos) as *const u8);
                }
            }
            if st.probe_done {
                return Peek::Done;
            }
            let result = self.probe.get_next(tid);
            if result.code == ResultCode::Error {
                return Peek::Error;
            }
            if result.code == ResultCode::Finished {
                st.probe_done = true;
            }
            st.probe_page = Some(result.page);
            st.probe_pos = 0;
        }
    }
}

impl Operator for PresortedPrepartitionedMergeJoinOp {
    fn out_schema(&self) -> &Schema {
        &self.out_schema
    }

    fn children(&self) -> Children<'_> {
        Children::Dual { build: &self.build, probe: &self.probe }
    }

    fn thread_init(&self, tid: ThreadId) {
        let mut st = self.states.get(tid);
        st.out = Page::new_local(Arc::clone(&self.allocator), self.buffsize, self.out_schema.tuple_size(), *b"PPMo");
    }

    fn scan_start(&self, tid: ThreadId, index_data: Option<&IndexData>) -> ResultCode {
        if self.build.scan_start(tid, None).is_error() || self.probe.scan_start(tid, index_data).is_error() {
            return ResultCode::Error;
        }
        let mut st = self.states.get(tid);
        st.build_page = None;
        st.build_pos = 0;
        st.build_done = false;
        st.probe_page = None;
        st.probe_pos = 0;
        st.probe_done = false;
        st.buffer.clear();
        st._buffer_pages.clear();
        st.buf_j = 0;
        st.filled = false;
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let mut st = self.states.get(tid);
        let out = st.out.snapshot();
        out.clear();

        loop {
            if st.filled {
                let probe_tup = match self.peek_probe(tid, &mut st) {
                    Peek::Tuple(t) => t,
                    Peek::Done => return GetNextResult::finished(out),
                    Peek::Error => return GetNextResult::error(out),
                };
                let buffer_key_tup = st.buffer[0];
                let same_key =
                    compare_key(probe_tup, self.probe_key, buffer_key_tup, self.build_key, self.key_type) == Ordering::Equal;
                if !same_key {
                    st.filled = false;
                    st.buffer.clear();
                    st._buffer_pages.clear();
                    continue;
                }
                let build_tup = st.buffer[st.buf_j];
                match out.allocate_tuple() {
                    Some(slot) => unsafe {
                        construct_output(
                            &self.out_schema,
                            &self.projections,
                            self.build.out_schema(),
                            self.probe.out_schema(),
                            slot,
                            probe_tup,
                            build_tup,
                        )
                    },
                    None => return GetNextResult::ready(out),
                }
                st.buf_j += 1;
                if st.buf_j >= st.buffer.len() {
                    st.buf_j = 0;
                    st.probe_pos += 1;
                }
                continue;
            }

            let build_tup = match self.peek_build(tid, &mut st) {
                Peek::Tuple(t) => t,
                Peek::Done => return GetNextResult::finished(out),
                Peek::Error => return GetNextResult::error(out),
            };
            let probe_tup = match self.peek_probe(tid, &mut st) {
                Peek::Tuple(t) => t,
                Peek::Done => return GetNextResult::finished(out),
                Peek::Error => return GetNextResult::error(out),
            };

            match compare_key(build_tup, self.build_key, probe_tup, self.probe_key, self.key_type) {
                Ordering::Less => st.build_pos += 1,
                Ordering::Greater => st.probe_pos += 1,
                Ordering::Equal => {
                    st.buffer.clear();
                    st._buffer_pages.clear();
                    loop {
                        if st.buffer.len() >= self.buffer_capacity {
                            tracing::warn!(
                                key_buffer_capacity = self.buffer_capacity,
                                "presorted prepartitioned join: build-side key group exceeds buffer capacity, truncating"
                            );
                            break;
                        }
                        match self.peek_build(tid, &mut st) {
                            Peek::Tuple(t)
                                if compare_key(t, self.build_key, build_tup, self.build_key, self.key_type) == Ordering::Equal =>
                            {
                                let page = st.build_page.as_ref().unwrap().snapshot();
                                st.buffer.push(t);
                                st._buffer_pages.push(page);
                                st.build_pos += 1;
                            }
                            _ => break,
                        }
                    }
                    st.buf_j = 0;
                    st.filled = true;
                }
            }
        }
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        let build_code = self.build.scan_stop(tid);
        let probe_code = self.probe.scan_stop(tid);
        if build_code.is_error() || probe_code.is_error() {
            ResultCode::Error
        } else {
            ResultCode::Ready
        }
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::stateless::IntGeneratorOp;
    use crate::schema::ColumnSpec;

    fn schema_ii() -> Schema {
        let mut s = Schema::new();
        s.add(ColumnSpec::new(ColumnType::Integer));
        s.add(ColumnSpec::new(ColumnType::Integer));
        s
    }

    #[test]
    fn sort_merge_join_matches_duplicate_keys_both_sides() {
        let allocator = Arc::new(NumaAllocator::new());

        let build_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32 / 2).to_ne_bytes(); // two build rows per key
            let tag = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, tag.as_ptr());
        });
        let build: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 10, 4096, Arc::clone(&allocator), build_gen, 1));

        let probe_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32).to_ne_bytes();
            let tag = (i as i32 * 10).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, tag.as_ptr());
        });
        let probe: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 5, 4096, Arc::clone(&allocator), probe_gen, 1));

        let join = SortMergeJoinOp::new(
            build,
            probe,
            0,
            0,
            vec![ProjectionEntry { side: Side::Probe, index: 0 }, ProjectionEntry { side: Side::Build, index: 1 }],
            4096,
            allocator,
            1,
            None,
        )
        .unwrap();

        join.thread_init(0);
        assert_eq!(join.scan_start(0, None), ResultCode::Ready);

        let mut rows = 0;
        loop {
            let result = join.get_next(0);
            rows += result.page.tuple_count();
            if result.code != ResultCode::Ready {
                break;
            }
        }
        // probe keys 0..5, each matches exactly 2 build rows -> 10 matches.
        assert_eq!(rows, 10);
    }

    #[test]
    fn sort_merge_join_fans_build_thread_out_across_every_group_members_probe_page() {
        // Two threads. Build thread 0 holds every build tuple (all of
        // key 7); probe thread 1 holds every matching probe tuple. A
        // single-thread-only merge (no cross-thread fan-out) would find
        // zero matches on thread 0's build page, since thread 0's own
        // probe page is empty.
        let allocator = Arc::new(NumaAllocator::new());
        let nthreads = 2;

        struct OneThreadOnly {
            schema: Schema,
            owner: ThreadId,
            keys: Vec<i32>,
            outputs: PerThread<Option<Page>>,
        }
        impl Operator for OneThreadOnly {
            fn out_schema(&self) -> &Schema {
                &self.schema
            }
            fn children(&self) -> Children<'_> {
                Children::Zero
            }
            fn thread_init(&self, tid: ThreadId) {
                let page = Page::new_local(Arc::new(NumaAllocator::new()), 4096, self.schema.tuple_size(), *b"Once");
                *self.outputs.get(tid) = Some(page);
            }
            fn scan_start(&self, _tid: ThreadId, _index_data: Option<&IndexData>) -> ResultCode {
                ResultCode::Ready
            }
            fn get_next(&self, tid: ThreadId) -> GetNextResult {
                let guard = self.outputs.get(tid);
                let out = guard.as_ref().unwrap().snapshot();
                drop(guard);
                out.clear();
                if tid == self.owner {
                    for &k in &self.keys {
                        let Some(slot) = out.allocate_tuple() else { break };
                        unsafe {
                            let bytes = k.to_ne_bytes();
                            self.schema.write_data(slot, 0, bytes.as_ptr());
                            self.schema.write_data(slot, 1, bytes.as_ptr());
                        }
                    }
                }
                GetNextResult::finished(out)
            }
            fn scan_stop(&self, _tid: ThreadId) -> ResultCode {
                ResultCode::Ready
            }
            fn thread_close(&self, _tid: ThreadId) {}
            fn destroy(&self) {}
        }

        let build: Arc<dyn Operator> = Arc::new(OneThreadOnly {
            schema: schema_ii(),
            owner: 0,
            keys: vec![7, 7, 7],
            outputs: PerThread::new(nthreads, |_| None),
        });
        let probe: Arc<dyn Operator> = Arc::new(OneThreadOnly {
            schema: schema_ii(),
            owner: 1,
            keys: vec![7, 7],
            outputs: PerThread::new(nthreads, |_| None),
        });

        let join: Arc<dyn Operator> = Arc::new(
            SortMergeJoinOp::new(
                build,
                probe,
                0,
                0,
                vec![ProjectionEntry { side: Side::Build, index: 1 }],
                4096,
                allocator,
                nthreads,
                None,
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..nthreads)
            .map(|tid| {
                let join = Arc::clone(&join);
                std::thread::spawn(move || super::super::drive_single_thread(&join, tid))
            })
            .collect();

        let mut total_rows = 0;
        for h in handles {
            let (code, pages) = h.join().unwrap();
            assert_eq!(code, ResultCode::Finished);
            total_rows += pages.iter().map(|p| p.tuple_count()).sum::<usize>();
        }
        // 3 build tuples x 2 probe tuples sharing key 7, found only by
        // crossing from build thread 0 to probe thread 1's staged page.
        assert_eq!(total_rows, 6);
    }

    #[test]
    fn old_mpsm_join_rewinds_build_between_probe_pages() {
        let allocator = Arc::new(NumaAllocator::new());

        let build_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, key.as_ptr());
        });
        // Small pages force multiple independent probe pages.
        let build: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 20, 4096, Arc::clone(&allocator), build_gen, 1));

        let probe_gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let key = (i as i32 % 20).to_ne_bytes();
            schema.write_data(ptr, 0, key.as_ptr());
            schema.write_data(ptr, 1, key.as_ptr());
        });
        let probe: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_ii(), 60, 16, Arc::clone(&allocator), probe_gen, 1));

        let join = OldMPSMJoinOp::new(
            build,
            probe,
            0,
            0,
            vec![ProjectionEntry { side: Side::Probe, index: 1 }],
            4096,
            allocator,
            1,
        )
        .unwrap();

        join.thread_init(0);
        assert_eq!(join.scan_start(0, None), ResultCode::Ready);
        let mut rows = 0;
        loop {
            let result = join.get_next(0);
            rows += result.page.tuple_count();
            if result.code != ResultCode::Ready {
                break;
            }
        }
        // every one of the 60 probe rows matches exactly one build row.
        assert_eq!(rows, 60);
    }
}
