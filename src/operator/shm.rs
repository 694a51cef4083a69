//! Persisted-state operators backed by POSIX shared memory: `MemSegmentWriter`
//! checkpoints a stream to a sequence of named segments as it passes
//! through; `MemMappedTable` is the corresponding leaf reader.
//!
//! Segments are named `<pathPrefix><7-digit counter>` (so `pathPrefix`
//! should itself start with `/`, per `shm_open`'s naming rule). A flush
//! that produced no tuples is simply skipped rather than leaving a
//! dangling empty segment. The counter is per-thread (each worker owns a
//! disjoint numbering via its thread id folded into the name) and it is
//! fatal to overflow the 7-digit space.

use super::{Children, GetNextResult, IndexData, Operator, PerThread, ResultCode, ThreadId};
use crate::memory::Page;
use crate::schema::Schema;
use std::ffi::CString;
use std::sync::Arc;

const MAX_COUNTER: usize = 9_999_999;

pub struct MemSegmentWriter {
    child: Arc<dyn Operator>,
    path_prefix: String,
    counters: PerThread<usize>,
}

impl MemSegmentWriter {
    pub fn new(child: Arc<dyn Operator>, path_prefix: String, max_threads: usize) -> Self {
        Self { child, path_prefix, counters: PerThread::new(max_threads, |_| 0usize) }
    }

    fn segment_name(&self, tid: ThreadId, counter: usize) -> String {
        format!("{}{}_{:07}", self.path_prefix, tid, counter)
    }

    fn persist(&self, tid: ThreadId, page: &Page) -> std::io::Result<()> {
        let len = page.used_space();
        if len == 0 {
            return Ok(());
        }
        let mut counter = self.counters.get(tid);
        if *counter > MAX_COUNTER {
            panic!("mem segment writer: counter overflow for prefix {}", self.path_prefix);
        }
        let name = self.segment_name(tid, *counter);
        *counter += 1;
        drop(counter);

        let cname = CString::new(name).expect("segment name must not contain NUL bytes");
        unsafe {
            let fd = libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600);
            if fd < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                libc::close(fd);
                return Err(std::io::Error::last_os_error());
            }
            let dst = libc::mmap(std::ptr::null_mut(), len, libc::PROT_WRITE, libc::MAP_SHARED, fd, 0);
            libc::close(fd);
            if dst == libc::MAP_FAILED {
                return Err(std::io::Error::last_os_error());
            }
            std::ptr::copy_nonoverlapping(page.as_ptr(), dst as *mut u8, len);
            libc::munmap(dst, len);
        }
        Ok(())
    }
}

impl Operator for MemSegmentWriter {
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
        if result.code != ResultCode::Error {
            if let Err(e) = self.persist(tid, &result.page) {
                tracing::warn!(error = %e, prefix = %self.path_prefix, "mem segment writer: persist failed");
            }
        }
        result
    }

    fn scan_stop(&self, tid: ThreadId) -> ResultCode {
        self.child.scan_stop(tid)
    }

    fn thread_close(&self, _tid: ThreadId) {}

    fn destroy(&self) {}
}

/// Reads back the segments `MemSegmentWriter` wrote, striping the
/// discovered segment files across however many threads scan this leaf.
pub struct MemMappedTable {
    path_prefix: String,
    schema: Schema,
    segments: Vec<(String, usize)>,
    emit: PerThread<usize>,
}

impl MemMappedTable {
    pub fn new(path_prefix: String, schema: Schema, max_threads: usize) -> std::io::Result<Self> {
        let segments = discover_segments(&path_prefix)?;
        Ok(Self { path_prefix, schema, segments, emit: PerThread::new(max_threads, |tid| tid) })
    }
}

fn discover_segments(path_prefix: &str) -> std::io::Result<Vec<(String, usize)>> {
    let basename = path_prefix.trim_start_matches('/');
    let mut found = vec![];
    for entry in std::fs::read_dir("/dev/shm")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix(basename) {
            if rest.split('_').count() == 2 {
                found.push(name);
            }
        }
    }
    found.sort();
    let mut out = vec![];
    for name in found {
        let len = std::fs::metadata(format!("/dev/shm/{name}"))?.len() as usize;
        out.push((format!("/{name}"), len));
    }
    Ok(out)
}

fn mmap_segment(name: &str, len: usize) -> std::io::Result<*mut u8> {
    let cname = CString::new(name).expect("segment name must not contain NUL bytes");
    unsafe {
        let fd = libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0o400);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_NORESERVE | libc::MAP_POPULATE,
            fd,
            0,
        );
        libc::close(fd);
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ptr as *mut u8)
    }
}

impl Operator for MemMappedTable {
    fn out_schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Children<'_> {
        Children::Zero
    }

    fn thread_init(&self, _tid: ThreadId) {}

    fn scan_start(&self, _tid: ThreadId, _index_data: Option<&IndexData>) -> ResultCode {
        ResultCode::Ready
    }

    fn get_next(&self, tid: ThreadId) -> GetNextResult {
        let max_threads = self.emit.len().max(1);
        let mut idx = self.emit.get(tid);
        while *idx < self.segments.len() {
            let (name, len) = &self.segments[*idx];
            *idx += max_threads;
            if *len == 0 {
                continue;
            }
            match mmap_segment(name, *len) {
                Ok(ptr) => {
                    let page = unsafe { Page::from_mmap(ptr, *len, self.schema.tuple_size()) };
                    let finished = *idx >= self.segments.len();
                    return if finished { GetNextResult::finished(page) } else { GetNextResult::ready(page) };
                }
                Err(e) => {
                    tracing::error!(error = %e, segment = %name, "mem mapped table: mmap failed");
                    return GetNextResult::error(unsafe { Page::from_mmap(std::ptr::null_mut(), 0, self.schema.tuple_size().max(1)) });
                }
            }
        }
        let empty = unsafe { Page::from_mmap(std::ptr::null_mut(), 0, self.schema.tuple_size().max(1)) };
        GetNextResult::finished(empty)
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
    use crate::memory::NumaAllocator;
    use crate::operator::stateless::IntGeneratorOp;
    use crate::schema::{ColumnSpec, ColumnType};

    fn schema_i() -> Schema {
        let mut s = Schema::new();
        s.add(ColumnSpec::new(ColumnType::Integer));
        s
    }

    #[test]
    fn round_trips_through_shared_memory_segments() {
        let allocator = Arc::new(NumaAllocator::new());
        let gen: Arc<dyn Fn(u64, &Schema, *mut u8) + Send + Sync> = Arc::new(|i, schema, ptr| unsafe {
            let v = (i as i32).to_ne_bytes();
            schema.write_data(ptr, 0, v.as_ptr());
        });
        let generator: Arc<dyn Operator> =
            Arc::new(IntGeneratorOp::new(schema_i(), 50, 64, allocator, gen, 1));

        let prefix = format!("/pythia_test_{}", std::process::id());
        let writer: Arc<dyn Operator> = Arc::new(MemSegmentWriter::new(generator, prefix.clone(), 1));

        writer.thread_init(0);
        writer.scan_start(0, None);
        let mut written = 0;
        loop {
            let result = writer.get_next(0);
            written += result.page.tuple_count();
            if result.code != ResultCode::Ready {
                break;
            }
        }
        writer.scan_stop(0);
        assert_eq!(written, 50);

        let reader = MemMappedTable::new(prefix, schema_i(), 1).unwrap();
        reader.thread_init(0);
        reader.scan_start(0, None);
        let mut read = 0;
        loop {
            let result = reader.get_next(0);
            read += result.page.tuple_count();
            if result.code != ResultCode::Ready {
                break;
            }
        }
        assert_eq!(read, 50);
    }
}
