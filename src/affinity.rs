//! Affinitizer: a mapping from thread id to `(numa, socket, core,
//! context)` used to bind worker threads to specific CPUs and to steer
//! each thread's page allocations to its local NUMA node.
//!
//! Binding is advisory outside Linux, and `pin_current_thread` is a
//! no-op everywhere the scheduler doesn't expose `sched_setaffinity`.

use crate::error::{PythiaError, Result};
use crate::memory::NumaNode;
use crate::operator::ThreadId;
use std::collections::HashMap;

/// Where one thread id is pinned: the core it runs on, the socket and
/// NUMA node that core belongs to, and which hardware context (SMT
/// sibling) within the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuPlacement {
    pub numa: NumaNode,
    pub socket: u16,
    pub core: u16,
    pub context: u16,
}

/// The full tid -> placement map for one plan's worker threads.
pub struct Affinitizer {
    map: HashMap<ThreadId, CpuPlacement>,
}

impl Affinitizer {
    pub fn new(map: HashMap<ThreadId, CpuPlacement>) -> Self {
        Self { map }
    }

    /// Spread `nthreads` round-robin over `nnodes` NUMA nodes, one
    /// context per core (no SMT siblings), sockets mirroring nodes
    /// one-to-one -- the common single-context-per-core layout.
    pub fn round_robin(nthreads: usize, nnodes: u16) -> Self {
        let nnodes = nnodes.max(1);
        let map = (0..nthreads)
            .map(|tid| {
                let numa = (tid as u16) % nnodes;
                let core = (tid as u16) / nnodes;
                (tid, CpuPlacement { numa, socket: numa, core, context: 0 })
            })
            .collect();
        Self { map }
    }

    /// Every thread pinned to the same, single node -- the degenerate
    /// affinitizer for single-socket or test topologies.
    pub fn single_node(nthreads: usize) -> Self {
        Self::round_robin(nthreads, 1)
    }

    /// One thread per physical core on this host, single NUMA node
    /// (this crate has no `libnuma` binding to discover real topology).
    pub fn for_host(nnodes: u16) -> Self {
        Self::round_robin(num_cpus::get_physical(), nnodes)
    }

    pub fn placement(&self, tid: ThreadId) -> Result<CpuPlacement> {
        self.map
            .get(&tid)
            .copied()
            .ok_or_else(|| PythiaError::Configuration(format!("no affinity entry for thread {tid}")))
    }

    pub fn node_for(&self, tid: ThreadId) -> NumaNode {
        self.map.get(&tid).map(|p| p.numa).unwrap_or(0)
    }

    /// Pin the calling thread to its assigned core.
    #[cfg(target_os = "linux")]
    pub fn pin_current_thread(&self, tid: ThreadId) -> Result<()> {
        let placement = self.placement(tid)?;
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(placement.core as usize, &mut set);
            let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            if rc != 0 {
                return Err(PythiaError::Runtime(format!(
                    "sched_setaffinity failed for thread {tid} core {}: {}",
                    placement.core,
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn pin_current_thread(&self, tid: ThreadId) -> Result<()> {
        self.placement(tid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_stripes_tids_across_nodes() {
        let aff = Affinitizer::round_robin(6, 3);
        assert_eq!(aff.node_for(0), 0);
        assert_eq!(aff.node_for(1), 1);
        assert_eq!(aff.node_for(2), 2);
        assert_eq!(aff.node_for(3), 0);
        assert_eq!(aff.placement(3).unwrap().core, 1);
    }

    #[test]
    fn unknown_tid_is_a_configuration_error() {
        let aff = Affinitizer::single_node(2);
        assert!(aff.placement(5).is_err());
    }

    #[test]
    fn pin_current_thread_succeeds_for_a_known_tid() {
        let aff = Affinitizer::single_node(1);
        assert!(aff.pin_current_thread(0).is_ok());
    }
}
