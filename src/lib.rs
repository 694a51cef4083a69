//! Pythia: an in-memory, NUMA-aware, push-pull relational query engine.
//!
//! The crate is organized bottom-up, mirroring how a plan is actually
//! assembled: typed tuple layout (`schema`), NUMA-aware paged memory
//! (`memory`), the hash table shared by hash join and hash aggregation
//! (`hashtable`), the barrier/thread-group primitives (`concurrent`),
//! the operator protocol and its physical operators (`operator`), and
//! the two layers around that core: thread-to-core placement
//! (`affinity`) and the typed configuration structs a plan is built
//! from (`config`).

pub mod affinity;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod hashtable;
pub mod memory;
pub mod operator;
pub mod schema;

pub use error::{PythiaError, Result};
