//! Concurrency primitives shared by the operator runtime.

mod barrier;

pub use barrier::Barrier;
