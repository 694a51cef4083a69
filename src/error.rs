use thiserror::Error;

/// Errors surfaced below the operator protocol.
///
/// Lifecycle calls (`scanStart`, `getNext`, ...) signal failure through
/// `operator::ResultCode::Error`, not through this type -- a parent must
/// never unwind past a child's error, it has to propagate the code and
/// still reach its barrier arrivals. `PythiaError` is for the layer
/// underneath that protocol: building a plan, parsing configuration, and
/// the handful of places (persisted-state I/O, NUMA allocation) where an
/// OS call can fail outright.
#[derive(Error, Debug)]
pub enum PythiaError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("illegal type conversion: {0}")]
    IllegalConversion(String),

    #[error("runtime resource error: {0}")]
    Runtime(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("not yet implemented: {0}")]
    NotYetImplemented(&'static str),

    #[error("numa allocation failed: {0}")]
    Allocation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PythiaError>;
