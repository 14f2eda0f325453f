use std::fmt::Display;

/// Enumeration representing the various errors that can occur within gsched.
#[derive(Debug)]
pub enum SchedError {
    /// Graph allocation failed even after reserving fresh buffers
    AllocationFailed,
    /// Access outside of the bytes owned by a tensor
    OutOfBounds(Box<str>),
    /// Tensor has no buffer or no data address
    NotAllocated(Box<str>),
    /// Error from file operations
    IOError(std::io::Error),
    /// Error parsing config or backend parameters
    ParseError(Box<str>),
    /// Error returned by backends
    BackendError(BackendError),
}

impl SchedError {
    /// Parse error
    #[track_caller]
    pub fn parse_error(e: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        let e: String = e.into();
        Self::ParseError(format!("{e}, {}:{}:{}", location.file(), location.line(), location.column()).into())
    }
}

impl Display for SchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedError::AllocationFailed => f.write_str("Failed to allocate graph"),
            SchedError::OutOfBounds(e) => f.write_fmt(format_args!("Out of bounds {e}")),
            SchedError::NotAllocated(e) => f.write_fmt(format_args!("Not allocated {e}")),
            SchedError::IOError(e) => f.write_fmt(format_args!("IO {e}")),
            SchedError::ParseError(e) => f.write_fmt(format_args!("Parse {e}")),
            SchedError::BackendError(e) => f.write_fmt(format_args!("Backend {e}")),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<std::io::Error> for SchedError {
    #[track_caller]
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl From<BackendError> for SchedError {
    fn from(value: BackendError) -> Self {
        SchedError::BackendError(value)
    }
}

/// Error reported by a backend, its buffers or its events.
#[derive(Debug)]
pub struct BackendError {
    /// What kind of failure it is
    pub status: ErrorStatus,
    /// Human readable detail
    pub context: Box<str>,
}

impl BackendError {
    /// Creates new error with given status
    pub fn new(status: ErrorStatus, context: impl Into<Box<str>>) -> BackendError {
        BackendError { status, context: context.into() }
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}: {}", self.status, self.context))
    }
}

impl std::error::Error for BackendError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Backend initialization failure
    Initialization,
    /// Failed to allocate memory
    MemoryAllocation,
    /// Failed to copy memory between host and device or between devices
    MemoryCopy,
    /// Access outside of a tensor or buffer
    OutOfBounds,
    /// Tensor is not backed by memory
    NotAllocated,
    /// Computation of a node failed
    Compute,
    /// Computation was stopped by the abort callback
    Aborted,
    /// Operation is not implemented by the backend
    UnsupportedOp,
    /// Failed to record or wait for an event
    Event,
}
