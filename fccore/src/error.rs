use thiserror::Error;

use fcvm::VmError;

/// Program loading failures (fetch, decode, verify).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("empty program payload")]
    EmptyPayload,
    #[error("invalid ELF program: {0}")]
    InvalidElf(#[from] fcvm::image::ImageError),
    #[error("program archive error: {0}")]
    ArchiveDecode(String),
    #[error("program fetch failed: {0}")]
    NetworkFailed(String),
    #[error("program not accessible: {0}")]
    PermissionDenied(String),
    #[error("program hash mismatch (expected {expected}, got {actual})")]
    HashMismatch { expected: String, actual: String },
    #[error("unreachable program: no filename or URI")]
    Unreachable,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures on the request path, as seen by the dispatcher's caller.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("request timed out after {0:.3}s")]
    Timeout(f32),
    #[error("guest memory fault at 0x{addr:x} (size 0x{size:x})")]
    MemoryFault { addr: u64, size: u64 },
    #[error("guest exception: {msg} (data: 0x{data:x})")]
    MachineException { msg: String, data: u64 },
    #[error("HTTP response not set. Program crashed? Check logs!")]
    ResponseNotSet,
    #[error("invalid HTTP status code returned by program: {0}")]
    BadStatusCode(u16),
    #[error("reservation queue timeout")]
    QueueTimeout,
    #[error("no program loaded: {0}")]
    NoProgram(String),
    #[error("the VM executor is gone")]
    ExecutorGone,
    #[error("{0}")]
    Failed(String),
}

impl From<VmError> for CallError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Timeout(secs) => CallError::Timeout(secs),
            VmError::MemoryFault { addr, size } => CallError::MemoryFault { addr, size },
            VmError::Exception { msg, data } => CallError::MachineException { msg, data },
        }
    }
}

impl CallError {
    /// Status code the front-end should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            CallError::QueueTimeout | CallError::NoProgram(_) => 503,
            _ => 500,
        }
    }
}
