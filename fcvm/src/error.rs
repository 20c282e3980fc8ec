use thiserror::Error;

/// Terminal outcomes of running a VM. The three kinds are reported
/// distinctly so callers can treat a deadline expiry, a bad guest memory
/// access and a guest-raised trap differently.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm call timed out after {0:.3}s")]
    Timeout(f32),

    #[error("memory fault at 0x{addr:x} (size 0x{size:x})")]
    MemoryFault { addr: u64, size: u64 },

    #[error("machine exception: {msg} (data: 0x{data:x})")]
    Exception { msg: String, data: u64 },
}

impl VmError {
    pub fn exception(msg: impl Into<String>) -> Self {
        VmError::Exception { msg: msg.into(), data: 0 }
    }

    pub fn exception_data(msg: impl Into<String>, data: u64) -> Self {
        VmError::Exception { msg: msg.into(), data }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, VmError::Timeout(_))
    }
}
