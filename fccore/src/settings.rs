//! Engine-wide constants and per-group defaults.

use std::time::Duration;

// Deadlines.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(16);
pub const REQUEST_VM_TIMEOUT: Duration = Duration::from_secs(8);
pub const STORAGE_TIMEOUT: Duration = Duration::from_secs(10);
pub const ERROR_HANDLING_TIMEOUT: Duration = Duration::from_secs(1);
pub const STREAM_HANDLING_TIMEOUT: Duration = Duration::from_secs(2);
pub const STORAGE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);
pub const STORAGE_DESERIALIZE_TIMEOUT: Duration = Duration::from_secs(2);
pub const ASYNC_STORAGE_TIMEOUT: Duration = Duration::from_secs(15);
pub const RESV_QUEUE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEBUG_TIMEOUT: Duration = Duration::from_secs(3600);
pub const SMP_TIMEOUT: Duration = Duration::from_secs(8);
/// Wait for the post-boot run back to the request-waiting state.
pub const RESUME_CATCHUP_TIMEOUT: Duration = Duration::from_secs(1);

// Memory defaults (group values are configured in MiB).
pub const MAIN_MEMORY_MB: u64 = 64;
pub const REQUEST_MEMORY_MB: u64 = 32;
pub const REQUEST_MEMORY_AFTER_RESET_MB: u64 = 16;
pub const SHARED_MEMORY_MB: u64 = 0;

pub const MAIN_STACK_SIZE: u64 = 4 << 20;
pub const BACKEND_INPUTS_SIZE: u64 = 64 << 10;
/// Hard cap on a buffered POST body.
pub const POST_BUFFER_MAX: u64 = 1 << 29;
pub const CONTENT_TYPE_MAX: u64 = 0x1000;
pub const REQUEST_HEADER_MAX: usize = 64;
pub const RESPONSE_HEADER_MAX: usize = 64;

pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_REGEX: usize = 64;
pub const DEFAULT_MAX_FD: usize = 32;
pub const SMP_MAX_CPUS: usize = 16;
pub const SMP_STACK_SIZE: u64 = 512 * 1024;

pub const STORAGE_BUFFER_MAX: usize = 64;
pub const STORAGE_TASK_MAX_TIMERS: usize = 32;
pub const STORAGE_TASK_MAX_ARGUMENT: u64 = 64 << 10;
/// Async storage tasks wait this long for program initialization.
pub const STORAGE_TASK_INIT_WAIT: Duration = Duration::from_secs(5);

pub const SELF_REQUEST_MAX_CONCURRENCY: usize = 8;
pub const SELF_REQUEST_MAX_RESPONSE: u64 = 16 << 20;

/// Guest-registered entry points, stable indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ProgramEntry {
    OnRecv = 0,
    BackendGet = 1,
    BackendPost = 2,
    BackendMethod = 3,
    BackendStream = 4,
    BackendError = 5,
    LiveupdSerialize = 6,
    LiveupdDeserialize = 7,
    SocketPauseResumeApi = 12,
}

pub const ENTRY_COUNT: usize = 13;

/// The guest-visible name of the writable state file.
pub const GUEST_STATE_FILE: &str = "state";
