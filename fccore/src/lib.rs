// Multi-tenant compute core. Each tenant supplies an ELF program; the engine
// boots it once into a long-lived main VM, then fork-clones that VM into a
// pool of request VMs which serve calls concurrently. A request VM is
// reserved through a per-NUMA-node blocking queue, driven to completion
// under a deadline, harvested, and reset (or kept warm) for the next call.
// Programs may also run a storage VM shared across requests of the same
// tenant, reached through a serialized task queue, which doubles as the
// state-transfer channel during live updates.
//
// Everything that touches a VM's virtual CPU happens on that VM's dedicated
// executor thread; reserving a VM transfers the right to submit work to it,
// never the VM itself.

pub mod binary;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod loader;
pub mod machine;
pub mod program;
pub mod regex_cache;
pub mod registry;
pub mod settings;
pub mod storage;
pub mod syscalls;
pub mod tenant;
pub mod tenant_instance;
pub mod timer;
pub mod util;

pub use binary::BinaryStorage;
pub use dispatch::{backend_call, collect_body, stream_next, BackendBody, BackendResult, CallInputs};
pub use error::{CallError, LoadError};
pub use program::{ProgramInstance, ProgramSource, Reservation};
pub use registry::TenantRegistry;
pub use tenant::{TenantConfig, TenantGroup};
pub use tenant_instance::TenantInstance;
