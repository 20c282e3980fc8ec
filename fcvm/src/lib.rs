// fcvm is the sandbox layer of the engine: a deterministic, in-process
// micro-VM. Guest programs are ELF64 images whose loadable segments carry
// fcvm's compact instruction encoding; the interpreter executes them under a
// wall-clock deadline with sparse copy-on-write guest memory, so a booted VM
// can be forked into many request VMs and reset back to the boot snapshot.
//
// The public surface deliberately mirrors what a hardware-virtualized binding
// has to offer: load/run/vmcall/resume with distinct timeout, memory-fault
// and exception outcomes, fork + reset-to-snapshot, host<->guest copies,
// synthesized call frames, and a host syscall port. A KVM-backed engine can
// sit behind the same calls.

pub mod asm;
pub mod error;
pub mod image;
pub mod mem;
pub mod vm;

mod interp;

pub use error::VmError;
pub use vm::{ForkOptions, Registers, ResetOptions, SyscallPort, Vm, VmOptions};

/// Virtual memory remapping applied at load time.
#[derive(Debug, Clone)]
pub struct VirtualRemapping {
    pub virt: u64,
    pub size: u64,
    pub writable: bool,
    pub executable: bool,
}

pub const PAGE_SIZE: u64 = 4096;

/// Synthesized return address pushed by `setup_call`. A guest `ret` landing
/// here ends the run with `stopped() == false`.
pub const CALL_RETURN_ADDR: u64 = 0xffff_ffff_ffff_0000;
