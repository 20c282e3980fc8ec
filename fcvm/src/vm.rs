use std::time::Duration;

use crate::error::VmError;
use crate::image::Image;
use crate::interp;
use crate::mem::Memory;
use crate::{VirtualRemapping, CALL_RETURN_ADDR, PAGE_SIZE};

/// Host handler for guest syscalls. Installed per-run; has full access to
/// registers and memory and may call `Vm::stop` to halt the VM.
pub trait SyscallPort {
    fn syscall(&mut self, vm: &mut Vm, nr: u32) -> Result<(), VmError>;
}

/// A no-op port for runs that must not reach the host.
pub struct DenySyscalls;
impl SyscallPort for DenySyscalls {
    fn syscall(&mut self, _vm: &mut Vm, nr: u32) -> Result<(), VmError> {
        Err(VmError::exception_data("unexpected system call", nr as u64))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl Registers {
    pub fn get(&self, i: usize) -> u64 {
        match i {
            0 => self.rax,
            1 => self.rdi,
            2 => self.rsi,
            3 => self.rdx,
            4 => self.rcx,
            5 => self.r8,
            6 => self.r9,
            7 => self.r10,
            8 => self.r11,
            9 => self.rsp,
            _ => unreachable!("register index out of range"),
        }
    }

    pub fn set(&mut self, i: usize, v: u64) {
        match i {
            0 => self.rax = v,
            1 => self.rdi = v,
            2 => self.rsi = v,
            3 => self.rdx = v,
            4 => self.rcx = v,
            5 => self.r8 = v,
            6 => self.r9 = v,
            7 => self.r10 = v,
            8 => self.r11 = v,
            9 => self.rsp = v,
            _ => unreachable!("register index out of range"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Address-space cap; accesses beyond it fault.
    pub max_address: u64,
    /// Gigapage-aligned virtual base derived from the image entry.
    pub vmem_base: u64,
    pub remappings: Vec<VirtualRemapping>,
    // Advisory knobs a hardware binding would act on.
    pub hugepages: bool,
    pub transparent_hugepages: bool,
    pub split_hugepages: bool,
    pub relocate_fixed_mmap: bool,
    pub heap_executable: bool,
    pub verbose: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            max_address: 64 << 20,
            vmem_base: 0,
            remappings: Vec::new(),
            hugepages: false,
            transparent_hugepages: false,
            split_hugepages: true,
            relocate_fixed_mmap: true,
            heap_executable: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForkOptions {
    /// Working-memory cap for the fork (its private CoW banks).
    pub max_cow_mem: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    /// Keep the fork's written pages instead of restoring the parent's.
    pub keep_all_work_memory: bool,
}

const MMAP_GUARD: u64 = 1 << 20;

pub struct Vm {
    pub regs: Registers,
    mem: Memory,
    stopped: bool,
    stack_addr: u64,
    mmap_next: u64,
}

impl Vm {
    /// Load an image into a fresh address space. Segment bytes are not
    /// charged against any working-memory budget; call `set_memory_limit`
    /// afterwards to cap the boot working set.
    pub fn load(image: &Image, options: &VmOptions) -> Result<Vm, VmError> {
        let mut mem = Memory::new(options.max_address);
        for seg in &image.segments {
            if !seg.data.is_empty() {
                mem.write(seg.vaddr, &seg.data)?;
            }
        }
        for r in &options.remappings {
            let end = r.virt.checked_add(r.size).ok_or(VmError::MemoryFault { addr: r.virt, size: r.size })?;
            if end > options.max_address {
                return Err(VmError::MemoryFault { addr: r.virt, size: r.size });
            }
        }
        let load_end = image.load_end().max(options.vmem_base);
        let mmap_next = (load_end + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE + MMAP_GUARD;
        let regs = Registers { rip: image.entry, ..Default::default() };
        Ok(Vm { regs, mem, stopped: false, stack_addr: 0, mmap_next })
    }

    pub fn set_memory_limit(&mut self, limit: Option<u64>) {
        self.mem.set_owned_limit(limit);
    }

    pub fn mem(&self) -> &Memory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    pub fn max_address(&self) -> u64 {
        self.mem.max_addr()
    }

    /// Bytes of private working memory (memory banks) this VM owns.
    pub fn banked_bytes(&self) -> u64 {
        self.mem.owned_bytes()
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub(crate) fn clear_stopped(&mut self) {
        self.stopped = false;
    }

    pub fn stack_address(&self) -> u64 {
        self.stack_addr
    }

    pub fn set_stack_address(&mut self, addr: u64) {
        self.stack_addr = addr;
    }

    /// CoW fork. The child shares all pages with the parent and gets a fresh
    /// working-memory budget.
    pub fn fork(&self, options: ForkOptions) -> Vm {
        Vm {
            regs: self.regs,
            mem: self.mem.fork(options.max_cow_mem),
            stopped: self.stopped,
            stack_addr: self.stack_addr,
            mmap_next: self.mmap_next,
        }
    }

    /// Restore this VM to the parent snapshot: registers, stack and mmap
    /// state always; pages too unless `keep_all_work_memory`.
    pub fn reset_to(&mut self, parent: &Vm, options: ResetOptions) {
        self.mem.reset_to(&parent.mem, options.keep_all_work_memory);
        self.regs = parent.regs;
        self.stopped = parent.stopped;
        self.stack_addr = parent.stack_addr;
        self.mmap_next = parent.mmap_next;
    }

    /// Bump-allocate an anonymous mapping.
    pub fn mmap_allocate(&mut self, size: u64) -> Result<u64, VmError> {
        let aligned = (size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        let addr = self.mmap_next;
        let end = addr.checked_add(aligned).ok_or(VmError::MemoryFault { addr, size })?;
        if end > self.mem.max_addr() {
            return Err(VmError::MemoryFault { addr, size });
        }
        self.mmap_next = end;
        Ok(addr)
    }

    /// Push bytes onto a descending stack, 8-byte aligned; returns the guest
    /// address of the data.
    pub fn stack_push(&mut self, sp: &mut u64, data: &[u8]) -> Result<u64, VmError> {
        let mut p = sp.checked_sub(data.len() as u64).ok_or(VmError::MemoryFault { addr: *sp, size: data.len() as u64 })?;
        p &= !7u64;
        self.mem.write(p, data)?;
        *sp = p;
        Ok(p)
    }

    pub fn stack_push_cstr(&mut self, sp: &mut u64, s: &str) -> Result<u64, VmError> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.stack_push(sp, &bytes)
    }

    /// Linux-style process stack: argc, argv pointers, NULL, envp pointers,
    /// NULL. Leaves rsp pointing at argc.
    pub fn setup_linux(&mut self, args: &[String], envp: &[String]) -> Result<(), VmError> {
        let mut sp = self.stack_addr;
        let mut argv = Vec::with_capacity(args.len());
        for a in args {
            argv.push(self.stack_push_cstr(&mut sp, a)?);
        }
        let mut envv = Vec::with_capacity(envp.len());
        for e in envp {
            envv.push(self.stack_push_cstr(&mut sp, e)?);
        }
        let mut vec: Vec<u64> = Vec::with_capacity(args.len() + envp.len() + 3);
        vec.push(args.len() as u64);
        vec.extend_from_slice(&argv);
        vec.push(0);
        vec.extend_from_slice(&envv);
        vec.push(0);
        let mut bytes = Vec::with_capacity(vec.len() * 8);
        for v in &vec {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        // keep the vector 16-byte aligned
        sp &= !15u64;
        let addr = self.stack_push(&mut sp, &bytes)?;
        self.regs.rsp = addr;
        self.stack_addr = addr;
        Ok(())
    }

    /// Synthesize a call frame: sentinel return address, entry `rip`,
    /// SysV-style argument registers.
    pub fn setup_call(&mut self, func: u64, stack: u64, args: &[u64]) -> Result<(), VmError> {
        assert!(args.len() <= 6, "too many vmcall arguments");
        let mut sp = stack & !15u64;
        sp -= 8;
        self.mem.write_u64(sp, CALL_RETURN_ADDR)?;
        let mut regs = Registers { rip: func, rsp: sp, ..Default::default() };
        for (i, a) in args.iter().enumerate() {
            regs.set(1 + i, *a); // rdi, rsi, rdx, rcx, r8, r9
        }
        self.regs = regs;
        self.stopped = false;
        Ok(())
    }

    /// Run from the current register state until the guest halts (a syscall
    /// called `stop`), returns to the host, faults, or the deadline expires.
    pub fn run(&mut self, timeout: Duration, port: &mut dyn SyscallPort) -> Result<(), VmError> {
        interp::run(self, timeout, port)
    }

    pub fn timed_vmcall(
        &mut self,
        func: u64,
        timeout: Duration,
        args: &[u64],
        port: &mut dyn SyscallPort,
    ) -> Result<(), VmError> {
        self.setup_call(func, self.stack_addr, args)?;
        self.run(timeout, port)
    }

    pub fn timed_vmcall_stack(
        &mut self,
        func: u64,
        stack: u64,
        timeout: Duration,
        args: &[u64],
        port: &mut dyn SyscallPort,
    ) -> Result<(), VmError> {
        self.setup_call(func, stack, args)?;
        self.run(timeout, port)
    }

    /// Copy a guest range from another VM into this one.
    pub fn copy_from_vm(&mut self, dst: u64, src_vm: &Vm, src: u64, len: u64) -> Result<(), VmError> {
        let data = src_vm.mem.read_vec(src, len)?;
        self.mem.write(dst, &data)
    }

    /// Describe a guest range as non-owning buffer descriptors for zero-copy
    /// harvesting. The range is validated against the address space.
    pub fn gather_buffers_from_range(&self, addr: u64, len: u64) -> Result<Vec<(u64, u64)>, VmError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        // probe both ends so a bad range faults now, not at delivery time
        self.mem.read_u8(addr)?;
        self.mem.read_u8(addr + len - 1)?;
        Ok(vec![(addr, len)])
    }
}
