//! One VM plus its per-request host state. A `MachineInstance` is always
//! driven from a single thread: the program's init thread for the main VM,
//! a pool executor thread for request VMs, the storage executor thread for
//! the storage VM. That is what makes the register/flag fields here safe as
//! plain data.

use std::sync::{Arc, OnceLock};

use log::{error, info};

use fcvm::image::{self, BinaryKind};
use fcvm::{ForkOptions, ResetOptions, Vm, VmError, VmOptions};

use crate::binary::BinaryStorage;
use crate::dispatch::{self, CallInputs};
use crate::program::ProgramCore;
use crate::regex_cache::RegexCache;
use crate::settings;
use crate::tenant::TenantConfig;

pub const DYNAMIC_LINKER_PATH: &str = "/lib64/ld-linux-x86-64.so.2";

static DYNAMIC_LOADER: OnceLock<BinaryStorage> = OnceLock::new();

/// Install the loader image substituted for dynamically linked programs
/// (the engine's ld-linux equivalent). Without one, dynamic programs fail
/// to boot.
pub fn install_dynamic_loader(loader: BinaryStorage) {
    let _ = DYNAMIC_LOADER.set(loader);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct CacheControl {
    pub cached: bool,
    pub ttl: f32,
    pub grace: f32,
    pub keep: f32,
}

/// Host-side view of the request currently inside the VM. HTTP syscalls
/// operate on this; the harvest folds it into the backend result.
#[derive(Debug, Default, Clone)]
pub struct RequestCtx {
    pub method: String,
    pub url: String,
    pub argument: String,
    pub content_type: String,
    pub req_headers: Vec<String>,
    pub resp_headers: Vec<String>,
    pub cache: Option<CacheControl>,
}

impl RequestCtx {
    pub fn from_inputs(inputs: &CallInputs) -> Self {
        RequestCtx {
            method: inputs.method.clone(),
            url: inputs.url.clone(),
            argument: inputs.argument.clone(),
            content_type: inputs.content_type.clone(),
            req_headers: inputs.headers.clone(),
            resp_headers: Vec::new(),
            cache: None,
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct MachineStats {
    pub invocations: u64,
    pub resets: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub status_unknown: u64,
    pub request_cpu_time: f64,
    pub error_cpu_time: f64,
    pub vm_reset_time: f64,
}

impl MachineStats {
    pub fn count_status(&mut self, status: u16) {
        match status {
            200..=299 => self.status_2xx += 1,
            300..=399 => self.status_3xx += 1,
            400..=499 => self.status_4xx += 1,
            500..=599 => self.status_5xx += 1,
            _ => self.status_unknown += 1,
        }
    }
}

/// Host state bound to one VM; doubles as the VM's syscall port.
pub struct MachineEnv {
    pub tenant: Arc<TenantConfig>,
    pub core: Arc<ProgramCore>,
    pub ctx: Option<RequestCtx>,
    pub is_storage: bool,
    pub is_debug: bool,
    pub is_ephemeral: bool,
    pub is_warming_up: bool,
    pub waiting_for_requests: bool,
    pub response_called: u8,
    pub reset_needed: bool,
    pub binary_kind: BinaryKind,
    pub regex: RegexCache,
    pub stats: MachineStats,
    pub post_data: u64,
    pub post_size: u64,
    pub inputs_allocation: u64,
}

impl MachineEnv {
    pub fn name(&self) -> &str {
        &self.tenant.name
    }

    pub fn shared_memory_size(&self) -> u64 {
        self.tenant.group.shared_memory
    }

    pub fn shared_memory_boundary(&self) -> u64 {
        if self.shared_memory_size() > 0 {
            self.tenant.group.max_address_space - self.shared_memory_size()
        } else {
            u64::MAX
        }
    }

    /// Guest print output: logged, and copied to stdout when configured.
    pub fn print(&self, text: &str) {
        let text = text.trim_end_matches('\n');
        if text.is_empty() {
            return;
        }
        info!("{} says: {}", self.name(), text);
        if self.tenant.group.print_stdout {
            println!(">>> [{}] {}", self.name(), text);
        }
    }
}

pub struct MachineInstance {
    pub vm: Vm,
    pub env: MachineEnv,
}

impl MachineInstance {
    /// Construct and boot a main (or storage) VM per the boot policy:
    /// gigapage base from the entry address, loader substitution for
    /// dynamic programs, a 4 MiB main stack above the heap, configured
    /// remappings, Linux argv/envp with the KVM_* variables, then run up to
    /// `max_boot_time` until the guest waits for requests.
    pub fn boot_main(
        binary: &BinaryStorage,
        tenant: Arc<TenantConfig>,
        core: Arc<ProgramCore>,
        is_storage: bool,
        is_debug: bool,
    ) -> Result<MachineInstance, String> {
        let image = image::parse(binary.data()).map_err(|e| e.to_string())?;
        if image.entry >> 30 >= 64 {
            return Err("invalid ELF start address (address was > 64GB)".to_string());
        }
        let vmem_base = (image.entry >> 30) << 30;
        let group = &tenant.group;

        let (exec_image, mut args) = if image.interpreter.is_some() {
            // dynamically linked: boot the loader with the program path as
            // its first argument; the program must be guest-readable
            let loader = DYNAMIC_LOADER
                .get()
                .ok_or_else(|| "dynamic program but no dynamic loader installed".to_string())?;
            let loader_image = image::parse(loader.data()).map_err(|e| e.to_string())?;
            (loader_image, vec![DYNAMIC_LINKER_PATH.to_string(), tenant.filename.clone()])
        } else {
            (image.clone(), vec![tenant.name.clone()])
        };
        if let Some(extra) = group.main_arguments.load_full() {
            args.extend(extra.iter().cloned());
        }

        let options = VmOptions {
            max_address: group.max_address_space,
            vmem_base,
            remappings: group.vmem_remappings.clone(),
            hugepages: group.hugepages,
            transparent_hugepages: group.transparent_hugepages,
            split_hugepages: group.split_hugepages,
            relocate_fixed_mmap: group.relocate_fixed_mmap,
            heap_executable: group.vmem_heap_executable,
            verbose: group.verbose,
        };
        let mut vm = Vm::load(&exec_image, &options).map_err(|e| e.to_string())?;
        vm.set_memory_limit(Some(group.max_main_memory));

        // Some runtimes misbehave when the stack sits below program and
        // heap; place the main stack above both.
        let stack = vm.mmap_allocate(settings::MAIN_STACK_SIZE).map_err(|e| e.to_string())?;
        let stack_end = stack + settings::MAIN_STACK_SIZE;
        vm.set_stack_address(stack_end);

        let mut envp = group.environ.clone();
        envp.push(format!("KVM_NAME={}", tenant.name));
        envp.push(format!("KVM_GROUP={}", group.name));
        envp.push(format!("KVM_TYPE={}", if is_storage { "storage" } else { "request" }));
        envp.push(format!("KVM_STATE={}", settings::GUEST_STATE_FILE));
        envp.push(format!("KVM_DEBUG={}", is_debug as u8));
        vm.setup_linux(&args, &envp).map_err(|e| e.to_string())?;

        let env = MachineEnv {
            regex: RegexCache::new(group.max_regex),
            is_ephemeral: group.ephemeral,
            tenant: tenant.clone(),
            core,
            ctx: None,
            is_storage,
            is_debug,
            is_warming_up: false,
            waiting_for_requests: false,
            response_called: 0,
            reset_needed: false,
            binary_kind: image.kind,
            stats: MachineStats::default(),
            post_data: 0,
            post_size: 0,
            inputs_allocation: 0,
        };
        let mut mi = MachineInstance { vm, env };

        if let Err(e) = mi.run(group.max_boot_time) {
            error!("machine not initialized properly: {}: {}", tenant.name, e);
            return Err(e.to_string());
        }
        if !mi.env.waiting_for_requests {
            return Err(
                "the program was not waiting for requests. Did you forget to call 'wait_for_requests()'?"
                    .to_string(),
            );
        }

        if !is_storage && mi.env.tenant.group.warmup.is_some() {
            mi.warmup()?;
        }

        // Future vmcalls use a stack base just below the boot-time rsp so
        // stack-allocated state in main survives (red-zone safe).
        let rsp = mi.vm.regs.rsp;
        if rsp >= stack && rsp < stack_end {
            mi.vm.set_stack_address((rsp - 128) & !0xf);
        }
        Ok(mi)
    }

    /// Fork a request VM off the booted main VM: CoW pages, a smaller
    /// working-memory cap, the regex cache loaned from the parent.
    pub fn fork(source: &MachineInstance, _reqid: u32) -> MachineInstance {
        let tenant = source.env.tenant.clone();
        let vm = source.vm.fork(ForkOptions { max_cow_mem: tenant.group.max_req_memory });
        let mut regex = RegexCache::new(tenant.group.max_regex);
        regex.reset_and_loan(&source.env.regex);
        MachineInstance {
            vm,
            env: MachineEnv {
                core: source.env.core.clone(),
                ctx: None,
                is_storage: false,
                is_debug: source.env.is_debug,
                is_ephemeral: source.env.is_ephemeral,
                is_warming_up: false,
                // if we got this far, the snapshot is waiting
                waiting_for_requests: true,
                response_called: 0,
                reset_needed: false,
                binary_kind: source.env.binary_kind,
                regex,
                stats: MachineStats::default(),
                post_data: 0,
                post_size: 0,
                inputs_allocation: 0,
                tenant,
            },
        }
    }

    pub fn run(&mut self, timeout: std::time::Duration) -> Result<(), VmError> {
        let MachineInstance { vm, env } = self;
        vm.run(timeout, env)
    }

    pub fn timed_vmcall(&mut self, func: u64, timeout: std::time::Duration, args: &[u64]) -> Result<(), VmError> {
        let MachineInstance { vm, env } = self;
        vm.timed_vmcall(func, timeout, args, env)
    }

    pub fn timed_vmcall_stack(
        &mut self,
        func: u64,
        stack: u64,
        timeout: std::time::Duration,
        args: &[u64],
    ) -> Result<(), VmError> {
        let MachineInstance { vm, env } = self;
        vm.timed_vmcall_stack(func, stack, timeout, args, env)
    }

    pub fn name(&self) -> &str {
        &self.env.tenant.name
    }

    pub fn max_req_time(&self) -> std::time::Duration {
        self.env.tenant.max_req_time(self.env.is_debug)
    }

    /// Force the guest through the response syscalls before we trust any
    /// response registers.
    pub fn begin_call(&mut self) {
        self.env.response_called = 0;
    }

    pub fn response_called(&self, n: u8) -> bool {
        self.env.response_called == n
    }

    /// POST body area, mremap-style: grows, never shrinks within a request.
    pub fn allocate_post_data(&mut self, bytes: u64) -> Result<u64, VmError> {
        if self.env.post_size < bytes {
            self.env.post_data = self.vm.mmap_allocate(bytes)?;
            self.env.post_size = bytes;
        }
        Ok(self.env.post_data)
    }

    /// Per-request host state that must not leak across requests.
    pub fn tail_reset(&mut self) {
        self.env.regex.drop_owned();
        self.env.ctx = None;
    }

    /// Reset discipline: a VM is rolled back iff it is ephemeral or a fault
    /// marked it. Working memory may be kept when configured and the VM is
    /// healthy and within its post-request budget.
    pub fn maybe_reset(&mut self, source: &MachineInstance) {
        let reset_needed = self.env.reset_needed || self.env.is_ephemeral;
        if !reset_needed {
            return;
        }
        self.env.stats.resets += 1;
        let t0 = std::time::Instant::now();
        let keep = !self.env.reset_needed
            && self.env.tenant.group.ephemeral_keep_working_memory
            && self.vm.banked_bytes() <= self.env.tenant.group.limit_req_memory;
        self.vm.reset_to(&source.vm, ResetOptions { keep_all_work_memory: keep });
        self.env.waiting_for_requests = source.env.waiting_for_requests;
        // the POST area and the inputs area are gone
        self.env.post_data = 0;
        self.env.post_size = 0;
        self.env.inputs_allocation = 0;
        self.env.response_called = 0;
        self.env.regex.reset_and_loan(&source.env.regex);
        self.env.reset_needed = false;
        self.env.stats.vm_reset_time += t0.elapsed().as_secs_f64();
    }

    /// Issue the configured number of synthetic requests through the
    /// resume path, verifying a response each time, without emitting any
    /// network output.
    fn warmup(&mut self) -> Result<(), String> {
        let w = self.env.tenant.group.warmup.clone().expect("warmup configured");
        if w.url.is_empty() || w.method.is_empty() {
            return Err("warmup method/url must not be empty".to_string());
        }
        let inputs = CallInputs {
            method: w.method.clone(),
            url: w.url.clone(),
            argument: String::new(),
            content_type: String::new(),
            headers: w.headers.clone(),
            body: None,
            warmup: true,
        };
        if self.env.tenant.group.verbose {
            info!("warmup request: HTTP/1.1 {} {} x{}", w.method, w.url, w.num_requests);
        }
        self.env.is_warming_up = true;
        let r = (|| {
            for _ in 0..w.num_requests {
                dispatch::warmup_pause_resume(self, &inputs).map_err(|e| e.to_string())?;
            }
            Ok(())
        })();
        self.env.is_warming_up = false;
        r
    }
}
