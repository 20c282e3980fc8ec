//! The host syscall surface presented to guests. Numeric IDs are stable;
//! semantics follow the host side of the guest ABI: registers in, registers
//! out, `stop()` for the halting calls. The port is the `MachineEnv` bound
//! to the VM, so every handler runs on the VM's own executor thread.

use std::sync::{Arc, OnceLock};

use log::{error, info, warn};

use fcvm::{SyscallPort, Vm, VmError};

use crate::machine::{CacheControl, MachineEnv};
use crate::settings;
use crate::storage;
use crate::util::Semaphore;

/// Syscall numbers.
pub mod nr {
    pub const REGISTER_FUNC: u32 = 0x10000;
    pub const WAIT_FOR_REQUESTS: u32 = 0x10001;
    pub const PAUSE_FOR_REQUESTS: u32 = 0x10002;
    pub const SET_CACHEABLE: u32 = 0x10005;
    pub const BACKEND_RESPONSE: u32 = 0x10010;
    pub const STORAGE_RETURN: u32 = 0x10011;
    pub const BACKEND_STREAMING_RESPONSE: u32 = 0x10012;
    pub const STORAGE_NORETURN: u32 = 0x10013;
    pub const HTTP_APPEND: u32 = 0x10020;
    pub const HTTP_SET: u32 = 0x10021;
    pub const HTTP_FIND: u32 = 0x10022;
    pub const HTTP_METHOD: u32 = 0x10023;
    pub const REGEX_COMPILE: u32 = 0x10030;
    pub const REGEX_FREE: u32 = 0x10031;
    pub const REGEX_MATCH: u32 = 0x10032;
    pub const REGEX_SUBST: u32 = 0x10033;
    pub const SHARED_MEMORY_AREA: u32 = 0x10700;
    pub const MAKE_EPHEMERAL: u32 = 0x10703;
    pub const IS_STORAGE: u32 = 0x10706;
    pub const STORAGE_ALLOW: u32 = 0x10707;
    pub const STORAGE_CALLV: u32 = 0x10708;
    pub const STORAGE_TASK: u32 = 0x10709;
    pub const STOP_STORAGE_TASK: u32 = 0x1070A;
    pub const MULTIPROCESS: u32 = 0x10710;
    pub const MULTIPROCESS_ARRAY: u32 = 0x10711;
    pub const MULTIPROCESS_CLONE: u32 = 0x10712;
    pub const MULTIPROCESS_WAIT: u32 = 0x10713;
    pub const GET_MEMINFO: u32 = 0x10A00;
    pub const CURL_FETCH: u32 = 0x20000;
    pub const LOG: u32 = 0x7F000;
    pub const IS_DEBUG: u32 = 0x7FDEB;
    pub const BREAKPOINT: u32 = 0x7F7F7;
}

/// Header-field targets for the HTTP syscalls.
pub mod hdr {
    pub const REQ: u64 = 0;
    pub const REQ_TOP: u64 = 1;
    pub const RESP: u64 = 2;
    pub const BEREQ: u64 = 3;
    pub const BERESP: u64 = 4;
}

const NEG1: u64 = -1i64 as u64;
const ENOSYS: u64 = -38i64 as u64;
const URL_MAX: u64 = 4096;
const PATTERN_MAX: u64 = 4096;
const CSTR_MAX: u64 = 64 << 10;

impl SyscallPort for MachineEnv {
    fn syscall(&mut self, vm: &mut Vm, n: u32) -> Result<(), VmError> {
        match n {
            nr::REGISTER_FUNC => register_func(self, vm),
            nr::WAIT_FOR_REQUESTS => wait_for_requests(self, vm),
            nr::PAUSE_FOR_REQUESTS => {
                self.waiting_for_requests = true;
                vm.stop();
                Ok(())
            }
            nr::SET_CACHEABLE => {
                let regs = &mut vm.regs;
                match self.ctx.as_mut() {
                    Some(ctx) => {
                        ctx.cache = Some(CacheControl {
                            cached: regs.rdi != 0,
                            ttl: regs.rsi as f32 / 1000.0,
                            grace: regs.rdx as f32 / 1000.0,
                            keep: regs.rcx as f32 / 1000.0,
                        });
                        regs.rax = 0;
                    }
                    None => regs.rax = NEG1,
                }
                Ok(())
            }
            nr::BACKEND_RESPONSE => finish(self, vm, 1),
            nr::BACKEND_STREAMING_RESPONSE => finish(self, vm, 10),
            nr::STORAGE_RETURN => finish(self, vm, 2),
            nr::STORAGE_NORETURN => finish(self, vm, 3),
            nr::HTTP_APPEND => http_append(self, vm),
            nr::HTTP_SET => http_set(self, vm),
            nr::HTTP_FIND => http_find(self, vm),
            nr::HTTP_METHOD => http_method(self, vm),
            nr::REGEX_COMPILE => regex_compile(self, vm),
            nr::REGEX_FREE => self.regex.free(vm.regs.rdi),
            nr::REGEX_MATCH => regex_match(self, vm),
            nr::REGEX_SUBST => regex_subst(self, vm),
            nr::SHARED_MEMORY_AREA => {
                vm.regs.rax = self.shared_memory_boundary();
                vm.regs.rdx = self.shared_memory_boundary().wrapping_add(self.shared_memory_size());
                Ok(())
            }
            nr::MAKE_EPHEMERAL => make_ephemeral(self, vm),
            nr::IS_STORAGE => {
                vm.regs.rax = self.is_storage as u64;
                Ok(())
            }
            nr::STORAGE_ALLOW => {
                // only from the storage VM, only before it starts serving
                if self.is_storage && !self.waiting_for_requests {
                    self.core.storage_allow.lock().unwrap().insert(vm.regs.rdi);
                    vm.regs.rax = 0;
                } else {
                    vm.regs.rax = NEG1;
                }
                Ok(())
            }
            nr::STORAGE_CALLV => storage_callv(self, vm),
            nr::STORAGE_TASK => storage_task(self, vm),
            nr::STOP_STORAGE_TASK => {
                vm.regs.rax = self.core.timers.remove(vm.regs.rdi) as u64;
                Ok(())
            }
            nr::MULTIPROCESS => multiprocess(self, vm, SmpKind::Args),
            nr::MULTIPROCESS_ARRAY => multiprocess(self, vm, SmpKind::Array),
            nr::MULTIPROCESS_CLONE => multiprocess(self, vm, SmpKind::Clone),
            nr::MULTIPROCESS_WAIT => {
                // side vCPUs ran to completion inside their call
                vm.regs.rax = 0;
                Ok(())
            }
            nr::GET_MEMINFO => meminfo(self, vm),
            nr::CURL_FETCH => curl_fetch(self, vm),
            nr::LOG => log_syscall(self, vm),
            nr::IS_DEBUG => {
                vm.regs.rax = self.is_debug as u64;
                Ok(())
            }
            nr::BREAKPOINT => {
                if self.is_debug || self.tenant.group.allow_debug {
                    info!("{}: VM breakpoint at 0x{:x} (no debugger attached)", self.name(), vm.regs.rip);
                } else {
                    info!("{}: skipped VM breakpoint at 0x{:x} (debug not enabled)", self.name(), vm.regs.rip);
                }
                Ok(())
            }
            other => {
                error!("{}: unhandled system call {:#x}", self.name(), other);
                vm.regs.rax = ENOSYS;
                Ok(())
            }
        }
    }
}

fn finish(env: &mut MachineEnv, vm: &mut Vm, what: u8) -> Result<(), VmError> {
    env.response_called = what;
    vm.stop();
    Ok(())
}

fn register_func(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    if env.waiting_for_requests {
        return Err(VmError::exception("register_func(): cannot be called after initialization"));
    }
    let idx = vm.regs.rdi as usize;
    let addr = vm.regs.rsi;
    if addr < 0x1000 || addr >= vm.max_address() || addr > u32::MAX as u64 {
        return Err(VmError::exception_data("invalid address for register_func provided", addr));
    }
    if !env.core.set_entry_at(idx, addr as u32) {
        return Err(VmError::exception_data("invalid entry index for register_func", idx as u64));
    }
    Ok(())
}

fn wait_for_requests(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    if env.waiting_for_requests {
        return Err(VmError::exception("wait_for_requests(): cannot be called after initialization"));
    }
    env.waiting_for_requests = true;
    vm.stop();
    Ok(())
}

fn make_ephemeral(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    if env.waiting_for_requests {
        return Err(VmError::exception("cannot change ephemeralness after initialization"));
    }
    if env.tenant.group.control_ephemeral {
        env.is_ephemeral = vm.regs.rdi != 0;
        vm.regs.rax = 0;
    } else {
        warn!(
            "{}: cannot change ephemeralness, option 'control_ephemeral' not enabled (group: {})",
            env.name(),
            env.tenant.group.name
        );
        vm.regs.rax = NEG1;
    }
    Ok(())
}

// ---- HTTP header access ------------------------------------------------

/// Replace a header with the same field name, or append.
pub(crate) fn http_set_line(headers: &mut Vec<String>, line: &str) {
    let Some(colon) = line.find(':') else {
        headers.push(line.to_string());
        return;
    };
    let name = &line[..colon];
    for h in headers.iter_mut() {
        if h.len() > name.len() && h.as_bytes()[name.len()] == b':' && h[..name.len()].eq_ignore_ascii_case(name) {
            *h = line.to_string();
            return;
        }
    }
    headers.push(line.to_string());
}

pub(crate) fn http_find_value<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
    headers.iter().find_map(|h| {
        let colon = h.find(':')?;
        if h[..colon].eq_ignore_ascii_case(name) {
            Some(h[colon + 1..].trim_start())
        } else {
            None
        }
    })
}

fn header_target<'e>(env: &'e mut MachineEnv, where_: u64) -> Option<&'e mut Vec<String>> {
    let ctx = env.ctx.as_mut()?;
    match where_ {
        hdr::REQ | hdr::REQ_TOP | hdr::BEREQ => Some(&mut ctx.req_headers),
        hdr::RESP | hdr::BERESP => Some(&mut ctx.resp_headers),
        _ => None,
    }
}

fn read_string(vm: &Vm, addr: u64, len: u64, max: u64) -> Result<String, VmError> {
    if len > max {
        return Err(VmError::exception_data("string argument too long", len));
    }
    let bytes = vm.mem().read_vec(addr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn http_append(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let line = read_string(vm, vm.regs.rsi, vm.regs.rdx, CSTR_MAX)?;
    match header_target(env, vm.regs.rdi) {
        Some(headers) if headers.len() < settings::REQUEST_HEADER_MAX => {
            headers.push(line);
            vm.regs.rax = 0;
        }
        _ => vm.regs.rax = NEG1,
    }
    Ok(())
}

fn http_set(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let line = read_string(vm, vm.regs.rsi, vm.regs.rdx, CSTR_MAX)?;
    match header_target(env, vm.regs.rdi) {
        Some(headers) => {
            http_set_line(headers, &line);
            vm.regs.rax = 0;
        }
        None => vm.regs.rax = NEG1,
    }
    Ok(())
}

fn http_find(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let name = read_string(vm, vm.regs.rsi, vm.regs.rdx, CSTR_MAX)?;
    let out = vm.regs.rcx;
    let cap = vm.regs.r8;
    let value = header_target(env, vm.regs.rdi)
        .and_then(|headers| http_find_value(headers, &name).map(String::from));
    match value {
        Some(v) => {
            let n = cap.min(v.len() as u64);
            vm.mem_mut().write(out, &v.as_bytes()[..n as usize])?;
            vm.regs.rax = n;
        }
        None => vm.regs.rax = NEG1,
    }
    Ok(())
}

fn http_method(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let out = vm.regs.rdi;
    let cap = vm.regs.rsi;
    match env.ctx.as_ref() {
        Some(ctx) => {
            let n = cap.min(ctx.method.len() as u64);
            let bytes = ctx.method.as_bytes()[..n as usize].to_vec();
            vm.mem_mut().write(out, &bytes)?;
            vm.regs.rax = n;
        }
        None => vm.regs.rax = NEG1,
    }
    Ok(())
}

// ---- regex -------------------------------------------------------------

fn regex_compile(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let pattern = read_string(vm, vm.regs.rdi, vm.regs.rsi, PATTERN_MAX)?;
    let hash = crate::util::crc32c_hash(pattern.as_bytes());
    if let Some(idx) = env.regex.find(hash) {
        vm.regs.rax = idx as u64;
        return Ok(());
    }
    let re = regex::Regex::new(&pattern)
        .map_err(|e| VmError::exception(format!("the regex pattern did not compile: {} ({})", pattern, e)))?;
    let idx = env.regex.manage(Arc::new(re), hash)?;
    vm.regs.rax = idx as u64;
    Ok(())
}

fn regex_match(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let re = env.regex.get(vm.regs.rdi)?.clone();
    let subject = read_string(vm, vm.regs.rsi, vm.regs.rdx, CSTR_MAX)?;
    vm.regs.rax = re.is_match(&subject) as u64;
    Ok(())
}

fn regex_subst(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let re = env.regex.get(vm.regs.rdi)?.clone();
    let buffer = vm.mem().read_cstr(vm.regs.rsi, CSTR_MAX)?;
    let subst = vm.mem().read_cstr(vm.regs.rdx, CSTR_MAX)?;
    let dst = vm.regs.rcx;
    let dst_cap = vm.regs.r8;
    let all = (vm.regs.r9 & 1) == 1;

    let buffer = String::from_utf8_lossy(&buffer).into_owned();
    let subst = String::from_utf8_lossy(&subst).into_owned();
    let result = if all { re.replace_all(&buffer, subst.as_str()) } else { re.replace(&buffer, subst.as_str()) };
    let mut bytes = result.into_owned().into_bytes();
    bytes.push(0);
    let n = dst_cap.min(bytes.len() as u64);
    vm.mem_mut().write(dst, &bytes[..n as usize])?;
    vm.regs.rax = n;
    Ok(())
}

// ---- storage -----------------------------------------------------------

fn storage_callv(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let func = vm.regs.rdi;
    let n = vm.regs.rsi as usize;
    let dst = vm.regs.rcx;
    let dst_cap = vm.regs.r8;

    // calling storage from storage would deadlock on the serialized queue
    if env.is_storage || n > settings::STORAGE_BUFFER_MAX || dst.checked_add(dst_cap).is_none() {
        vm.regs.rax = NEG1;
        return Ok(());
    }
    if !env.core.storage_allowed(func) {
        return Err(VmError::exception("not allowed to call storage function"));
    }

    let mut inputs = Vec::with_capacity(n);
    for i in 0..n as u64 {
        let desc = vm.mem().read_vec(vm.regs.rdx + i * 16, 16)?;
        let addr = u64::from_le_bytes(desc[0..8].try_into().unwrap());
        let len = u64::from_le_bytes(desc[8..16].try_into().unwrap());
        inputs.push(vm.mem().read_vec(addr, len)?);
    }

    match storage::storage_call(&env.core, func, inputs, dst_cap, dst != 0) {
        Ok(reply) => {
            if dst != 0 {
                if !reply.data.is_empty() {
                    vm.mem_mut().write(dst, &reply.data)?;
                }
                vm.regs.rax = reply.reported_len.min(dst_cap);
            } else {
                // no destination: pass the reported length through untouched
                vm.regs.rax = reply.reported_len;
            }
        }
        Err(e) => {
            warn!("{}: storage call failed: {}", env.name(), e);
            vm.regs.rax = NEG1;
        }
    }
    Ok(())
}

fn storage_task(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let func = vm.regs.rdi;
    let arg_len = vm.regs.rdx;
    if arg_len > settings::STORAGE_TASK_MAX_ARGUMENT {
        return Err(VmError::exception_data("storage task argument too large", arg_len));
    }
    let arg = vm.mem().read_vec(vm.regs.rsi, arg_len)?;
    let start_ms = vm.regs.rcx;
    let period_ms = vm.regs.r8;

    if start_ms == 0 && period_ms == 0 {
        vm.regs.rax = match storage::storage_task(&env.core, func, arg) {
            Ok(()) => 0,
            Err(e) => {
                warn!("{}: storage task rejected: {}", env.name(), e);
                NEG1
            }
        };
        return Ok(());
    }

    let weak = Arc::downgrade(&env.core);
    let period = if period_ms == 0 { None } else { Some(std::time::Duration::from_millis(period_ms)) };
    let task: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
        if let Some(core) = weak.upgrade() {
            if let Err(e) = storage::storage_task(&core, func, arg.clone()) {
                warn!("{}: scheduled storage task failed: {}", core.tenant.name, e);
            }
        }
    });
    vm.regs.rax = match env.core.timers.add(std::time::Duration::from_millis(start_ms), period, task) {
        Some(id) => id,
        None => NEG1,
    };
    Ok(())
}

// ---- SMP ---------------------------------------------------------------

enum SmpKind {
    Args,
    Array,
    Clone,
}

/// Multiprocessing runs the requested extra vCPUs to completion before
/// returning; caps are enforced here, failures report -1 like the rest of
/// the surface.
fn multiprocess(env: &mut MachineEnv, vm: &mut Vm, kind: SmpKind) -> Result<(), VmError> {
    let saved = vm.regs;
    let outcome = multiprocess_inner(env, vm, kind, saved);
    vm.regs = saved;
    match outcome {
        Ok(()) => vm.regs.rax = 0,
        Err(e) => {
            warn!("{}: multiprocess exception: {}", env.name(), e);
            vm.regs.rax = NEG1;
        }
    }
    Ok(())
}

fn smp_run(env: &mut MachineEnv, vm: &mut Vm, entry: u64, stack: u64, args: &[u64]) -> Result<(), VmError> {
    vm.setup_call(entry, stack, args)?;
    vm.run(settings::SMP_TIMEOUT, env)
}

fn multiprocess_inner(
    env: &mut MachineEnv,
    vm: &mut Vm,
    kind: SmpKind,
    saved: fcvm::Registers,
) -> Result<(), VmError> {
    let ncpus = saved.rdi;
    if ncpus < 2 {
        return Err(VmError::exception("multiprocessing: must request at least 2 vCPUs"));
    }
    if ncpus > env.tenant.group.max_smp as u64 {
        return Err(VmError::exception_data("multiprocessing: too many vCPUs requested", ncpus));
    }
    let extra = ncpus - 1;
    match kind {
        SmpKind::Args => {
            let (entry, a1, a2, a3, a4) = (saved.rsi, saved.rdx, saved.rcx, saved.r8, saved.r9);
            let block = vm.mmap_allocate(extra * settings::SMP_STACK_SIZE)?;
            for i in 0..extra {
                let stack = block + (i + 1) * settings::SMP_STACK_SIZE;
                smp_run(env, vm, entry, stack, &[a1, a2, a3, a4])?;
            }
        }
        SmpKind::Array => {
            let (entry, array, elem_size) = (saved.rsi, saved.rdx, saved.rcx);
            let block = vm.mmap_allocate(extra * settings::SMP_STACK_SIZE)?;
            for i in 0..extra {
                let stack = block + (i + 1) * settings::SMP_STACK_SIZE;
                smp_run(env, vm, entry, stack, &[array + i * elem_size, i + 1])?;
            }
        }
        SmpKind::Clone => {
            let (stack_base, stack_size) = (saved.rsi, saved.rdx);
            for i in 0..extra {
                let stack = stack_base + (i + 1) * stack_size;
                smp_run(env, vm, saved.rip, stack, &[i + 1])?;
            }
        }
    }
    Ok(())
}

// ---- misc --------------------------------------------------------------

fn meminfo(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let mut buf = [0u8; 32];
    buf[0..8].copy_from_slice(&env.tenant.group.max_main_memory.to_le_bytes());
    buf[8..16].copy_from_slice(&env.tenant.group.max_req_memory.to_le_bytes());
    buf[16..24].copy_from_slice(&env.tenant.group.max_req_memory.to_le_bytes());
    buf[24..32].copy_from_slice(&vm.banked_bytes().to_le_bytes());
    vm.mem_mut().write(vm.regs.rdi, &buf)
}

static SELF_FETCH_SEM: OnceLock<Semaphore> = OnceLock::new();
static SELF_FETCH_CLIENT: OnceLock<reqwest::blocking::Client> = OnceLock::new();

/// Host-side HTTP fetch on behalf of the guest. Bounded process-wide; the
/// response body is written to the guest buffer and truncated at its
/// capacity. Returns the copied length in rax and the HTTP status in r8.
fn curl_fetch(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let url = read_string(vm, vm.regs.rdi, vm.regs.rsi, URL_MAX)?;
    let dst = vm.regs.rdx;
    let cap = vm.regs.rcx.min(settings::SELF_REQUEST_MAX_RESPONSE);

    let sem = SELF_FETCH_SEM.get_or_init(|| Semaphore::new(settings::SELF_REQUEST_MAX_CONCURRENCY));
    let _permit = sem.acquire();

    let fetched: Result<(u16, Vec<u8>), String> = if let Some(path) = url.strip_prefix("file://") {
        std::fs::read(path).map(|b| (200u16, b)).map_err(|e| e.to_string())
    } else {
        let client = SELF_FETCH_CLIENT.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("build self-fetch client")
        });
        client
            .get(&url)
            .send()
            .and_then(|r| {
                let status = r.status().as_u16();
                r.bytes().map(|b| (status, b.to_vec()))
            })
            .map_err(|e| e.to_string())
    };

    match fetched {
        Ok((status, body)) => {
            let n = cap.min(body.len() as u64);
            vm.mem_mut().write(dst, &body[..n as usize])?;
            vm.regs.rax = n;
            vm.regs.r8 = status as u64;
        }
        Err(e) => {
            warn!("{}: self-request failed for {}: {}", env.name(), url, e);
            vm.regs.rax = NEG1;
            vm.regs.r8 = 0;
        }
    }
    Ok(())
}

fn log_syscall(env: &mut MachineEnv, vm: &mut Vm) -> Result<(), VmError> {
    let len = vm.regs.rsi;
    if len == 0 || len > 1 << 20 {
        if len > 0 {
            env.print("invalid log buffer length");
        }
        return Ok(());
    }
    let text = read_string(vm, vm.regs.rdi, len, 1 << 20)?;
    env.print(&text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_set_replaces_case_insensitive() {
        let mut headers = vec!["Content-Type: text/plain".to_string(), "X-Thing: 1".to_string()];
        http_set_line(&mut headers, "content-type: application/json");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], "content-type: application/json");
        http_set_line(&mut headers, "X-Other: 2");
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn http_find_trims() {
        let headers = vec!["Host:  example.com".to_string()];
        assert_eq!(http_find_value(&headers, "host"), Some("example.com"));
        assert_eq!(http_find_value(&headers, "missing"), None);
    }
}
