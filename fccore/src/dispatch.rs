//! The backend call path: stage POST data into the guest, assemble the
//! guest-visible inputs, pick the entry point, drive the VM to completion
//! under the request deadline, harvest and validate the response, and give
//! the guest one shot at substituting an error page when something failed.
//!
//! All VM work happens in closures submitted to the reserved VM's executor;
//! this module runs on the request thread and blocks on the futures.

use log::debug;
use smallvec::SmallVec;

use fcvm::VmError;

use crate::error::CallError;
use crate::machine::{CacheControl, MachineInstance, RequestCtx};
use crate::program::Reservation;
use crate::settings::{self, ProgramEntry};
use crate::syscalls::http_set_line;

/// Host-side inputs for one invocation.
#[derive(Debug, Clone, Default)]
pub struct CallInputs {
    pub method: String,
    pub url: String,
    pub argument: String,
    pub content_type: String,
    /// Full "Name: value" lines, at most 64 reach the guest.
    pub headers: Vec<String>,
    pub body: Option<Vec<u8>>,
    pub warmup: bool,
}

impl CallInputs {
    pub fn get(url: impl Into<String>) -> Self {
        CallInputs { method: "GET".into(), url: url.into(), ..Default::default() }
    }

    pub fn post(url: impl Into<String>, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        CallInputs {
            method: "POST".into(),
            url: url.into(),
            content_type: content_type.into(),
            body: Some(body),
            ..Default::default()
        }
    }
}

/// Non-owning view of response bytes still inside the guest. Only readable
/// while the reservation that produced it is held.
#[derive(Debug, Clone, Copy)]
pub struct GuestBuf {
    pub addr: u64,
    pub len: u64,
}

#[derive(Debug)]
pub enum BackendBody {
    Buffered { buffers: SmallVec<[GuestBuf; 32]> },
    Streamed { callback: u64, argument: u64 },
}

#[derive(Debug)]
pub struct BackendResult {
    pub status: u16,
    pub content_type: String,
    pub content_length: u64,
    pub body: BackendBody,
    pub headers: Vec<String>,
    pub cache: Option<CacheControl>,
}

impl BackendResult {
    pub fn is_streamed(&self) -> bool {
        matches!(self.body, BackendBody::Streamed { .. })
    }
}

/// Staged POST body. With a registered BACKEND_STREAM entry the guest
/// consumes chunks as they arrive; otherwise chunks accumulate in one
/// contiguous guest buffer.
#[derive(Debug, Clone, Copy)]
pub struct PostState {
    pub address: u64,
    pub capacity: u64,
    pub length: u64,
    pub streamed: bool,
}

pub fn begin_post(resv: &Reservation, content_length: u64) -> Result<PostState, CallError> {
    if content_length > settings::POST_BUFFER_MAX {
        return Err(CallError::MachineException {
            msg: "POST request too large".into(),
            data: content_length,
        });
    }
    let streamed = resv.program().entry_at(ProgramEntry::BackendStream) != 0;
    Ok(PostState { address: 0, capacity: content_length, length: 0, streamed })
}

pub fn post_data(
    resv: &Reservation,
    inputs: &CallInputs,
    st: &mut PostState,
    chunk: &[u8],
) -> Result<(), CallError> {
    let len = chunk.len() as u64;
    if st.length + len > st.capacity {
        return Err(CallError::MachineException { msg: "POST request too large".into(), data: st.capacity });
    }
    if st.streamed {
        let entry = resv.program().entry_at(ProgramEntry::BackendStream);
        let url = inputs.url.clone();
        let argument = inputs.argument.clone();
        let content_type = inputs.content_type.clone();
        let data = chunk.to_vec();
        let offered = st.length;
        let consumed = resv
            .slot()
            .exec
            .submit(move |mi| -> Result<u64, CallError> {
                let timeout = mi.max_req_time();
                let t0 = std::time::Instant::now();
                let r = (|| {
                    let mut rsp = mi.vm.stack_address();
                    let MachineInstance { vm, env } = mi;
                    let url_p = vm.stack_push_cstr(&mut rsp, &url)?;
                    let arg_p = vm.stack_push_cstr(&mut rsp, &argument)?;
                    let ct_p = vm.stack_push_cstr(&mut rsp, &content_type)?;
                    let data_p = vm.stack_push(&mut rsp, &data)?;
                    vm.timed_vmcall_stack(
                        entry,
                        rsp,
                        timeout,
                        &[url_p, arg_p, ct_p, data_p, data.len() as u64, offered],
                        env,
                    )?;
                    Ok(vm.regs.rax)
                })();
                mi.env.stats.request_cpu_time += t0.elapsed().as_secs_f64();
                r.map_err(|e: VmError| {
                    mi.env.reset_needed = true;
                    mi.env.stats.exceptions += 1;
                    e.into()
                })
            })
            .get()??;
        if consumed != len {
            // the guest must consume every offered byte or the fetch aborts
            return Err(CallError::MachineException { msg: "streaming POST not fully consumed".into(), data: consumed });
        }
        st.length += len;
    } else {
        let capacity = st.capacity;
        let offset = st.length;
        let data = chunk.to_vec();
        let address = resv
            .slot()
            .exec
            .submit(move |mi| -> Result<u64, CallError> {
                let r = (|| {
                    let addr = mi.allocate_post_data(capacity)?;
                    mi.vm.mem_mut().write(addr + offset, &data)?;
                    Ok(addr)
                })();
                r.map_err(|e: VmError| {
                    mi.env.reset_needed = true;
                    mi.env.stats.exceptions += 1;
                    e.into()
                })
            })
            .get()??;
        st.address = address;
        st.length += len;
    }
    Ok(())
}

/// Run one backend call against the reserved VM. Dispatch priority is
/// METHOD, then POST/GET, then resuming a VM suspended at
/// `wait_for_requests`. On failure the guest's BACKEND_ERROR entry gets one
/// attempt (under its own short deadline) to substitute a response;
/// otherwise the original error surfaces.
pub fn backend_call(resv: &Reservation, inputs: &CallInputs) -> Result<BackendResult, CallError> {
    let mut post = None;
    if let Some(body) = &inputs.body {
        let mut st = begin_post(resv, body.len() as u64)?;
        if !body.is_empty() {
            post_data(resv, inputs, &mut st, body)?;
        }
        post = Some(st);
    }
    backend_call_with_post(resv, inputs, post)
}

pub fn backend_call_with_post(
    resv: &Reservation,
    inputs: &CallInputs,
    post: Option<PostState>,
) -> Result<BackendResult, CallError> {
    let prog = resv.program().clone();
    if !inputs.warmup {
        prog.core.stats.invocations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    let call_inputs = inputs.clone();
    let outcome = resv
        .slot()
        .exec
        .submit(move |mi| -> Result<BackendResult, CallError> {
            mi.env.ctx = Some(RequestCtx::from_inputs(&call_inputs));
            let t0 = std::time::Instant::now();
            let result = drive_call(mi, &call_inputs, post);
            mi.env.stats.request_cpu_time += t0.elapsed().as_secs_f64();
            if let Err(e) = &result {
                mi.env.reset_needed = true;
                match e {
                    CallError::Timeout(_) => mi.env.stats.timeouts += 1,
                    _ => mi.env.stats.exceptions += 1,
                }
            }
            result
        })
        .get()?;

    match outcome {
        Ok(result) => Ok(result),
        Err(primary) => {
            use std::sync::atomic::Ordering;
            match &primary {
                CallError::Timeout(_) => prog.core.stats.timeouts.fetch_add(1, Ordering::Relaxed),
                _ => prog.core.stats.exceptions.fetch_add(1, Ordering::Relaxed),
            };
            debug!("{}: backend call failed: {}", prog.tenant.name, primary);
            match error_call(resv, inputs, &primary) {
                Some(Ok(substitute)) => Ok(substitute),
                // a failing error handler never hides the original error
                _ => Err(primary),
            }
        }
    }
}

/// One attempt at the guest's error callback; `None` when unregistered.
fn error_call(resv: &Reservation, inputs: &CallInputs, primary: &CallError) -> Option<Result<BackendResult, CallError>> {
    let on_error = resv.program().entry_at(ProgramEntry::BackendError);
    if on_error == 0 {
        return None;
    }
    let url = inputs.url.clone();
    let argument = inputs.argument.clone();
    let exception = primary.to_string();
    let fut = resv.slot().exec.submit(move |mi| -> Result<BackendResult, CallError> {
        mi.begin_call();
        let t0 = std::time::Instant::now();
        let r = (|| -> Result<BackendResult, CallError> {
            let mut stack = mi.vm.stack_address();
            let (url_p, arg_p, exc_p) = {
                let MachineInstance { vm, .. } = mi;
                let u = vm.stack_push_cstr(&mut stack, &url)?;
                let a = vm.stack_push_cstr(&mut stack, &argument)?;
                let x = vm.stack_push_cstr(&mut stack, &exception)?;
                (u, a, x)
            };
            mi.timed_vmcall_stack(on_error, stack, settings::ERROR_HANDLING_TIMEOUT, &[url_p, arg_p, exc_p])?;
            fetch_result(mi)
        })();
        mi.env.stats.error_cpu_time += t0.elapsed().as_secs_f64();
        r
    });
    match fut.get() {
        Ok(r) => Some(r),
        Err(e) => Some(Err(e)),
    }
}

fn drive_call(mi: &mut MachineInstance, inputs: &CallInputs, post: Option<PostState>) -> Result<BackendResult, CallError> {
    mi.begin_call();
    if !inputs.warmup {
        mi.env.stats.invocations += 1;
    }
    let timeout = mi.max_req_time();
    let on_method = mi.env.core.entry_at(ProgramEntry::BackendMethod);
    let on_get = mi.env.core.entry_at(ProgramEntry::BackendGet);
    let on_post = mi.env.core.entry_at(ProgramEntry::BackendPost);
    let is_post = post.is_some();

    if on_method != 0 {
        let mut stack = mi.vm.stack_address();
        let struct_bytes = build_inputs(mi, &mut stack, inputs, post.as_ref())?;
        let struct_addr = mi.vm.stack_push(&mut stack, &struct_bytes)?;
        debug!("{}: calling on_method at 0x{:x} (url: {}, is-post: {})", mi.name(), on_method, inputs.url, is_post);
        mi.timed_vmcall_stack(on_method, stack, timeout, &[struct_addr])?;
    } else if !is_post && on_get != 0 {
        let mut stack = mi.vm.stack_address();
        let (url_p, arg_p) = {
            let MachineInstance { vm, .. } = mi;
            (vm.stack_push_cstr(&mut stack, &inputs.url)?, vm.stack_push_cstr(&mut stack, &inputs.argument)?)
        };
        debug!("{}: calling on_get at 0x{:x}", mi.name(), on_get);
        mi.timed_vmcall_stack(on_get, stack, timeout, &[url_p, arg_p])?;
    } else if is_post && on_post != 0 {
        let p = post.as_ref().unwrap();
        let mut stack = mi.vm.stack_address();
        let (url_p, arg_p, ct_p) = {
            let MachineInstance { vm, .. } = mi;
            (
                vm.stack_push_cstr(&mut stack, &inputs.url)?,
                vm.stack_push_cstr(&mut stack, &inputs.argument)?,
                vm.stack_push_cstr(&mut stack, &inputs.content_type)?,
            )
        };
        mi.env.stats.input_bytes += p.length;
        debug!("{}: calling on_post at 0x{:x} with data at 0x{:x}, len {}", mi.name(), on_post, p.address, p.length);
        mi.timed_vmcall_stack(on_post, stack, timeout, &[url_p, arg_p, ct_p, p.address, p.length])?;
    } else {
        // No registered entry: resume the VM suspended at
        // wait_for_requests, handing it the inputs struct at the address
        // it advertised in RDI.
        if !mi.env.waiting_for_requests {
            mi.run(settings::RESUME_CATCHUP_TIMEOUT)?;
            if !mi.env.waiting_for_requests {
                return Err(CallError::MachineException {
                    msg: "VM did not wait for requests after backend request".into(),
                    data: 0,
                });
            }
        }
        if mi.env.inputs_allocation == 0 {
            mi.env.inputs_allocation =
                mi.vm.mmap_allocate(settings::BACKEND_INPUTS_SIZE)? + settings::BACKEND_INPUTS_SIZE;
        }
        let mut stack = mi.env.inputs_allocation;
        let struct_bytes = build_inputs(mi, &mut stack, inputs, post.as_ref())?;
        let g_struct = mi.vm.regs.rdi;
        mi.vm.mem_mut().write(g_struct, &struct_bytes)?;
        debug!("{}: resuming VM at pc=0x{:x}", mi.name(), mi.vm.regs.rip);
        mi.env.waiting_for_requests = false;
        mi.run(timeout)?;
        return fetch_result(mi);
    }

    // SMP side-vCPUs complete inside their syscalls; nothing left to join.
    fetch_result(mi)
}

/// Synthetic request driven through the resume path during boot, verifying
/// the guest produced a response and returned to the waiting state, without
/// emitting any output.
pub(crate) fn warmup_pause_resume(mi: &mut MachineInstance, inputs: &CallInputs) -> Result<(), CallError> {
    mi.begin_call();
    if mi.env.inputs_allocation == 0 {
        mi.env.inputs_allocation =
            mi.vm.mmap_allocate(settings::BACKEND_INPUTS_SIZE)? + settings::BACKEND_INPUTS_SIZE;
    }
    let mut stack = mi.env.inputs_allocation;
    let struct_bytes = build_inputs(mi, &mut stack, inputs, None)?;
    let g_struct = mi.vm.regs.rdi;
    mi.vm.mem_mut().write(g_struct, &struct_bytes)?;
    mi.env.waiting_for_requests = false;
    mi.run(mi.max_req_time())?;
    if !(mi.response_called(1) || mi.response_called(10)) {
        return Err(CallError::ResponseNotSet);
    }
    // run the guest loop back to its waiting state
    mi.run(settings::RESUME_CATCHUP_TIMEOUT)?;
    if !mi.env.waiting_for_requests {
        return Err(CallError::MachineException {
            msg: "VM did not wait for requests after backend request".into(),
            data: 0,
        });
    }
    Ok(())
}

// Guest-visible inputs struct, 88 bytes:
//   0  method ptr     8 url ptr      16 arg ptr      24 ctype ptr
//   32 method_len u16    34 url_len u16   36 arg_len u16   38 ctype_len u16
//   40 data ptr       48 data_len
//   56 headers ptr    64 num_headers u16   66 info_flags u16 (0x1 warmup)
//   68..88 reserved
fn build_inputs(
    mi: &mut MachineInstance,
    stack: &mut u64,
    inputs: &CallInputs,
    post: Option<&PostState>,
) -> Result<[u8; 88], CallError> {
    if inputs.headers.len() > settings::REQUEST_HEADER_MAX {
        return Err(CallError::MachineException { msg: "too many headers in backend inputs".into(), data: 0 });
    }
    let MachineInstance { vm, env } = mi;

    let method_p = vm.stack_push_cstr(stack, &inputs.method)?;
    let url_p = vm.stack_push_cstr(stack, &inputs.url)?;
    let arg_p = vm.stack_push_cstr(stack, &inputs.argument)?;
    let (ctype_p, ctype_len, data, data_len) = match post {
        Some(p) => {
            env.stats.input_bytes += p.length;
            (vm.stack_push_cstr(stack, &inputs.content_type)?, inputs.content_type.len(), p.address, p.length)
        }
        // readable empty strings; buffers with known length may be null
        None => (vm.stack_push_cstr(stack, "")?, 0, 0u64, 0u64),
    };

    let mut header_entries = Vec::with_capacity(inputs.headers.len() * 16);
    for line in &inputs.headers {
        let ptr = vm.stack_push_cstr(stack, line)?;
        let colon = line.find(':').unwrap_or(0) as u32;
        header_entries.extend_from_slice(&ptr.to_le_bytes());
        header_entries.extend_from_slice(&colon.to_le_bytes());
        header_entries.extend_from_slice(&(line.len() as u32).to_le_bytes());
    }
    let headers_p = if header_entries.is_empty() { 0 } else { vm.stack_push(stack, &header_entries)? };

    let mut s = [0u8; 88];
    s[0..8].copy_from_slice(&method_p.to_le_bytes());
    s[8..16].copy_from_slice(&url_p.to_le_bytes());
    s[16..24].copy_from_slice(&arg_p.to_le_bytes());
    s[24..32].copy_from_slice(&ctype_p.to_le_bytes());
    s[32..34].copy_from_slice(&(inputs.method.len() as u16).to_le_bytes());
    s[34..36].copy_from_slice(&(inputs.url.len() as u16).to_le_bytes());
    s[36..38].copy_from_slice(&(inputs.argument.len() as u16).to_le_bytes());
    s[38..40].copy_from_slice(&(ctype_len as u16).to_le_bytes());
    s[40..48].copy_from_slice(&data.to_le_bytes());
    s[48..56].copy_from_slice(&data_len.to_le_bytes());
    s[56..64].copy_from_slice(&headers_p.to_le_bytes());
    s[64..66].copy_from_slice(&(inputs.headers.len() as u16).to_le_bytes());
    s[66..68].copy_from_slice(&(inputs.warmup as u16).to_le_bytes());
    Ok(s)
}

/// Validate and extract the guest's response. Registers at the halting
/// response syscall: rdi=status, rsi/rdx=content-type ptr/len, then for a
/// buffered reply rcx/r8=body ptr/len with an optional extras struct in r9,
/// and for a streamed reply rcx=length, r8=callback, r9=callback argument.
fn fetch_result(mi: &mut MachineInstance) -> Result<BackendResult, CallError> {
    let regular = mi.response_called(1);
    let streaming = mi.response_called(10);
    if !regular && !streaming {
        return Err(CallError::ResponseNotSet);
    }

    let regs = mi.vm.regs;
    let status = regs.rdi as u16;
    mi.env.stats.count_status(status);
    if !(200u16..600).contains(&status) {
        return Err(CallError::BadStatusCode(status));
    }

    let tlen = regs.rdx;
    if tlen >= settings::CONTENT_TYPE_MAX {
        return Err(CallError::MachineException { msg: "content-type length overflow".into(), data: tlen });
    }
    let tbytes = mi.vm.mem().read_vec(regs.rsi, tlen).map_err(CallError::from)?;
    let content_type = String::from_utf8_lossy(&tbytes).into_owned();

    let mut result = if regular {
        let cvaddr = regs.rcx;
        let clen = regs.r8;
        let mut buffers: SmallVec<[GuestBuf; 32]> = SmallVec::new();
        for (addr, len) in mi.vm.gather_buffers_from_range(cvaddr, clen).map_err(CallError::from)? {
            buffers.push(GuestBuf { addr, len });
        }
        BackendResult {
            status,
            content_type,
            content_length: clen,
            body: BackendBody::Buffered { buffers },
            headers: Vec::new(),
            cache: None,
        }
    } else {
        let clen = regs.rcx;
        if clen == 0 {
            return Err(CallError::MachineException { msg: "cannot stream zero-length response".into(), data: 0 });
        }
        if regs.r8 == 0 {
            return Err(CallError::MachineException {
                msg: "cannot stream using invalid callback (address is 0x0)".into(),
                data: 0,
            });
        }
        BackendResult {
            status,
            content_type,
            content_length: clen,
            body: BackendBody::Streamed { callback: regs.r8, argument: regs.r9 },
            headers: Vec::new(),
            cache: None,
        }
    };
    mi.env.stats.output_bytes += result.content_length;

    if regular && regs.r9 != 0 {
        apply_response_extra(mi, regs.r9)?;
    }

    if let Some(ctx) = mi.env.ctx.as_mut() {
        result.headers = std::mem::take(&mut ctx.resp_headers);
        result.cache = ctx.cache.take();
    }
    Ok(result)
}

// Optional trailing struct on a buffered response, 56 bytes:
//   0 headers ptr   8 num_headers u16   10 cached u8
//   12 ttl f32   16 grace f32   20 keep f32   24..56 reserved
// Each header is {ptr u64, len u64}.
fn apply_response_extra(mi: &mut MachineInstance, extra_ptr: u64) -> Result<(), CallError> {
    if extra_ptr < 0x1000 {
        return Err(CallError::MachineException { msg: "invalid BackendResponseExtra pointer".into(), data: extra_ptr });
    }
    let raw = mi.vm.mem().read_vec(extra_ptr, 56).map_err(CallError::from)?;
    let headers_ptr = u64::from_le_bytes(raw[0..8].try_into().unwrap());
    let num_headers = u16::from_le_bytes(raw[8..10].try_into().unwrap());
    let cached = raw[10] != 0;
    let ttl = f32::from_le_bytes(raw[12..16].try_into().unwrap());
    let grace = f32::from_le_bytes(raw[16..20].try_into().unwrap());
    let keep = f32::from_le_bytes(raw[20..24].try_into().unwrap());

    if num_headers as usize > settings::RESPONSE_HEADER_MAX {
        return Err(CallError::MachineException { msg: "too many headers in BackendResponseExtra".into(), data: 0 });
    }
    if num_headers > 0 {
        if headers_ptr < 0x1000 {
            return Err(CallError::MachineException {
                msg: "invalid BackendResponseExtra headers pointer".into(),
                data: headers_ptr,
            });
        }
        for i in 0..num_headers as u64 {
            let h = mi.vm.mem().read_vec(headers_ptr + i * 16, 16).map_err(CallError::from)?;
            let ptr = u64::from_le_bytes(h[0..8].try_into().unwrap());
            let len = u64::from_le_bytes(h[8..16].try_into().unwrap());
            let line = mi.vm.mem().read_vec(ptr, len).map_err(CallError::from)?;
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(ctx) = mi.env.ctx.as_mut() {
                http_set_line(&mut ctx.resp_headers, &line);
            }
        }
    }
    if cached {
        if let Some(ctx) = mi.env.ctx.as_mut() {
            ctx.cache = Some(CacheControl { cached, ttl, grace, keep });
        }
    }
    Ok(())
}

/// Copy a buffered response body out of the guest. The reservation must be
/// the one that produced `result`.
pub fn collect_body(resv: &Reservation, result: &BackendResult) -> Result<Vec<u8>, CallError> {
    let buffers: Vec<GuestBuf> = match &result.body {
        BackendBody::Buffered { buffers } => buffers.iter().copied().collect(),
        BackendBody::Streamed { .. } => {
            return Err(CallError::Failed("streamed response has no buffered body".into()))
        }
    };
    let total = result.content_length as usize;
    resv.slot()
        .exec
        .submit(move |mi| -> Result<Vec<u8>, CallError> {
            let mut out = Vec::with_capacity(total);
            for b in &buffers {
                out.extend_from_slice(&mi.vm.mem().read_vec(b.addr, b.len).map_err(CallError::from)?);
            }
            Ok(out)
        })
        .get()?
}

/// Produce the next chunk of a streamed response by calling the guest's
/// stream callback with `(argument, max_len, written, total)`.
pub fn stream_next(
    resv: &Reservation,
    result: &BackendResult,
    max_len: u64,
    written: u64,
) -> Result<Vec<u8>, CallError> {
    let (callback, argument) = match &result.body {
        BackendBody::Streamed { callback, argument } => (*callback, *argument),
        BackendBody::Buffered { .. } => {
            return Err(CallError::Failed("buffered response is not streamed".into()))
        }
    };
    let total = result.content_length;
    resv.slot()
        .exec
        .submit(move |mi| -> Result<Vec<u8>, CallError> {
            let t0 = std::time::Instant::now();
            let r = (|| -> Result<Vec<u8>, CallError> {
                mi.timed_vmcall(callback, settings::STREAM_HANDLING_TIMEOUT, &[argument, max_len, written, total])?;
                // the callback leaves the chunk pointer in rdi, length in rdx
                let regs = mi.vm.regs;
                let len = max_len.min(regs.rdx);
                Ok(mi.vm.mem().read_vec(regs.rdi, len).map_err(CallError::from)?)
            })();
            mi.env.stats.request_cpu_time += t0.elapsed().as_secs_f64();
            if r.is_err() {
                mi.env.reset_needed = true;
                mi.env.stats.exceptions += 1;
            }
            r
        })
        .get()?
}

/// Drive a whole streamed body to completion.
pub fn collect_streamed(resv: &Reservation, result: &BackendResult, chunk_size: u64) -> Result<Vec<u8>, CallError> {
    let mut out = Vec::with_capacity(result.content_length as usize);
    while (out.len() as u64) < result.content_length {
        let chunk = stream_next(resv, result, chunk_size, out.len() as u64)?;
        if chunk.is_empty() {
            return Err(CallError::Failed("stream callback produced no data".into()));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}
