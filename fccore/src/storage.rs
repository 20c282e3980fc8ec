//! Serialized access to a program's storage VM.
//!
//! The storage VM is single-threaded by policy: every interaction
//! (request-to-storage RPC, fire-and-forget async tasks, live-update state
//! transfer) is a command on the storage VM's executor and therefore
//! observed by the guest in a strict total order. Async tasks additionally
//! coalesce: at most one is pending at any time and the newest argument
//! wins, which is deliberate rate limiting for spammy producers.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::executor::{TaskFuture, VmExecutor};
use crate::machine::MachineInstance;
use crate::program::{ProgramCore, ProgramInstance};
use crate::settings::{self, ProgramEntry};

struct PendingTask {
    func: u64,
    arg: Vec<u8>,
}

pub struct StorageBridge {
    pub exec: VmExecutor,
    pending: Mutex<Option<PendingTask>>,
    async_tasks: Mutex<VecDeque<TaskFuture<i64>>>,
}

impl StorageBridge {
    pub fn new(exec: VmExecutor) -> Self {
        StorageBridge { exec, pending: Mutex::new(None), async_tasks: Mutex::new(VecDeque::new()) }
    }
}

/// Snapshot the bridge handle without holding the program's storage slot
/// lock across any blocking work.
pub fn bridge_of(core: &ProgramCore) -> Option<Arc<StorageBridge>> {
    core.storage.lock().unwrap().clone()
}

pub struct StorageReply {
    /// Bytes to copy back into the caller, already capped to its buffer.
    pub data: Vec<u8>,
    /// Length the storage function reported, uncapped.
    pub reported_len: u64,
}

/// Vector-based RPC into the storage VM (the `STORAGE_CALLV` syscall).
/// Inputs were copied out of the calling VM by the syscall layer; they are
/// placed on the storage VM's stack (descending, 8-byte aligned) followed
/// by a descriptor array, and the function is entered with
/// `(n, descriptors, dst_capacity)`. The guest must answer with
/// STORAGE_RETURN or STORAGE_NORETURN. The allow-list was checked by the
/// caller.
pub fn storage_call(
    core: &Arc<ProgramCore>,
    func: u64,
    inputs: Vec<Vec<u8>>,
    dst_cap: u64,
    want_copy: bool,
) -> Result<StorageReply, String> {
    let bridge = bridge_of(core).ok_or_else(|| "storage not initialized".to_string())?;
    let timeout = core.tenant.group.max_storage_time;
    let fut = bridge.exec.submit(move |mi| -> Result<StorageReply, String> {
        let total_input: u64 = inputs.iter().map(|b| b.len() as u64).sum();
        let mut vaddr = mi.vm.stack_address();
        let n = inputs.len() as u64;

        let mut descriptors = Vec::with_capacity(inputs.len() * 16);
        for buf in &inputs {
            vaddr = vaddr.saturating_sub(buf.len() as u64) & !7u64;
            mi.vm.mem_mut().write(vaddr, buf).map_err(|e| e.to_string())?;
            descriptors.extend_from_slice(&vaddr.to_le_bytes());
            descriptors.extend_from_slice(&(buf.len() as u64).to_le_bytes());
        }
        vaddr = vaddr.saturating_sub(descriptors.len() as u64) & !7u64;
        let desc_addr = vaddr;
        if !descriptors.is_empty() {
            mi.vm.mem_mut().write(desc_addr, &descriptors).map_err(|e| e.to_string())?;
        }
        let new_stack = vaddr & !0xfu64;

        mi.begin_call();
        mi.env.stats.invocations += 1;
        mi.env.stats.input_bytes += total_input;
        let t0 = std::time::Instant::now();

        let run = mi.timed_vmcall_stack(func, new_stack, timeout, &[n, desc_addr, dst_cap]);
        mi.env.stats.request_cpu_time += t0.elapsed().as_secs_f64();
        run.map_err(|e| {
            mi.env.stats.exceptions += 1;
            e.to_string()
        })?;

        let storage_resume = mi.response_called(2);
        let storage_noreturn = mi.response_called(3);
        if !mi.vm.stopped() || !(storage_resume || storage_noreturn) {
            mi.env.stats.exceptions += 1;
            return Err("storage did not respond properly".to_string());
        }

        let regs = mi.vm.regs;
        let res_buffer = regs.rdi;
        let res_len = regs.rsi.min(dst_cap);
        let data = if want_copy && res_buffer != 0 && res_len > 0 {
            mi.vm.mem().read_vec(res_buffer, res_len).map_err(|e| e.to_string())?
        } else {
            Vec::new()
        };
        mi.env.stats.output_bytes += data.len() as u64;

        if storage_resume {
            // let the function run to completion for cleanup
            if let Err(e) = mi.run(settings::STORAGE_CLEANUP_TIMEOUT) {
                warn!("{}: storage cleanup resume failed: {}", mi.name(), e);
            }
        }
        Ok(StorageReply { data, reported_len: regs.rsi })
    });
    fut.get().map_err(|e| e.to_string())?
}

/// Fire-and-forget storage task. Coalescing: a newer task replaces a
/// pending one (last-write-wins); at most one runner is queued.
pub fn storage_task(core: &Arc<ProgramCore>, func: u64, arg: Vec<u8>) -> Result<(), String> {
    let bridge = bridge_of(core).ok_or_else(|| "storage not initialized".to_string())?;
    if !core.storage_allowed(func) {
        return Err("not allowed to call storage function".to_string());
    }

    let need_runner = {
        let mut pending = bridge.pending.lock().unwrap();
        let had = pending.is_some();
        *pending = Some(PendingTask { func, arg });
        !had
    };
    if !need_runner {
        debug!("{}: storage task coalesced", core.tenant.name);
        return Ok(());
    }

    let weak = Arc::downgrade(core);
    let runner_bridge = bridge.clone();
    let fut = bridge.exec.submit(move |mi| -> i64 {
        let Some(core) = weak.upgrade() else { return -1 };
        let Some(task) = runner_bridge.pending.lock().unwrap().take() else { return 0 };

        // async tasks hold off until the program finished initializing
        if core.gate.wait_timeout(settings::STORAGE_TASK_INIT_WAIT).is_none() {
            debug!("{}: async storage task ran before initialization settled", mi.name());
        }

        mi.env.stats.invocations += 1;
        mi.env.stats.input_bytes += task.arg.len() as u64;
        let t0 = std::time::Instant::now();
        let result = {
            let mut rsp = mi.vm.stack_address();
            let MachineInstance { vm, env } = mi;
            vm.stack_push(&mut rsp, &task.arg).and_then(|addr| {
                vm.timed_vmcall_stack(
                    task.func,
                    rsp,
                    settings::ASYNC_STORAGE_TIMEOUT,
                    &[addr, task.arg.len() as u64],
                    env,
                )
            })
        };
        mi.env.stats.request_cpu_time += t0.elapsed().as_secs_f64();
        match result {
            Ok(()) => 0,
            Err(e) => {
                mi.env.stats.exceptions += 1;
                warn!("{}: async storage task failed: {}", mi.name(), e);
                -1
            }
        }
    });

    // keep at most one settling future around
    let mut tasks = bridge.async_tasks.lock().unwrap();
    while tasks.len() > 1 {
        tasks.pop_front();
    }
    tasks.push_back(fut);
    Ok(())
}

/// Live-update state transfer: run the old program's serializer on its
/// storage thread, copy the bytes out, feed them to the new program's
/// deserializer on its storage thread, and resume the new storage VM so the
/// guest can finalize the import. Returns the transferred byte count.
pub fn live_update_call(old: &ProgramInstance, new: &ProgramInstance) -> Result<i64, String> {
    let ser = old.entry_at(ProgramEntry::LiveupdSerialize);
    let deser = new.entry_at(ProgramEntry::LiveupdDeserialize);
    if ser == 0 {
        return Err("old program lacks serializer".to_string());
    }
    if deser == 0 {
        return Err("new program lacks restorer".to_string());
    }

    let serialized: Vec<u8> = {
        let bridge = bridge_of(&old.core).ok_or_else(|| "old program has no storage".to_string())?;
        let timeout = old.tenant.group.max_storage_time;
        bridge
            .exec
            .submit(move |mi| -> Result<Vec<u8>, String> {
                mi.begin_call();
                mi.timed_vmcall(ser, timeout, &[]).map_err(|e| e.to_string())?;
                let regs = mi.vm.regs;
                let (data, len) = (regs.rdi, regs.rsi);
                if data == 0 || len == 0 {
                    return Err("serializer produced no data".to_string());
                }
                data.checked_add(len).ok_or_else(|| "serializer range overflow".to_string())?;
                mi.vm.mem().read_vec(data, len).map_err(|e| e.to_string())
            })
            .get()
            .map_err(|e| e.to_string())??
    };

    let transferred: i64 = {
        let bridge = bridge_of(&new.core).ok_or_else(|| "new program has no storage".to_string())?;
        let timeout = new.tenant.group.max_storage_time;
        bridge
            .exec
            .submit(move |mi| -> Result<i64, String> {
                mi.begin_call();
                mi.timed_vmcall(deser, timeout, &[serialized.len() as u64]).map_err(|e| e.to_string())?;
                let regs = mi.vm.regs;
                let (dst, cap) = (regs.rdi, regs.rsi);
                if dst == 0 {
                    return Ok(0);
                }
                let n = (serialized.len() as u64).min(cap);
                mi.vm.mem_mut().write(dst, &serialized[..n as usize]).map_err(|e| e.to_string())?;
                // resume so the guest deserializes what we just wrote
                mi.run(settings::STORAGE_DESERIALIZE_TIMEOUT).map_err(|e| e.to_string())?;
                Ok(n as i64)
            })
            .get()
            .map_err(|e| e.to_string())??
    };

    new.core
        .stats
        .live_update_transfer_bytes
        .store(transferred, Ordering::Relaxed);
    Ok(transferred)
}
