//! ProgramInstance: one loaded program, meaning its binaries, the booted
//! main VM used as the CoW parent, the request-VM pool with per-NUMA-node
//! reservation queues, the storage bridge and the guest entry table.
//!
//! Ownership is deliberately one-way: pool items and the storage VM hold an
//! `Arc<ProgramCore>` (entry table, bridge, timers, stats) but never the
//! instance; reservations carry an `Arc<ProgramInstance>`, which is what
//! keeps a hot-swapped-away program alive until its last in-flight request
//! releases.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};

use crate::binary::BinaryStorage;
use crate::error::CallError;
use crate::executor::VmExecutor;
use crate::loader;
use crate::machine::MachineInstance;
use crate::settings::{self, ProgramEntry, ENTRY_COUNT};
use crate::storage::StorageBridge;
use crate::tenant::TenantConfig;
use crate::timer::TimerWheel;
use crate::util::numa;

/// Cross-program queues are cut off at this many NUMA nodes.
const MAX_NUMA_QUEUES: usize = 4;

#[derive(Debug)]
enum InitState {
    Inflight,
    Ready,
    Failed(String),
}

/// One-shot initialization gate with blocking waiters.
pub struct InitGate {
    state: Mutex<InitState>,
    cv: Condvar,
}

impl InitGate {
    fn new() -> Self {
        InitGate { state: Mutex::new(InitState::Inflight), cv: Condvar::new() }
    }

    fn settle(&self, result: Result<(), String>) {
        let mut st = self.state.lock().unwrap();
        if matches!(*st, InitState::Inflight) {
            *st = match result {
                Ok(()) => InitState::Ready,
                Err(e) => InitState::Failed(e),
            };
            self.cv.notify_all();
        }
    }

    pub fn wait(&self) -> Result<(), String> {
        let mut st = self.state.lock().unwrap();
        while matches!(*st, InitState::Inflight) {
            st = self.cv.wait(st).unwrap();
        }
        match &*st {
            InitState::Ready => Ok(()),
            InitState::Failed(e) => Err(e.clone()),
            InitState::Inflight => unreachable!(),
        }
    }

    /// Bounded wait; `None` when still in flight after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), String>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().unwrap();
        while matches!(*st, InitState::Inflight) {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cv.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
        Some(match &*st {
            InitState::Ready => Ok(()),
            InitState::Failed(e) => Err(e.clone()),
            InitState::Inflight => unreachable!(),
        })
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock().unwrap(), InitState::Ready)
    }
}

#[derive(Default)]
pub struct ProgramStats {
    pub reservation_timeouts: AtomicU64,
    pub reservation_time_ns: AtomicU64,
    pub live_updates: AtomicU64,
    pub live_update_transfer_bytes: AtomicI64,
    pub invocations: AtomicU64,
    pub exceptions: AtomicU64,
    pub timeouts: AtomicU64,
}

/// The part of a program shared with every VM bound to it.
pub struct ProgramCore {
    pub tenant: Arc<TenantConfig>,
    entries: [AtomicU32; ENTRY_COUNT],
    pub storage: Mutex<Option<Arc<StorageBridge>>>,
    /// Storage functions the storage VM whitelisted before serving; empty
    /// means every address is callable. Lives here (not on the bridge) so
    /// the storage VM can populate it while it is still booting.
    pub storage_allow: Mutex<std::collections::HashSet<u64>>,
    pub timers: TimerWheel,
    pub gate: InitGate,
    pub stats: ProgramStats,
}

impl ProgramCore {
    fn new(tenant: Arc<TenantConfig>) -> Self {
        ProgramCore {
            tenant,
            entries: std::array::from_fn(|_| AtomicU32::new(0)),
            storage: Mutex::new(None),
            storage_allow: Mutex::new(std::collections::HashSet::new()),
            timers: TimerWheel::new(settings::STORAGE_TASK_MAX_TIMERS),
            gate: InitGate::new(),
            stats: ProgramStats::default(),
        }
    }

    /// An empty allow-list means "allow all".
    pub fn storage_allowed(&self, func: u64) -> bool {
        let list = self.storage_allow.lock().unwrap();
        list.is_empty() || list.contains(&func)
    }

    pub fn entry_at(&self, e: ProgramEntry) -> u64 {
        self.entries[e as usize].load(Ordering::Acquire) as u64
    }

    pub fn entry_at_index(&self, idx: usize) -> Option<u64> {
        self.entries.get(idx).map(|e| e.load(Ordering::Acquire) as u64)
    }

    pub fn set_entry_at(&self, idx: usize, addr: u32) -> bool {
        match self.entries.get(idx) {
            Some(slot) => {
                slot.store(addr, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Tear down the parts that own threads referencing this core.
    pub fn shutdown(&self) {
        let bridge = self.storage.lock().unwrap().take();
        drop(bridge);
        self.timers.stop();
    }
}

/// A pool slot: the executor thread that owns one request VM.
pub struct VMPoolItem {
    pub id: u32,
    pub exec: VmExecutor,
}

/// How a program's binaries arrive.
pub enum ProgramSource {
    Binaries { request: BinaryStorage, storage: BinaryStorage },
    Uri { uri: String, if_modified_since: Option<String> },
}

pub struct ProgramInstance {
    pub tenant: Arc<TenantConfig>,
    pub core: Arc<ProgramCore>,
    pub is_debug: bool,
    request_binary: Mutex<BinaryStorage>,
    main_vm: OnceLock<Arc<MachineInstance>>,
    pool: Mutex<Vec<Arc<VMPoolItem>>>,
    queues: Vec<(Sender<Arc<VMPoolItem>>, Receiver<Arc<VMPoolItem>>)>,
    binary_was_local: AtomicBool,
    binary_was_cached: AtomicBool,
}

impl ProgramInstance {
    /// Create the instance and begin asynchronous initialization; callers
    /// block on `wait_for_initialization`.
    pub fn launch(tenant: Arc<TenantConfig>, source: ProgramSource, is_debug: bool) -> Arc<ProgramInstance> {
        let n_nodes = numa::node_count().min(MAX_NUMA_QUEUES);
        let queues = (0..n_nodes).map(|_| bounded(tenant.group.max_concurrency.max(1))).collect();
        let prog = Arc::new(ProgramInstance {
            core: Arc::new(ProgramCore::new(tenant.clone())),
            tenant,
            is_debug,
            request_binary: Mutex::new(BinaryStorage::empty()),
            main_vm: OnceLock::new(),
            pool: Mutex::new(Vec::new()),
            queues,
            binary_was_local: AtomicBool::new(false),
            binary_was_cached: AtomicBool::new(false),
        });
        let init = prog.clone();
        std::thread::Builder::new()
            .name(format!("{}-init", init.tenant.name))
            .spawn(move || {
                let t0 = Instant::now();
                let result = init.initialize(source, t0);
                if let Err(e) = &result {
                    error!("program '{}' failed initialization: {}", init.tenant.name, e);
                }
                init.core.gate.settle(result);
            })
            .expect("spawn program init thread");
        prog
    }

    fn initialize(self: &Arc<Self>, source: ProgramSource, t0: Instant) -> Result<(), String> {
        let cfg = &self.tenant;
        let loaded = loader::resolve(cfg, source).map_err(|e| e.to_string())?;
        self.binary_was_local.store(loaded.was_local, Ordering::Relaxed);
        self.binary_was_cached.store(loaded.was_cached, Ordering::Relaxed);
        *self.request_binary.lock().unwrap() = loaded.request.clone();

        // Storage first: request VMs may call into it from the very first
        // request.
        if cfg.has_storage() {
            let storage_bin = if loaded.storage.is_empty() { loaded.request.clone() } else { loaded.storage.clone() };
            let tenant = cfg.clone();
            let core = self.core.clone();
            let dbg = self.is_debug;
            let (exec, init) = VmExecutor::spawn(format!("{}-storage", cfg.name), move || {
                MachineInstance::boot_main(&storage_bin, tenant, core, true, dbg)
            });
            *self.core.storage.lock().unwrap() = Some(Arc::new(StorageBridge::new(exec)));
            init.get().map_err(|e| e.to_string())??;
        }

        let main = MachineInstance::boot_main(&loaded.request, cfg.clone(), self.core.clone(), false, self.is_debug)
            .map(Arc::new)?;
        let kind = main.env.binary_kind;
        self.main_vm.set(main.clone()).ok().expect("main VM set once");

        // First request VM up before we accept traffic; the rest of the
        // pool fills in behind it.
        let first = self.spawn_pool_item(0, &main).map_err(|e| e.to_string())?;
        self.pool.lock().unwrap().push(first.clone());
        let _ = self.queues[0].0.send(first);
        self.core.gate.settle(Ok(()));

        let mut ready = 1usize;
        for i in 1..cfg.group.max_concurrency {
            match self.spawn_pool_item(i as u32, &main) {
                Ok(item) => {
                    self.pool.lock().unwrap().push(item.clone());
                    let _ = self.queues[i % self.queues.len()].0.send(item);
                    ready += 1;
                }
                Err(e) => {
                    warn!("{}: failed to create all request machines, init={}: {}", cfg.name, ready, e);
                }
            }
        }

        loader::write_back_cache(cfg, &loaded);

        info!(
            "program '{}' is loaded ({}, {}, {}, vm={}{}, nodes={}, ready={:.2}ms)",
            cfg.name,
            if loaded.was_local { "local" } else { "remote" },
            if loaded.was_cached { "cached" } else { "not cached" },
            kind.as_str(),
            ready,
            if cfg.group.ephemeral { " ephemeral" } else { "" },
            self.queues.len(),
            t0.elapsed().as_secs_f64() * 1e3,
        );
        Ok(())
    }

    fn spawn_pool_item(self: &Arc<Self>, id: u32, main: &Arc<MachineInstance>) -> Result<Arc<VMPoolItem>, CallError> {
        let source = main.clone();
        // The forked VM is built on its own dedicated thread and stays
        // there for its whole life.
        let (exec, init) = VmExecutor::spawn(format!("{}-vm{}", self.tenant.name, id), move || {
            Ok(MachineInstance::fork(&source, id))
        });
        init.get()?.map_err(CallError::Failed)?;
        Ok(Arc::new(VMPoolItem { id, exec }))
    }

    pub fn wait_for_initialization(&self) -> Result<(), String> {
        self.core.gate.wait()
    }

    pub fn is_initialized(&self) -> bool {
        self.core.gate.is_ready()
    }

    pub fn main_vm(&self) -> Option<&Arc<MachineInstance>> {
        self.main_vm.get()
    }

    pub fn request_binary(&self) -> BinaryStorage {
        self.request_binary.lock().unwrap().clone()
    }

    pub fn binary_was_local(&self) -> bool {
        self.binary_was_local.load(Ordering::Relaxed)
    }

    pub fn binary_was_cached(&self) -> bool {
        self.binary_was_cached.load(Ordering::Relaxed)
    }

    pub fn entry_at(&self, e: ProgramEntry) -> u64 {
        self.core.entry_at(e)
    }

    /// Reserve a request VM from the queue of the caller's NUMA node,
    /// waiting up to `max_queue_time`.
    pub fn reserve_vm(self: &Arc<Self>) -> Result<Reservation, CallError> {
        let node = numa::current_node() % self.queues.len();
        let t0 = Instant::now();
        let slot = match self.queues[node].1.recv_timeout(self.tenant.group.max_queue_time) {
            Ok(slot) => slot,
            Err(RecvTimeoutError::Timeout) => {
                self.core.stats.reservation_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(CallError::QueueTimeout);
            }
            Err(RecvTimeoutError::Disconnected) => return Err(CallError::ExecutorGone),
        };
        self.core
            .stats
            .reservation_time_ns
            .fetch_add(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(Reservation { prog: self.clone(), slot: Some(slot) })
    }

    fn release(self: &Arc<Self>, slot: Arc<VMPoolItem>) {
        if let Some(main) = self.main_vm.get().cloned() {
            // Reset on the VM's own thread; executor order guarantees it
            // runs before the next reservation's first command.
            let _ = slot.exec.submit(move |mi| {
                mi.tail_reset();
                mi.maybe_reset(&main);
            });
        }
        let node = numa::current_node() % self.queues.len();
        if self.queues[node].0.try_send(slot).is_err() {
            // Can only happen during teardown races; the slot then drops
            // here and its executor joins.
            warn!("{}: dropping pool slot on release", self.tenant.name);
        }
    }

    pub fn status_summary(&self) -> serde_json::Value {
        let s = &self.core.stats;
        serde_json::json!({
            "initialized": self.is_initialized(),
            "binary_local": self.binary_was_local(),
            "binary_cached": self.binary_was_cached(),
            "invocations": s.invocations.load(Ordering::Relaxed),
            "exceptions": s.exceptions.load(Ordering::Relaxed),
            "timeouts": s.timeouts.load(Ordering::Relaxed),
            "reservation_timeouts": s.reservation_timeouts.load(Ordering::Relaxed),
            "reservation_time_ms": s.reservation_time_ns.load(Ordering::Relaxed) / 1_000_000,
            "live_updates": s.live_updates.load(Ordering::Relaxed),
            "live_update_transfer_bytes": s.live_update_transfer_bytes.load(Ordering::Relaxed),
        })
    }
}

impl Drop for ProgramInstance {
    fn drop(&mut self) {
        // Storage bridge and timers own threads that reference the core;
        // cut them loose first. Pool executors join as their Arcs drop.
        self.core.shutdown();
    }
}

/// Exclusive, time-bounded access to one request VM. Holding it keeps the
/// program alive; dropping it resets the VM (on the VM's thread) and puts
/// the slot back into a reservation queue, on every exit path.
pub struct Reservation {
    prog: Arc<ProgramInstance>,
    slot: Option<Arc<VMPoolItem>>,
}

impl Reservation {
    pub fn program(&self) -> &Arc<ProgramInstance> {
        &self.prog
    }

    pub fn slot(&self) -> &Arc<VMPoolItem> {
        self.slot.as_ref().expect("reservation is live")
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.prog.release(slot);
        }
    }
}
