//! Single-writer executor: one OS thread owning one VM, fed by a bounded
//! command queue. All virtual-CPU operations for a VM must run on the thread
//! that created it, so the VM is built inside the worker and never leaves
//! it. Submitters block on the returned future.

use crossbeam::channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;

use crate::error::CallError;
use crate::machine::MachineInstance;

type Job = Box<dyn FnOnce(&mut MachineInstance) + Send>;

// Enough to hold the release-time reset plus a caller's command.
const QUEUE_DEPTH: usize = 16;

/// Blocking handle to a submitted command's result.
pub struct TaskFuture<T>(Receiver<T>);

impl<T> TaskFuture<T> {
    pub fn get(self) -> Result<T, CallError> {
        self.0.recv().map_err(|_| CallError::ExecutorGone)
    }
}

pub struct VmExecutor {
    tx: Option<Sender<Job>>,
    join: Option<JoinHandle<()>>,
}

impl VmExecutor {
    /// Spawn the worker and construct the VM on it. The returned future
    /// resolves once construction finished (or failed; the worker then
    /// exits and later submissions report `ExecutorGone`).
    pub fn spawn<B>(name: String, build: B) -> (VmExecutor, TaskFuture<Result<(), String>>)
    where
        B: FnOnce() -> Result<MachineInstance, String> + Send + 'static,
    {
        let (tx, rx) = bounded::<Job>(QUEUE_DEPTH);
        let (init_tx, init_rx) = bounded::<Result<(), String>>(1);
        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut machine = match build() {
                    Ok(m) => {
                        let _ = init_tx.send(Ok(()));
                        m
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                for job in rx.iter() {
                    job(&mut machine);
                }
            })
            .expect("spawn vm executor thread");
        (VmExecutor { tx: Some(tx), join: Some(join) }, TaskFuture(init_rx))
    }

    /// Submit a command; blocks only if the queue is full.
    pub fn submit<T, F>(&self, f: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut MachineInstance) -> T + Send + 'static,
    {
        let (tx, rx) = bounded::<T>(1);
        let job: Job = Box::new(move |mi| {
            let _ = tx.send(f(mi));
        });
        if let Some(q) = &self.tx {
            // a dead worker (failed build) just drops the job; the caller
            // sees ExecutorGone from the future
            let _ = q.send(job);
        }
        TaskFuture(rx)
    }
}

impl Drop for VmExecutor {
    fn drop(&mut self) {
        // closing the channel ends the worker loop; the VM is torn down on
        // its own thread
        drop(self.tx.take());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
