//! Timer wheel for scheduled async storage tasks. One worker thread per
//! program; tasks fire once or periodically until removed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type Task = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    when: Instant,
    id: u64,
    period: Option<Duration>,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.id).cmp(&(other.when, other.id))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    /// Ids scheduled and neither finished nor removed. A heap entry whose
    /// id left this set is dead.
    active: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
}

pub struct TimerWheel {
    inner: Arc<Inner>,
    cap: usize,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    pub fn new(cap: usize) -> Self {
        let inner = Arc::new(Inner { state: Mutex::new(State::default()), cv: Condvar::new() });
        let worker = inner.clone();
        let join = std::thread::Builder::new()
            .name("timer-wheel".into())
            .spawn(move || run(worker))
            .expect("spawn timer thread");
        TimerWheel { inner, cap, join: Mutex::new(Some(join)) }
    }

    /// Schedule a task; `None` when the wheel is at capacity.
    pub fn add(&self, start: Duration, period: Option<Duration>, task: Task) -> Option<u64> {
        let mut st = self.inner.state.lock().unwrap();
        if st.active.len() >= self.cap || st.shutdown {
            return None;
        }
        st.next_id += 1;
        let id = st.next_id;
        st.active.insert(id);
        st.heap.push(Reverse(Entry { when: Instant::now() + start, id, period, task }));
        drop(st);
        self.inner.cv.notify_one();
        Some(id)
    }

    pub fn remove(&self, id: u64) -> bool {
        let removed = self.inner.state.lock().unwrap().active.remove(&id);
        if removed {
            self.inner.cv.notify_one();
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().unwrap().active.len()
    }

    pub fn stop(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.shutdown = true;
        }
        self.inner.cv.notify_one();
        if let Some(j) = self.join.lock().unwrap().take() {
            let _ = j.join();
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: Arc<Inner>) {
    let mut st = inner.state.lock().unwrap();
    loop {
        if st.shutdown {
            return;
        }
        let now = Instant::now();
        match st.heap.peek() {
            None => {
                st = inner.cv.wait(st).unwrap();
            }
            Some(Reverse(e)) if e.when > now => {
                let wait = e.when - now;
                let (guard, _) = inner.cv.wait_timeout(st, wait).unwrap();
                st = guard;
            }
            Some(_) => {
                let Reverse(mut e) = st.heap.pop().unwrap();
                if !st.active.contains(&e.id) {
                    continue;
                }
                let task = e.task.clone();
                // run outside the lock; a task may add or remove timers
                drop(st);
                task();
                st = inner.state.lock().unwrap();
                if !st.active.contains(&e.id) {
                    continue;
                }
                match e.period {
                    Some(p) if !st.shutdown => {
                        e.when = Instant::now() + p;
                        st.heap.push(Reverse(e));
                    }
                    _ => {
                        st.active.remove(&e.id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_fires_once() {
        let wheel = TimerWheel::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        wheel.add(Duration::from_millis(10), None, Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.count(), 0);
    }

    #[test]
    fn periodic_until_removed() {
        let wheel = TimerWheel::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = wheel
            .add(Duration::from_millis(5), Some(Duration::from_millis(5)), Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(wheel.remove(id));
        assert!(!wheel.remove(id), "second removal reports failure");
        let snapshot = hits.load(Ordering::SeqCst);
        assert!(snapshot >= 2, "expected several firings, got {snapshot}");
        std::thread::sleep(Duration::from_millis(30));
        assert!(hits.load(Ordering::SeqCst) <= snapshot + 1);
    }

    #[test]
    fn capacity_enforced() {
        let wheel = TimerWheel::new(1);
        let a = wheel.add(Duration::from_secs(10), None, Arc::new(|| {}));
        assert!(a.is_some());
        let b = wheel.add(Duration::from_secs(10), None, Arc::new(|| {}));
        assert!(b.is_none());
        assert!(wheel.remove(a.unwrap()));
        assert!(wheel.add(Duration::from_secs(10), None, Arc::new(|| {})).is_some());
    }
}
