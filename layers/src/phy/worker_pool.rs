//! Worker Pool
//!
//! A fixed set of worker slots, each with its own OS thread. The producer
//! reserves the slot of a tick (`tick % N`), fills in the worker's context and
//! starts it; the slot thread runs the pool task on the worker and returns the
//! slot to idle. Reserving a busy slot blocks, which throttles the producer
//! when processing falls behind.
//!
//! Slot life cycle: `Uninit -> Idle -> Reserved -> Running -> Idle`.

use crate::threading::spawn_rt_thread;
use crate::LayerError;
use common::Tti;
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace};

/// Work run on a worker each time it is started
pub type WorkerTask<W> = Arc<dyn Fn(&W) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninit,
    Idle,
    Reserved,
    Running,
}

struct SlotInner<W> {
    state: WorkerState,
    worker: Option<Arc<W>>,
    stop: bool,
}

struct PoolSlot<W> {
    inner: Mutex<SlotInner<W>>,
    cond: Condvar,
}

impl<W> PoolSlot<W> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: WorkerState::Uninit,
                worker: None,
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        inner.state = WorkerState::Idle;
        self.cond.notify_all();
    }
}

/// Reserved worker; derefs to the worker so that its context can be set.
///
/// Dropping a handle that was never started returns the slot to idle.
pub struct WorkerHandle<'a, W> {
    pool: &'a WorkerPool<W>,
    index: usize,
    worker: Arc<W>,
    started: bool,
}

impl<W> WorkerHandle<'_, W> {
    /// Pool slot of the reserved worker
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<W> Deref for WorkerHandle<'_, W> {
    type Target = W;

    fn deref(&self) -> &W {
        &self.worker
    }
}

impl<W> Drop for WorkerHandle<'_, W> {
    fn drop(&mut self) {
        if !self.started {
            trace!("Worker {} released without start", self.index);
            self.pool.slots[self.index].release();
        }
    }
}

/// Fixed-size pool of workers processing ticks in round-robin order
pub struct WorkerPool<W> {
    name: String,
    slots: Vec<Arc<PoolSlot<W>>>,
    task: WorkerTask<W>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<W: Send + Sync + 'static> WorkerPool<W> {
    /// Create a pool of `nof_workers` uninitialised slots running `task`
    pub fn new(name: &str, nof_workers: usize, task: WorkerTask<W>) -> Self {
        Self {
            name: name.to_string(),
            slots: (0..nof_workers).map(|_| Arc::new(PoolSlot::new())).collect(),
            task,
            threads: Mutex::new(Vec::with_capacity(nof_workers)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn nof_workers(&self) -> usize {
        self.slots.len()
    }

    /// Install `worker` in slot `index` and start its thread with `priority`
    pub fn init_worker(&self, index: usize, worker: W, priority: i32) -> Result<(), LayerError> {
        let slot = self.slots.get(index).ok_or(LayerError::WorkerIndex {
            index,
            nof_workers: self.slots.len(),
        })?;

        {
            let mut inner = slot.inner.lock();
            if inner.state != WorkerState::Uninit {
                return Err(LayerError::InvalidState(format!("worker {} already initialised", index)));
            }
            inner.worker = Some(Arc::new(worker));
            inner.state = WorkerState::Idle;
        }

        let slot = slot.clone();
        let task = self.task.clone();
        let handle = spawn_rt_thread(format!("{}-{}", self.name, index), priority, move || {
            worker_loop(&slot, task.as_ref())
        })
        .map_err(|e| LayerError::InitializationFailed(format!("worker {} thread: {}", index, e)))?;
        self.threads.lock().push(handle);

        debug!("{} worker {} initialised (priority {})", self.name, index, priority);
        Ok(())
    }

    /// Reserve the worker of `tti`, blocking while it is busy
    pub fn wait_worker(&self, tti: Tti) -> Result<WorkerHandle<'_, W>, LayerError> {
        self.wait_worker_id(tti.0 as usize % self.slots.len())
    }

    /// Reserve the worker of slot `index`, blocking while it is busy
    pub fn wait_worker_id(&self, index: usize) -> Result<WorkerHandle<'_, W>, LayerError> {
        let slot = self.slots.get(index).ok_or(LayerError::WorkerIndex {
            index,
            nof_workers: self.slots.len(),
        })?;

        let mut inner = slot.inner.lock();
        loop {
            if inner.stop {
                return Err(LayerError::InvalidState(format!("{} pool stopped", self.name)));
            }
            match inner.state {
                WorkerState::Uninit => return Err(LayerError::NotInitialized),
                WorkerState::Idle => break,
                WorkerState::Reserved | WorkerState::Running => slot.cond.wait(&mut inner),
            }
        }

        inner.state = WorkerState::Reserved;
        let worker = inner.worker.clone().ok_or(LayerError::NotInitialized)?;
        Ok(WorkerHandle {
            pool: self,
            index,
            worker,
            started: false,
        })
    }

    /// Release a reserved worker to its thread; does not wait for completion
    pub fn start_worker(&self, mut handle: WorkerHandle<'_, W>) {
        let slot = &self.slots[handle.index];
        let mut inner = slot.inner.lock();
        assert_eq!(
            inner.state,
            WorkerState::Reserved,
            "worker {} started without reservation",
            handle.index
        );
        inner.state = WorkerState::Running;
        handle.started = true;
        slot.cond.notify_all();
    }

    /// Worker of slot `index`, for read-only access outside the tick path
    pub fn worker(&self, index: usize) -> Option<Arc<W>> {
        self.slots.get(index).and_then(|slot| slot.inner.lock().worker.clone())
    }

    /// State of slot `index`
    pub fn state(&self, index: usize) -> Option<WorkerState> {
        self.slots.get(index).map(|slot| slot.inner.lock().state)
    }

    /// Let running work finish, then stop and join every thread
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in &self.slots {
            let mut inner = slot.inner.lock();
            inner.stop = true;
            slot.cond.notify_all();
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("{} worker thread panicked", self.name);
            }
        }
        info!("{} pool stopped", self.name);
    }
}

impl<W> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        for slot in &self.slots {
            let mut inner = slot.inner.lock();
            inner.stop = true;
            slot.cond.notify_all();
        }
        for handle in self.threads.get_mut().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<W>(slot: &PoolSlot<W>, task: &(dyn Fn(&W) + Send + Sync)) {
    loop {
        let worker = {
            let mut inner = slot.inner.lock();
            while inner.state != WorkerState::Running && !inner.stop {
                slot.cond.wait(&mut inner);
            }
            if inner.state != WorkerState::Running {
                break;
            }
            inner.worker.clone()
        };

        if let Some(worker) = worker {
            task(worker.as_ref());
        }
        slot.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Tracked {
        id: usize,
        running: Arc<AtomicUsize>,
        gate: Receiver<()>,
        done: Sender<usize>,
    }

    fn tracked_pool(nof_workers: usize) -> (WorkerPool<Tracked>, Sender<()>, Receiver<usize>, Arc<AtomicUsize>) {
        let (gate_tx, gate_rx) = bounded(16);
        let (done_tx, done_rx) = bounded(16);
        let running = Arc::new(AtomicUsize::new(0));
        let task: WorkerTask<Tracked> = Arc::new(|p: &Tracked| {
            let concurrent = p.running.fetch_add(1, Ordering::SeqCst);
            assert!(concurrent < 4);
            let _ = p.gate.recv();
            p.running.fetch_sub(1, Ordering::SeqCst);
            let _ = p.done.send(p.id);
        });
        let pool = WorkerPool::new("test", nof_workers, task);
        for id in 0..nof_workers {
            let tracked = Tracked {
                id,
                running: running.clone(),
                gate: gate_rx.clone(),
                done: done_tx.clone(),
            };
            pool.init_worker(id, tracked, 0).unwrap();
        }
        (pool, gate_tx, done_rx, running)
    }

    #[test]
    fn test_init_out_of_range() {
        let (pool, _, _, _) = tracked_pool(2);
        let (_, gate) = bounded(1);
        let (done, _) = bounded(1);
        let tracked = Tracked {
            id: 5,
            running: Arc::new(AtomicUsize::new(0)),
            gate,
            done,
        };
        assert!(matches!(
            pool.init_worker(5, tracked, 0),
            Err(LayerError::WorkerIndex { index: 5, nof_workers: 2 })
        ));
        assert!(pool.wait_worker_id(7).is_err());
    }

    #[test]
    fn test_round_robin_assignment() {
        let (pool, gate, done, _) = tracked_pool(4);
        for tti in 10..14u32 {
            let handle = pool.wait_worker(Tti(tti)).unwrap();
            assert_eq!(handle.index(), tti as usize % 4);
            assert_eq!(handle.id, tti as usize % 4);
            pool.start_worker(handle);
        }
        for _ in 0..4 {
            gate.send(()).unwrap();
        }
        let mut finished: Vec<usize> = (0..4).map(|_| done.recv().unwrap()).collect();
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 1, 2, 3]);
        pool.stop();
    }

    #[test]
    fn test_saturated_slot_blocks_until_release() {
        let (pool, gate, done, _) = tracked_pool(4);
        let pool = Arc::new(pool);

        let handle = pool.wait_worker(Tti(1)).unwrap();
        pool.start_worker(handle);

        let (reserved_tx, reserved_rx) = bounded(1);
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                // same slot as tick 1
                let handle = pool.wait_worker(Tti(5)).unwrap();
                reserved_tx.send(handle.index()).unwrap();
            })
        };

        assert!(reserved_rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(pool.state(1), Some(WorkerState::Running));

        gate.send(()).unwrap();
        assert_eq!(done.recv().unwrap(), 1);
        assert_eq!(reserved_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        waiter.join().unwrap();

        // handle dropped unstarted by the waiter
        assert_eq!(pool.state(1), Some(WorkerState::Idle));
        pool.stop();
    }

    #[test]
    fn test_reserved_slot_blocks_other_reservation() {
        let (pool, _, _, _) = tracked_pool(1);
        let pool = Arc::new(pool);
        let first = pool.wait_worker_id(0).unwrap();

        let (tx, rx) = bounded(1);
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let _handle = pool.wait_worker_id(0).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(first);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_finishes_running_work() {
        let (pool, gate, done, running) = tracked_pool(2);
        let handle = pool.wait_worker_id(0).unwrap();
        pool.start_worker(handle);
        gate.send(()).unwrap();
        pool.stop();
        pool.stop();
        assert_eq!(done.try_recv().unwrap(), 0);
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert!(pool.wait_worker_id(1).is_err());
    }
}
