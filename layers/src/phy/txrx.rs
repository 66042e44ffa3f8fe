//! Tx/Rx Synchronisation Thread
//!
//! The real-time heartbeat of the PHY. Each iteration reserves the worker of
//! the next tick, receives that tick's samples straight into the worker's Rx
//! buffers, feeds the PRACH pool, starts the worker and then transmits every
//! downlink tick that has completed, in dispatch order.

use super::phy_common::PhyCommon;
use super::prach_worker::PrachWorkerPool;
use super::sf_worker::{SfWorker, WorkerContext};
use super::worker_pool::WorkerPool;
use crate::mac::StackInterfacePhy;
use crate::threading::spawn_rt_thread;
use crate::LayerError;
use common::Tti;
use interfaces::{InterfaceError, RadioEventHandler, RadioInterface, RfTimestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn, Span};

/// Collaborators driven by the Tx/Rx thread
pub struct TxRxArgs {
    pub radio: Arc<dyn RadioInterface>,
    pub workers: Arc<WorkerPool<SfWorker>>,
    pub common: Arc<PhyCommon>,
    pub prach: Arc<PrachWorkerPool>,
    pub stack: Arc<dyn StackInterfacePhy>,
}

/// Handle of the running Tx/Rx thread
pub struct TxRx {
    running: Arc<AtomicBool>,
    last_tti: Arc<AtomicU32>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TxRx {
    /// Start the loop at tick `first_tti` with real-time `priority`
    pub fn init(args: TxRxArgs, first_tti: Tti, priority: i32, span: Span) -> Result<Self, LayerError> {
        let running = Arc::new(AtomicBool::new(true));
        let last_tti = Arc::new(AtomicU32::new(first_tti.0));

        let thread = {
            let running = running.clone();
            let last_tti = last_tti.clone();
            spawn_rt_thread("txrx".to_string(), priority, move || {
                let _enter = span.enter();
                run_thread(&args, first_tti, &running, &last_tti);
            })
            .map_err(|e| LayerError::InitializationFailed(format!("Tx/Rx thread: {}", e)))?
        };

        Ok(Self {
            running,
            last_tti,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Last tick dispatched to the pool
    pub fn last_tti(&self) -> Tti {
        Tti(self.last_tti.load(Ordering::Acquire))
    }

    /// Finish the current tick and join the thread; idempotent
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("Tx/Rx thread panicked");
            }
            info!("Tx/Rx thread stopped");
        }
    }
}

impl Drop for TxRx {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_thread(args: &TxRxArgs, first_tti: Tti, running: &AtomicBool, last_tti: &AtomicU32) {
    let config = args.common.config();
    let modulus = args.common.modulus();
    let tx_advance = config.timing.tx_delay as u64 * config.samples_per_tick() as u64;
    let monitor = args.common.radio_monitor();

    let mut tti = first_tti;
    let mut seq = 0u64;
    info!("Tx/Rx thread started at tick {}", tti);

    while running.load(Ordering::Acquire) {
        let worker = match args.workers.wait_worker(tti) {
            Ok(worker) => worker,
            Err(e) => {
                warn!("No worker for tick {}: {}", tti, e);
                break;
            }
        };

        let mut rx_time = RfTimestamp::default();
        {
            let mut rx = worker.rx_buffers();
            match args.radio.rx_now(&mut rx, &mut rx_time) {
                Ok(()) => {}
                Err(InterfaceError::Overflow(ts)) => {
                    warn!("Rx overflow at {}, tick {} lost", ts, tti);
                    monitor.radio_overflow();
                    tti = tti.next(modulus);
                    continue;
                }
                Err(e) => {
                    error!("Radio receive failed at tick {}: {}", tti, e);
                    monitor.radio_failure();
                    running.store(false, Ordering::Release);
                    break;
                }
            }

            for cc in 0..rx.nof_carriers() {
                if args.prach.new_tti(cc, tti, rx.get(cc, 0)) {
                    trace!("PRACH occasion queued for carrier {} at tick {}", cc, tti);
                }
            }
        }

        worker.set_context(WorkerContext {
            tti_rx: tti,
            rx_time,
            tx_time: rx_time.add_samples(tx_advance),
            tx_enabled: true,
            seq,
        });
        args.workers.start_worker(worker);
        args.common.tick_dispatched();
        last_tti.store(tti.0, Ordering::Release);
        seq += 1;

        args.stack.tti_clock();
        transmit_ready(args);

        tti = tti.next(modulus);
    }

    debug!("Tx/Rx loop left at tick {} after {} ticks", tti, seq);
}

/// Send every completed Tx buffer whose predecessors have been sent
fn transmit_ready(args: &TxRxArgs) {
    let monitor = args.common.radio_monitor();
    while let Some(job) = args.common.pop_tx_ready() {
        let Some(buffers) = job.buffers else {
            continue;
        };
        match args.radio.tx(&buffers, job.tx_time) {
            Ok(()) => trace!("Tx tick {} at {}", job.tti, job.tx_time),
            Err(InterfaceError::Late { requested, current }) => {
                warn!("Tx of tick {} late: {} behind {}", job.tti, requested, current);
                monitor.radio_late();
            }
            Err(InterfaceError::Underflow(ts)) => {
                warn!("Tx underflow at {}", ts);
                monitor.radio_underflow();
            }
            Err(e) => {
                error!("Radio transmit failed for tick {}: {}", job.tti, e);
                monitor.radio_failure();
            }
        }
        args.common.recycle_tx_buffer(buffers);
    }
}
