//! PRACH Worker Pool
//!
//! Preamble detection runs off the tick path. The Tx/Rx thread hands every Rx
//! tick to `new_tti`; ticks belonging to a PRACH occasion are collected per
//! carrier and, once the occasion is complete, queued to that carrier's
//! detector thread. A full queue drops the occasion without blocking the
//! caller.

use super::config::PhyConfig;
use super::phy_common::PhyCommon;
use super::prach::{is_occasion, PrachDetector};
use crate::mac::StackInterfacePhy;
use crate::threading::spawn_rt_thread;
use crate::LayerError;
use common::{Rat, Tti};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use num_complex::Complex32;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Span};

struct PrachJob {
    /// First tick of the occasion
    tti: Tti,
    samples: Vec<Complex32>,
}

/// Occasion being assembled for one carrier
struct Collector {
    tti: Tti,
    samples: Vec<Complex32>,
}

/// Background PRACH detection, one thread per carrier
pub struct PrachWorkerPool {
    rat: Rat,
    config_index: u8,
    occasion_len: usize,
    senders: Mutex<Vec<Sender<PrachJob>>>,
    collectors: Vec<Mutex<Option<Collector>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    nof_dropped: AtomicU64,
    nof_queued: AtomicU64,
}

impl PrachWorkerPool {
    /// Start one detector thread per carrier; nothing runs when PRACH is disabled
    pub fn init(
        config: &PhyConfig,
        common: Arc<PhyCommon>,
        stack: Arc<dyn StackInterfacePhy>,
        parent: &Span,
    ) -> Result<Self, LayerError> {
        let nof_carriers = config.nof_carriers();
        let mut senders = Vec::new();
        let mut threads = Vec::new();
        let mut occasion_len = 0;

        if config.prach.enabled {
            for (cc, cell) in config.cells.iter().enumerate() {
                let mut detector =
                    PrachDetector::new(&config.prach, cell.nof_prb, cell.fft_size(), config.rat.numerology())?;
                occasion_len = detector.occasion_len();

                let (tx, rx) = bounded(config.prach.queue_depth);
                let span = info_span!(parent: parent, "prach", cc);
                let common = common.clone();
                let stack = stack.clone();
                let handle = spawn_rt_thread(format!("prach-{}", cc), config.prach_priority, move || {
                    let _enter = span.enter();
                    prach_loop(cc, &mut detector, rx, common.as_ref(), stack.as_ref())
                })
                .map_err(|e| LayerError::InitializationFailed(format!("PRACH thread {}: {}", cc, e)))?;

                senders.push(tx);
                threads.push(handle);
            }
            info!("PRACH pool started for {} carriers", nof_carriers);
        }

        Ok(Self {
            rat: config.rat,
            config_index: config.prach.config_index,
            occasion_len,
            senders: Mutex::new(senders),
            collectors: (0..nof_carriers).map(|_| Mutex::new(None)).collect(),
            threads: Mutex::new(threads),
            nof_dropped: AtomicU64::new(0),
            nof_queued: AtomicU64::new(0),
        })
    }

    /// Whether `tti` lies in a PRACH occasion
    pub fn is_occasion_tti(&self, tti: Tti) -> bool {
        let ticks_per_frame = self.rat.ticks_per_frame();
        let subframe = tti.tick_in_frame(ticks_per_frame) / self.rat.ticks_per_subframe();
        is_occasion(self.config_index, tti.sfn(ticks_per_frame), subframe)
    }

    /// Offer the Rx samples of `tti` on carrier `cc`; never blocks.
    ///
    /// Returns true when the tick completed an occasion that was queued.
    pub fn new_tti(&self, cc: usize, tti: Tti, samples: &[Complex32]) -> bool {
        if self.occasion_len == 0 || cc >= self.collectors.len() || !self.is_occasion_tti(tti) {
            return false;
        }

        let mut collector = self.collectors[cc].lock();
        if tti.0 % self.rat.ticks_per_subframe() == 0 {
            *collector = Some(Collector {
                tti,
                samples: Vec::with_capacity(self.occasion_len),
            });
        }
        let Some(current) = collector.as_mut() else {
            // joined mid subframe
            return false;
        };
        current.samples.extend_from_slice(samples);
        if current.samples.len() < self.occasion_len {
            return false;
        }

        let Some(Collector { tti, samples }) = collector.take() else {
            return false;
        };
        let senders = self.senders.lock();
        let Some(sender) = senders.get(cc) else {
            return false;
        };
        match sender.try_send(PrachJob { tti, samples }) {
            Ok(()) => {
                self.nof_queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("PRACH queue of carrier {} full, occasion {} dropped", cc, tti);
                self.nof_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Occasions dropped because a detector was busy
    pub fn nof_dropped(&self) -> u64 {
        self.nof_dropped.load(Ordering::Relaxed)
    }

    /// Occasions handed to the detectors
    pub fn nof_queued(&self) -> u64 {
        self.nof_queued.load(Ordering::Relaxed)
    }

    /// Close the queues, let queued occasions finish and join the threads
    pub fn stop(&self) {
        self.senders.lock().clear();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("PRACH thread panicked");
            }
        }
    }
}

impl Drop for PrachWorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn prach_loop(
    cc: usize,
    detector: &mut PrachDetector,
    jobs: Receiver<PrachJob>,
    common: &PhyCommon,
    stack: &dyn StackInterfacePhy,
) {
    for job in jobs.iter() {
        let detections = match detector.detect(&job.samples) {
            Ok(detections) => detections,
            Err(e) => {
                warn!("PRACH occasion {} on carrier {}: {}", job.tti, cc, e);
                continue;
            }
        };
        trace!("PRACH occasion {}: {} detections", job.tti, detections.len());

        for detection in detections {
            info!(
                "PRACH cc={} tti={} preamble={} ta={} ({:.1} us) metric={:.1}",
                cc, job.tti, detection.preamble, detection.ta, detection.delay_us, detection.metric
            );
            common.add_prach_detection(cc);
            stack.rach_detected(job.tti, cc, detection.preamble, detection.ta);
        }
    }
    debug!("PRACH worker {} exiting", cc);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::{DlSchedResult, UlSchedResult};
    use crate::phy::prach::PrachGenerator;
    use bytes::Bytes;
    use common::Rnti;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RachStack {
        detected: Mutex<Vec<(Tti, usize, u8, u32)>>,
    }

    impl StackInterfacePhy for RachStack {
        fn tti_clock(&self) {}
        fn get_dl_sched(&self, _: Tti, _: &mut [DlSchedResult]) {}
        fn get_ul_sched(&self, _: Tti, _: &mut [UlSchedResult]) {}
        fn crc_info(&self, _: Tti, _: Rnti, _: usize, _: u8, _: bool, _: usize) {}
        fn push_pdu(&self, _: Tti, _: Rnti, _: usize, _: Bytes) {}
        fn ack_info(&self, _: Tti, _: Rnti, _: usize, _: u8, _: bool) {}
        fn snr_info(&self, _: Tti, _: Rnti, _: usize, _: f32) {}
        fn rach_detected(&self, tti: Tti, cc: usize, preamble: u8, ta: u32) {
            self.detected.lock().push((tti, cc, preamble, ta));
        }
    }

    fn pool(config: &PhyConfig) -> (PrachWorkerPool, Arc<PhyCommon>, Arc<RachStack>) {
        let common = Arc::new(PhyCommon::new(config));
        let stack = Arc::new(RachStack::default());
        let pool = PrachWorkerPool::init(config, common.clone(), stack.clone(), &Span::none()).unwrap();
        (pool, common, stack)
    }

    #[test]
    fn test_preamble_reaches_stack() {
        let config = PhyConfig::default();
        let (pool, common, stack) = pool(&config);
        let cell = &config.cells[0];
        let generator = PrachGenerator::new(&config.prach, cell.nof_prb, cell.fft_size(), 0);
        let samples = generator.generate(11, 0).unwrap();

        // config index 3: subframe 1 of every frame
        assert!(!pool.new_tti(0, Tti(0), &samples));
        assert!(pool.new_tti(0, Tti(1), &samples));

        let deadline = Instant::now() + Duration::from_secs(10);
        while stack.detected.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.stop();

        let detected = stack.detected.lock().clone();
        assert!(detected.contains(&(Tti(1), 0, 11, 0)));
        assert!(common.get_ch_metrics(0).nof_prach >= 1);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let mut config = PhyConfig::default();
        config.prach.queue_depth = 1;
        let (pool, _, _) = pool(&config);
        let samples = vec![Complex32::new(0.0, 0.0); config.samples_per_tick()];

        let mut queued = 0;
        for frame in 0..64u32 {
            if pool.new_tti(0, Tti(frame * 10 + 1), &samples) {
                queued += 1;
            }
        }
        assert_eq!(queued + pool.nof_dropped(), 64);
        assert_eq!(pool.nof_queued(), queued);
        pool.stop();
        assert!(!pool.new_tti(0, Tti(1), &samples));
    }

    #[test]
    fn test_disabled_pool_ignores_ticks() {
        let mut config = PhyConfig::default();
        config.prach.enabled = false;
        let (pool, _, _) = pool(&config);
        let samples = vec![Complex32::new(0.0, 0.0); config.samples_per_tick()];
        assert!(!pool.new_tti(0, Tti(1), &samples));
        pool.stop();
    }
}
