//! Common Pipeline State
//!
//! Everything shared across ticks and carrier workers of one PHY instance:
//! pending UL grants and DL HARQ-ACKs, per-carrier measurement accumulators,
//! the Tx completion queue and the radio event counters. Each table has its
//! own lock so that work on one carrier never waits for another.

use super::config::PhyConfig;
use super::metrics::{CarrierMetrics, ChannelMetrics, DlMetrics, RadioMetrics, UlMetrics};
use super::pending::PendingTable;
use crate::mac::UlGrant;
use common::{Rnti, Tti};
use interfaces::{RadioEventHandler, RfBufferSet, RfTimestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// HARQ-ACK expected on the PUCCH of a future tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub rnti: Rnti,
    pub cc: usize,
    pub harq_pid: u8,
    /// PUCCH resource derived from the first CCE of the assignment
    pub n_pucch: usize,
    /// Downlink assignment index given to this assignment
    pub dai: u8,
}

/// All HARQ-ACKs due at one tick
#[derive(Debug, Clone, Default)]
pub struct PendingAcks {
    acks: Vec<PendingAck>,
    dai: HashMap<Rnti, u8>,
}

impl PendingAcks {
    /// Entries in the order they were written
    pub fn acks(&self) -> &[PendingAck] {
        &self.acks
    }

    /// Number of assignments sent to `rnti` across carriers
    pub fn nof_assignments(&self, rnti: Rnti) -> u8 {
        self.dai.get(&rnti).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }
}

/// One tick of transmit samples waiting to be sent
#[derive(Debug)]
pub struct TxJob {
    /// Dispatch order assigned by the Tx/Rx thread
    pub seq: u64,
    pub tti: Tti,
    pub tx_time: RfTimestamp,
    /// `None` when transmission was disabled for the tick
    pub buffers: Option<RfBufferSet>,
}

/// Reorders worker completions back into dispatch order
#[derive(Debug, Default)]
struct TxReorder {
    next_emit: u64,
    pending: BTreeMap<u64, TxJob>,
}

/// Radio event counters
#[derive(Debug, Default)]
pub struct RadioMonitor {
    overflow: AtomicU64,
    underflow: AtomicU64,
    late: AtomicU64,
    failure: AtomicU64,
}

impl RadioMonitor {
    pub fn metrics(&self) -> RadioMetrics {
        RadioMetrics {
            nof_overflow: self.overflow.load(Ordering::Relaxed),
            nof_underflow: self.underflow.load(Ordering::Relaxed),
            nof_late: self.late.load(Ordering::Relaxed),
            nof_failure: self.failure.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.overflow.store(0, Ordering::Relaxed);
        self.underflow.store(0, Ordering::Relaxed);
        self.late.store(0, Ordering::Relaxed);
        self.failure.store(0, Ordering::Relaxed);
    }
}

impl RadioEventHandler for RadioMonitor {
    fn radio_overflow(&self) {
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    fn radio_underflow(&self) {
        self.underflow.fetch_add(1, Ordering::Relaxed);
    }

    fn radio_late(&self) {
        self.late.fetch_add(1, Ordering::Relaxed);
    }

    fn radio_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by every worker of one PHY
pub struct PhyCommon {
    config: PhyConfig,
    modulus: u32,
    ul_grants: Vec<Mutex<PendingTable<Vec<UlGrant>>>>,
    dl_acks: Mutex<PendingTable<PendingAcks>>,
    metrics: Vec<Mutex<CarrierMetrics>>,
    tx_queue: Mutex<TxReorder>,
    tx_buffers: Mutex<Vec<RfBufferSet>>,
    radio: RadioMonitor,
    nof_ticks: AtomicU64,
}

impl PhyCommon {
    /// Build empty tables for a validated configuration
    pub fn new(config: &PhyConfig) -> Self {
        let modulus = config.rat.tick_modulus();
        let window = config.pending_window;
        let nof_carriers = config.nof_carriers();

        Self {
            config: config.clone(),
            modulus,
            ul_grants: (0..nof_carriers)
                .map(|_| Mutex::new(PendingTable::new(window, modulus)))
                .collect(),
            dl_acks: Mutex::new(PendingTable::new(window, modulus)),
            metrics: (0..nof_carriers).map(|_| Mutex::new(CarrierMetrics::default())).collect(),
            tx_queue: Mutex::new(TxReorder::default()),
            tx_buffers: Mutex::new(Vec::new()),
            radio: RadioMonitor::default(),
            nof_ticks: AtomicU64::new(0),
        }
    }

    /// Configuration the pipeline was built with
    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    /// Tick modulus of the configured RAT
    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// Store the UL grants signalled at `now` for PUSCH reception at `tti`
    pub fn set_ul_pending_grant(&self, cc: usize, now: Tti, tti: Tti, grants: Vec<UlGrant>) {
        self.ul_grants[cc].lock().set(now, tti, grants);
    }

    /// Take the UL grants due at `tti`; `None` when nothing was stored
    pub fn get_ul_pending_grant(&self, cc: usize, tti: Tti) -> Option<Vec<UlGrant>> {
        self.ul_grants[cc].lock().take(tti)
    }

    /// Register a DL assignment whose HARQ-ACK arrives at `tti`.
    ///
    /// Returns the DAI of the assignment (assignments to the same RNTI for
    /// the same ACK tick, counted across carriers, modulo 4).
    pub fn set_dl_pending_ack(&self, now: Tti, tti: Tti, cc: usize, rnti: Rnti, harq_pid: u8, n_pucch: usize) -> u8 {
        let mut dai = 0;
        self.dl_acks.lock().update(now, tti, PendingAcks::default, |pending| {
            let counter = pending.dai.entry(rnti).or_insert(0);
            *counter += 1;
            dai = (*counter - 1) % 4;
            pending.acks.push(PendingAck {
                rnti,
                cc,
                harq_pid,
                n_pucch,
                dai,
            });
        });
        dai
    }

    /// Take the HARQ-ACKs due at `tti`; `None` when nothing was stored
    pub fn get_dl_pending_ack(&self, tti: Tti) -> Option<PendingAcks> {
        self.dl_acks.lock().take(tti)
    }

    /// Add downlink measurements of one tick to carrier `cc`
    pub fn set_dl_metrics(&self, cc: usize, metrics: &DlMetrics) {
        self.metrics[cc].lock().dl.merge(metrics);
    }

    /// Add uplink measurements of one tick to carrier `cc`
    pub fn set_ul_metrics(&self, cc: usize, metrics: &UlMetrics) {
        self.metrics[cc].lock().ul.merge(metrics);
    }

    /// Add channel measurements of one tick to carrier `cc`
    pub fn set_ch_metrics(&self, cc: usize, metrics: &ChannelMetrics) {
        self.metrics[cc].lock().channel.merge(metrics);
    }

    pub fn get_dl_metrics(&self, cc: usize) -> DlMetrics {
        self.metrics[cc].lock().dl.clone()
    }

    pub fn get_ul_metrics(&self, cc: usize) -> UlMetrics {
        self.metrics[cc].lock().ul.clone()
    }

    pub fn get_ch_metrics(&self, cc: usize) -> ChannelMetrics {
        self.metrics[cc].lock().channel.clone()
    }

    /// Snapshot of every carrier accumulator
    pub fn get_carrier_metrics(&self) -> Vec<CarrierMetrics> {
        self.metrics.iter().map(|m| m.lock().clone()).collect()
    }

    /// Record a preamble detected on carrier `cc`
    pub fn add_prach_detection(&self, cc: usize) {
        self.metrics[cc].lock().channel.nof_prach += 1;
    }

    /// Count a tick handed to the worker pool
    pub fn tick_dispatched(&self) {
        self.nof_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nof_ticks(&self) -> u64 {
        self.nof_ticks.load(Ordering::Relaxed)
    }

    /// Pending entries overwritten before they were consumed
    pub fn nof_pending_overwritten(&self) -> u64 {
        let ul: u64 = self.ul_grants.iter().map(|t| t.lock().nof_overwritten()).sum();
        ul + self.dl_acks.lock().nof_overwritten()
    }

    /// Radio event sink handed to the Tx/Rx thread
    pub fn radio_monitor(&self) -> &RadioMonitor {
        &self.radio
    }

    /// A zeroed Tx buffer set, recycled when one is available
    pub fn take_tx_buffer(&self) -> RfBufferSet {
        match self.tx_buffers.lock().pop() {
            Some(mut buffers) => {
                buffers.zero();
                buffers
            }
            None => RfBufferSet::new(
                self.config.nof_carriers(),
                self.config.nof_ports(),
                self.config.samples_per_tick(),
            ),
        }
    }

    /// Return a transmitted buffer set to the free list
    pub fn recycle_tx_buffer(&self, buffers: RfBufferSet) {
        let mut free = self.tx_buffers.lock();
        if free.len() < self.config.nof_workers + 1 {
            free.push(buffers);
        }
    }

    /// Hand over the Tx samples of the tick dispatched as `seq`
    pub fn worker_end(&self, job: TxJob) {
        let mut queue = self.tx_queue.lock();
        if job.seq < queue.next_emit {
            warn!("Tx job {} completed after its slot was released", job.seq);
            return;
        }
        queue.pending.insert(job.seq, job);
    }

    /// Next Tx job in dispatch order, if it has completed
    pub fn pop_tx_ready(&self) -> Option<TxJob> {
        let mut queue = self.tx_queue.lock();
        let next = queue.next_emit;
        let job = queue.pending.remove(&next)?;
        queue.next_emit += 1;
        Some(job)
    }

    /// Tx jobs completed but held back behind an earlier one
    pub fn nof_tx_waiting(&self) -> usize {
        self.tx_queue.lock().pending.len()
    }

    /// Drop every pending grant/ACK and measurement.
    ///
    /// Callers hold every worker so that no tick is in flight.
    pub fn reset(&self) {
        for table in &self.ul_grants {
            table.lock().clear();
        }
        self.dl_acks.lock().clear();
        for metrics in &self.metrics {
            *metrics.lock() = CarrierMetrics::default();
        }
        debug!("Common pipeline state reset");
    }

    /// Clear the radio event counters
    pub fn reset_radio(&self) {
        self.radio.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(rnti: u16) -> UlGrant {
        UlGrant {
            rnti: Rnti::new(rnti),
            harq_pid: 0,
            mcs: 5,
            ndi: true,
            rv: 0,
            prb_start: 4,
            nof_prb: 4,
            aggregation: 2,
        }
    }

    fn common() -> PhyCommon {
        PhyCommon::new(&PhyConfig::default())
    }

    #[test]
    fn test_ul_pending_grant_exactly_once() {
        let common = common();
        common.set_ul_pending_grant(0, Tti(10), Tti(14), vec![grant(0x46)]);
        assert!(common.get_ul_pending_grant(0, Tti(13)).is_none());
        let grants = common.get_ul_pending_grant(0, Tti(14)).unwrap();
        assert_eq!(grants, vec![grant(0x46)]);
        assert!(common.get_ul_pending_grant(0, Tti(14)).is_none());
    }

    #[test]
    fn test_dl_pending_ack_counts_dai() {
        let mut config = PhyConfig::default();
        config.cells.push(Default::default());
        let common = PhyCommon::new(&config);

        let rnti = Rnti::new(0x46);
        assert_eq!(common.set_dl_pending_ack(Tti(0), Tti(8), 0, rnti, 1, 3), 0);
        assert_eq!(common.set_dl_pending_ack(Tti(0), Tti(8), 1, rnti, 1, 5), 1);
        assert_eq!(common.set_dl_pending_ack(Tti(0), Tti(8), 0, Rnti::new(0x47), 2, 7), 0);

        let acks = common.get_dl_pending_ack(Tti(8)).unwrap();
        assert_eq!(acks.acks().len(), 3);
        assert_eq!(acks.nof_assignments(rnti), 2);
        assert!(common.get_dl_pending_ack(Tti(8)).is_none());
    }

    #[test]
    fn test_tx_jobs_leave_in_dispatch_order() {
        let common = common();
        let job = |seq: u64| TxJob {
            seq,
            tti: Tti(seq as u32),
            tx_time: RfTimestamp(seq * 100),
            buffers: None,
        };

        common.worker_end(job(1));
        common.worker_end(job(2));
        assert!(common.pop_tx_ready().is_none());
        assert_eq!(common.nof_tx_waiting(), 2);

        common.worker_end(job(0));
        let order: Vec<u64> = std::iter::from_fn(|| common.pop_tx_ready()).map(|j| j.seq).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_metrics_accumulate_until_reset() {
        let common = common();
        let mut ch = ChannelMetrics::default();
        ch.add_tick(-20.0);
        common.set_ch_metrics(0, &ch);
        common.set_ch_metrics(0, &ch);
        assert_eq!(common.get_ch_metrics(0).n_samples, 2);
        assert_eq!(common.get_ch_metrics(0).n_samples, 2);

        common.set_ul_pending_grant(0, Tti(0), Tti(4), vec![grant(0x46)]);
        common.reset();
        assert_eq!(common.get_ch_metrics(0).n_samples, 0);
        assert!(common.get_ul_pending_grant(0, Tti(4)).is_none());
    }

    #[test]
    fn test_radio_monitor() {
        let common = common();
        common.radio_monitor().radio_overflow();
        common.radio_monitor().radio_late();
        assert_eq!(common.radio_monitor().metrics().nof_overflow, 1);
        assert_eq!(common.radio_monitor().metrics().nof_late, 1);
        common.reset_radio();
        assert_eq!(common.radio_monitor().metrics(), RadioMetrics::default());
    }

    #[test]
    fn test_tx_buffers_are_recycled_zeroed() {
        let common = common();
        let mut buffers = common.take_tx_buffer();
        assert_eq!(buffers.nof_samples(), 7680);
        buffers.channel_mut(0)[0] = num_complex::Complex32::new(1.0, 0.0);
        common.recycle_tx_buffer(buffers);
        let again = common.take_tx_buffer();
        assert_eq!(again.channel(0)[0], num_complex::Complex32::new(0.0, 0.0));
    }
}
