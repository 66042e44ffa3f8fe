//! Physical Layer (PHY)
//!
//! Real-time LTE/NR PHY pipeline. The `Phy` facade wires:
//! - a pool of subframe workers, each processing every component carrier of
//!   one tick (`sf_worker`, `cc_worker`, `worker_pool`)
//! - the common state shared across ticks (`phy_common`)
//! - the Tx/Rx thread that paces everything on the radio (`txrx`)
//! - the background PRACH detectors (`prach_worker`)
//!
//! The channel primitives (OFDM, reference signals, PDCCH, shared channel,
//! PUCCH, PRACH) are simplified models, not bit-exact 3GPP implementations.

pub mod cc_worker;
pub mod chest;
pub mod config;
pub mod grid;
pub mod metrics;
pub mod modulation;
pub mod ofdm;
pub mod pdcch;
pub mod pending;
pub mod phy_common;
pub mod prach;
pub mod prach_worker;
pub mod pucch;
pub mod sch;
pub mod sequence;
pub mod sf_worker;
pub mod txrx;
pub mod worker_pool;

pub use cc_worker::{CcWorker, DlDecodeResult, MbsfnConfig, SfConfig};
pub use config::{CellConfig, HarqTiming, PhyConfig, PrachConfig, MAX_CARRIERS, MAX_WORKERS};
pub use metrics::{CarrierMetrics, PhyMetrics, UeMetrics};
pub use phy_common::PhyCommon;
pub use prach_worker::PrachWorkerPool;
pub use sf_worker::{SfWorker, WorkerContext};
pub use txrx::{TxRx, TxRxArgs};
pub use worker_pool::{WorkerHandle, WorkerPool, WorkerState, WorkerTask};

use crate::mac::{PhyInterfaceStack, StackInterfacePhy};
use crate::LayerError;
use common::{Rnti, Tti};
use interfaces::RadioInterface;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, info_span, Span};

/// Logging context handed to every component of one PHY instance.
///
/// Each thread enters a child span of `root`, so every record carries the
/// instance name and the worker/carrier it comes from.
#[derive(Debug, Clone)]
pub struct PhyLogContext {
    root: Span,
}

impl PhyLogContext {
    pub fn new(name: &str) -> Self {
        Self {
            root: info_span!("phy", name = %name),
        }
    }

    pub fn root(&self) -> &Span {
        &self.root
    }

    pub fn txrx(&self) -> Span {
        info_span!(parent: &self.root, "txrx")
    }
}

/// PHY instance: worker pool, Tx/Rx thread and PRACH pool over one radio
pub struct Phy {
    config: PhyConfig,
    common: Arc<PhyCommon>,
    workers: Arc<WorkerPool<SfWorker>>,
    prach: Arc<PrachWorkerPool>,
    txrx: TxRx,
    log: PhyLogContext,
}

impl Phy {
    /// Validate `config`, build the pipeline and start it on `radio`
    pub fn init(
        config: PhyConfig,
        radio: Arc<dyn RadioInterface>,
        stack: Arc<dyn StackInterfacePhy>,
        log: PhyLogContext,
    ) -> Result<Self, LayerError> {
        config.validate()?;
        if radio.nof_channels() != config.nof_radio_channels() {
            return Err(LayerError::InvalidConfiguration(format!(
                "radio has {} channels, {} carriers x {} ports need {}",
                radio.nof_channels(),
                config.nof_carriers(),
                config.nof_ports(),
                config.nof_radio_channels()
            )));
        }

        let common = Arc::new(PhyCommon::new(&config));

        let task: WorkerTask<SfWorker> = Arc::new(|worker: &SfWorker| worker.work_imp());
        let workers = Arc::new(WorkerPool::new("phy", config.nof_workers, task));
        for id in 0..config.nof_workers {
            let worker = SfWorker::new(id, &config, common.clone(), stack.clone(), log.root())?;
            workers.init_worker(id, worker, config.worker_priority)?;
        }

        let prach = Arc::new(PrachWorkerPool::init(&config, common.clone(), stack.clone(), log.root())?);

        let txrx = TxRx::init(
            TxRxArgs {
                radio,
                workers: workers.clone(),
                common: common.clone(),
                prach: prach.clone(),
                stack,
            },
            Tti(0),
            config.txrx_priority,
            log.txrx(),
        )?;

        info!(
            "PHY started: {} carriers x {} PRB, {} workers, {} ({} samples per tick)",
            config.nof_carriers(),
            config.cells[0].nof_prb,
            config.nof_workers,
            config.rat,
            config.samples_per_tick()
        );

        Ok(Self {
            config,
            common,
            workers,
            prach,
            txrx,
            log,
        })
    }

    pub fn config(&self) -> &PhyConfig {
        &self.config
    }

    pub fn common(&self) -> &Arc<PhyCommon> {
        &self.common
    }

    pub fn log(&self) -> &PhyLogContext {
        &self.log
    }

    /// Subframe worker of pool slot `id`
    pub fn worker(&self, id: usize) -> Option<Arc<SfWorker>> {
        self.workers.worker(id)
    }

    /// False once the Tx/Rx thread left its loop
    pub fn is_running(&self) -> bool {
        self.txrx.is_running()
    }

    /// Last tick handed to the worker pool
    pub fn last_tti(&self) -> Tti {
        self.txrx.last_tti()
    }

    /// Ticks handed to the worker pool so far
    pub fn nof_ticks(&self) -> u64 {
        self.common.nof_ticks()
    }

    /// Attached RNTIs as seen by each pool worker, per carrier
    pub fn get_nof_rnti_per_worker(&self) -> Vec<Vec<usize>> {
        (0..self.workers.nof_workers())
            .filter_map(|id| self.workers.worker(id))
            .map(|w| (0..w.nof_carriers()).map(|cc| w.get_nof_rnti(cc)).collect())
            .collect()
    }

    /// Attached RNTIs per carrier
    pub fn get_nof_rnti_per_carrier(&self) -> Vec<usize> {
        self.workers
            .worker(0)
            .map(|w| (0..w.nof_carriers()).map(|cc| w.get_nof_rnti(cc)).collect())
            .unwrap_or_default()
    }

    /// Stop the Tx/Rx thread, then the pool, then the PRACH detectors
    pub fn stop(&self) {
        self.txrx.stop();
        self.workers.stop();
        self.prach.stop();
    }
}

impl Drop for Phy {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PhyInterfaceStack for Phy {
    fn add_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
        // every slot is checked before any of them changes
        let workers: Vec<_> = (0..self.workers.nof_workers())
            .filter_map(|id| self.workers.worker(id))
            .collect();
        if workers.iter().any(|w| w.carriers_with_rnti(rnti) > 0) {
            return Err(LayerError::DuplicateRnti(rnti));
        }
        for worker in &workers {
            worker.add_rnti(rnti)?;
        }
        info!("RNTI {} added", rnti);
        Ok(())
    }

    fn rem_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
        let workers: Vec<_> = (0..self.workers.nof_workers())
            .filter_map(|id| self.workers.worker(id))
            .collect();
        if workers.iter().any(|w| w.carriers_with_rnti(rnti) < w.nof_carriers()) {
            return Err(LayerError::UnknownRnti(rnti));
        }
        for worker in &workers {
            worker.rem_rnti(rnti)?;
        }
        info!("RNTI {} removed", rnti);
        Ok(())
    }

    fn get_nof_rnti(&self) -> usize {
        self.workers.worker(0).map(|w| w.get_nof_rnti(0)).unwrap_or(0)
    }

    fn get_metrics(&self) -> PhyMetrics {
        let mut per_worker = Vec::new();
        for id in 0..self.workers.nof_workers() {
            if let Some(worker) = self.workers.worker(id) {
                worker.get_metrics(&mut per_worker);
            }
        }

        let mut merged: HashMap<(Rnti, usize), UeMetrics> = HashMap::new();
        for ue in per_worker {
            merged
                .entry((ue.rnti, ue.cc))
                .and_modify(|m| m.merge(&ue))
                .or_insert(ue);
        }
        let mut ues: Vec<UeMetrics> = merged.into_values().collect();
        ues.sort_by_key(|m| (m.rnti, m.cc));

        PhyMetrics {
            carriers: self.common.get_carrier_metrics(),
            ues,
            radio: self.common.radio_monitor().metrics(),
            nof_ticks: self.common.nof_ticks(),
            nof_prach_dropped: self.prach.nof_dropped(),
            nof_pending_overwritten: self.common.nof_pending_overwritten(),
        }
    }

    fn reset(&self) {
        // hold every worker so that no tick is in flight
        let handles: Vec<_> = (0..self.workers.nof_workers())
            .filter_map(|id| self.workers.wait_worker_id(id).ok())
            .collect();
        self.common.reset();
        self.common.reset_radio();
        drop(handles);
        info!("PHY state reset");
    }
}
