//! Subframe Worker
//!
//! One pool slot's unit of work: every component carrier of one tick. The
//! uplink of the received tick is decoded first, then the downlink of the
//! tick `tx_delay` ahead is encoded and handed to the Tx/Rx thread.

use super::cc_worker::{CcWorker, MbsfnConfig, SfConfig};
use super::config::PhyConfig;
use super::metrics::UeMetrics;
use super::phy_common::{PhyCommon, TxJob};
use crate::mac::{DlSchedResult, StackInterfacePhy, UlSchedResult};
use crate::LayerError;
use common::{Rnti, Tti};
use interfaces::{RfBufferSet, RfTimestamp};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{error, info_span, trace, warn, Span};

/// Control region used for the uplink pass, where no PDCCH is involved
const UL_CFI: u8 = 2;

/// Per-tick context handed over by the Tx/Rx thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    /// Tick whose samples sit in the worker's Rx buffers
    pub tti_rx: Tti,
    /// Radio time of the first Rx sample
    pub rx_time: RfTimestamp,
    /// Radio time at which the produced downlink must be sent
    pub tx_time: RfTimestamp,
    /// Produce a Tx buffer for this tick
    pub tx_enabled: bool,
    /// Dispatch order, used to release Tx buffers in order
    pub seq: u64,
}

/// Processes all carriers of one tick
pub struct SfWorker {
    id: usize,
    carriers: Vec<CcWorker>,
    common: Arc<PhyCommon>,
    stack: Arc<dyn StackInterfacePhy>,
    context: Mutex<Option<WorkerContext>>,
    rx_buffers: Mutex<RfBufferSet>,
    span: Span,
}

impl SfWorker {
    /// Build worker `id` with one carrier worker per configured cell
    pub fn new(
        id: usize,
        config: &PhyConfig,
        common: Arc<PhyCommon>,
        stack: Arc<dyn StackInterfacePhy>,
        parent: &Span,
    ) -> Result<Self, LayerError> {
        let span = info_span!(parent: parent, "worker", id);
        let carriers = (0..config.nof_carriers())
            .map(|cc| CcWorker::new(cc, config, common.clone(), stack.clone(), &span))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id,
            carriers,
            common,
            stack,
            context: Mutex::new(None),
            rx_buffers: Mutex::new(RfBufferSet::new(
                config.nof_carriers(),
                config.nof_ports(),
                config.samples_per_tick(),
            )),
            span,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn nof_carriers(&self) -> usize {
        self.carriers.len()
    }

    pub fn carrier(&self, cc: usize) -> Option<&CcWorker> {
        self.carriers.get(cc)
    }

    /// Rx buffers filled by the Tx/Rx thread while the worker is reserved
    pub fn rx_buffers(&self) -> MutexGuard<'_, RfBufferSet> {
        self.rx_buffers.lock()
    }

    /// Store the context of the next tick; exactly once per reservation
    pub fn set_context(&self, context: WorkerContext) {
        let mut slot = self.context.lock();
        if let Some(previous) = slot.as_ref() {
            error!(
                "Worker {}: context for tick {} set while tick {} is pending",
                self.id, context.tti_rx, previous.tti_rx
            );
            panic!("worker {} context set twice", self.id);
        }
        *slot = Some(context);
    }

    /// Pool entry point: process the tick stored by `set_context`
    pub fn work_imp(&self) {
        let _enter = self.span.enter();
        let Some(context) = self.context.lock().take() else {
            error!("Worker {} started without context", self.id);
            return;
        };

        let config = self.common.config();
        let modulus = self.common.modulus();
        let tti_rx = context.tti_rx;
        let tti_tx_dl = tti_rx.add(config.timing.tx_delay, modulus);
        let tti_pusch = tti_tx_dl.add(config.timing.k_pusch, modulus);
        trace!("Worker {}: rx tick {} tx tick {}", self.id, tti_rx, tti_tx_dl);

        self.work_ul(tti_rx);

        let nof_carriers = self.carriers.len();
        let mut dl_sched = vec![DlSchedResult::default(); nof_carriers];
        let mut ul_sched = vec![UlSchedResult::default(); nof_carriers];
        self.stack.get_dl_sched(tti_tx_dl, &mut dl_sched);
        self.stack.get_ul_sched(tti_tx_dl, &mut ul_sched);

        let tick_in_frame = tti_tx_dl.tick_in_frame(config.rat.ticks_per_frame());
        let mbsfn = MbsfnConfig {
            is_mbsfn: config.is_mbsfn(tick_in_frame),
            non_mbsfn_region: config.mbsfn_control_symbols,
        };

        let mut tx = context.tx_enabled.then(|| self.common.take_tx_buffer());
        for (cc, carrier) in self.carriers.iter().enumerate() {
            let Some(tx) = tx.as_mut() else {
                break;
            };
            let sf_cfg = SfConfig {
                tti: tti_tx_dl,
                tti_rx,
                cfi: dl_sched[cc].cfi,
            };
            match carrier.work_dl(&sf_cfg, &dl_sched[cc], &ul_sched[cc].grants, &mbsfn, tx) {
                Ok((signalled, dl_metrics)) => {
                    self.common.set_ul_pending_grant(cc, tti_rx, tti_pusch, signalled);
                    self.common.set_dl_metrics(cc, &dl_metrics);
                }
                Err(e) => warn!("Carrier {} downlink of tick {} failed: {}", cc, tti_tx_dl, e),
            }
        }

        self.common.worker_end(TxJob {
            seq: context.seq,
            tti: tti_tx_dl,
            tx_time: context.tx_time,
            buffers: tx,
        });
    }

    fn work_ul(&self, tti_rx: Tti) {
        let rx = self.rx_buffers.lock();
        for (cc, carrier) in self.carriers.iter().enumerate() {
            let grants = self.common.get_ul_pending_grant(cc, tti_rx).unwrap_or_default();
            let sf_cfg = SfConfig {
                tti: tti_rx,
                tti_rx,
                cfi: UL_CFI,
            };
            match carrier.work_ul(&sf_cfg, &grants, &rx) {
                Ok((ul_metrics, ch_metrics)) => {
                    self.common.set_ul_metrics(cc, &ul_metrics);
                    self.common.set_ch_metrics(cc, &ch_metrics);
                }
                Err(e) => warn!("Carrier {} uplink of tick {} failed: {}", cc, tti_rx, e),
            }
        }
    }

    /// Create the UE context of `rnti` on every carrier
    pub fn add_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
        if self.carriers_with_rnti(rnti) > 0 {
            return Err(LayerError::DuplicateRnti(rnti));
        }
        for carrier in &self.carriers {
            carrier.add_rnti(rnti)?;
        }
        Ok(())
    }

    /// Drop the UE context of `rnti` from every carrier
    pub fn rem_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
        if self.carriers_with_rnti(rnti) < self.carriers.len() {
            return Err(LayerError::UnknownRnti(rnti));
        }
        for carrier in &self.carriers {
            carrier.rem_rnti(rnti)?;
        }
        Ok(())
    }

    /// Carriers holding a context for `rnti`
    pub fn carriers_with_rnti(&self, rnti: Rnti) -> usize {
        self.carriers.iter().filter(|c| c.has_rnti(rnti)).count()
    }

    /// RNTIs attached on carrier `cc`
    pub fn get_nof_rnti(&self, cc: usize) -> usize {
        self.carriers.get(cc).map(|c| c.get_nof_rnti()).unwrap_or(0)
    }

    /// Append the UE measurements of every carrier to `metrics`
    pub fn get_metrics(&self, metrics: &mut Vec<UeMetrics>) {
        for carrier in &self.carriers {
            metrics.extend(carrier.get_metrics());
        }
    }
}
