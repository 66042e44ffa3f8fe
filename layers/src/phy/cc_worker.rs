//! Per-Carrier Worker
//!
//! Runs the channel primitives of one component carrier for one tick. Every
//! subframe worker owns one `CcWorker` per carrier, and each of them keeps its
//! own map of UE contexts (softbuffers and measurements) so that workers of
//! different ticks never contend for per-UE state. The map lock is only shared
//! with the control path (`add_rnti`/`rem_rnti`).

use super::chest::{crs_values, estimate_dl, estimate_pusch, pusch_dmrs_values, ChannelEstimate};
use super::config::{PhyConfig, NOF_HARQ_PROCESSES};
use super::grid::{
    crs_subcarriers, pdsch_res, pucch_subcarrier, pusch_res, ResourceGrid, Re, CRS_SYMBOLS, PUSCH_DMRS_SYMBOLS,
    SUBCARRIERS_PER_PRB,
};
use super::metrics::{ChannelMetrics, DlMetrics, UeMetrics, UlMetrics};
use super::modulation::{demodulate_soft, modulate};
use super::ofdm::{OfdmDemodulator, OfdmModulator};
use super::pdcch::{CceAllocator, ControlRegion, Dci, DciFormat, PdcchLocation, AGGREGATION_LEVELS};
use super::phy_common::PhyCommon;
use super::sch::{self, scrambling_c_init, SchDecodeResult, Softbuffer};
use super::config::CellConfig;
use super::pucch;
use crate::mac::{DlGrant, DlSchedResult, StackInterfacePhy, UlGrant};
use crate::LayerError;
use bytes::{Bytes, BytesMut};
use common::{power_to_db, ModulationScheme, Rat, Rnti, Tti};
use interfaces::RfBufferSet;
use num_complex::Complex32;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info_span, trace, warn, Span};

/// Gap after which a UE-side DL softbuffer no longer combines
const DL_COMBINING_GAP: u32 = 4 * NOF_HARQ_PROCESSES as u32;

/// Per-tick parameters of one carrier call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SfConfig {
    /// Tick processed by this call (Rx tick for UL, Tx tick for DL)
    pub tti: Tti,
    /// Rx tick of the owning worker, reference for pending table writes
    pub tti_rx: Tti,
    /// Control region size in symbols
    pub cfi: u8,
}

/// MBSFN layout of a downlink tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbsfnConfig {
    pub is_mbsfn: bool,
    /// Symbols of unicast control region kept in an MBSFN subframe
    pub non_mbsfn_region: u8,
}

/// Outcome of a UE-side downlink receive
#[derive(Debug, Clone, PartialEq)]
pub struct DlDecodeResult {
    pub dci: Dci,
    pub location: PdcchLocation,
    pub crc_ok: bool,
    pub data: Option<Bytes>,
    pub nof_combined: u32,
    /// UL grant found in the same search
    pub ul_dci: Option<Dci>,
}

struct UeContext {
    ul_softbuffers: Vec<Softbuffer>,
    dl_softbuffers: Vec<Softbuffer>,
    metrics: UeMetrics,
}

impl UeContext {
    fn new(rnti: Rnti, cc: usize) -> Self {
        Self {
            ul_softbuffers: (0..NOF_HARQ_PROCESSES).map(|_| Softbuffer::new()).collect(),
            dl_softbuffers: (0..NOF_HARQ_PROCESSES).map(|_| Softbuffer::new()).collect(),
            metrics: UeMetrics::new(rnti, cc),
        }
    }
}

struct CcDsp {
    modulator: OfdmModulator,
    demodulator: OfdmDemodulator,
    dl_grid: ResourceGrid,
    ul_grid: ResourceGrid,
}

/// Channel processing of one component carrier
pub struct CcWorker {
    cc: usize,
    cell: CellConfig,
    rat: Rat,
    ticks_per_frame: u32,
    modulus: u32,
    k_ack: u32,
    ul_combining_gap: u32,
    pucch_threshold: f32,
    ues: Mutex<HashMap<Rnti, UeContext>>,
    dsp: Mutex<CcDsp>,
    common: Arc<PhyCommon>,
    stack: Arc<dyn StackInterfacePhy>,
    span: Span,
}

impl CcWorker {
    /// Create the worker of carrier `cc`
    pub fn new(
        cc: usize,
        config: &PhyConfig,
        common: Arc<PhyCommon>,
        stack: Arc<dyn StackInterfacePhy>,
        parent: &Span,
    ) -> Result<Self, LayerError> {
        let cell = config
            .cells
            .get(cc)
            .cloned()
            .ok_or_else(|| LayerError::InvalidConfiguration(format!("no cell for carrier {}", cc)))?;
        let fft_size = cell.fft_size();
        let numerology = config.rat.numerology();

        let dsp = CcDsp {
            modulator: OfdmModulator::new(fft_size, numerology)?,
            demodulator: OfdmDemodulator::new(fft_size, numerology)?,
            dl_grid: ResourceGrid::new(cell.nof_prb),
            ul_grid: ResourceGrid::new(cell.nof_prb),
        };

        Ok(Self {
            cc,
            cell,
            rat: config.rat,
            ticks_per_frame: config.rat.ticks_per_frame(),
            modulus: config.rat.tick_modulus(),
            k_ack: config.timing.k_ack,
            ul_combining_gap: config.timing.tx_delay + config.timing.k_pusch,
            pucch_threshold: config.pucch_threshold,
            ues: Mutex::new(HashMap::new()),
            dsp: Mutex::new(dsp),
            common,
            stack,
            span: info_span!(parent: parent, "cc", cc),
        })
    }

    /// Carrier index
    pub fn cc(&self) -> usize {
        self.cc
    }

    fn tick_in_frame(&self, tti: Tti) -> u32 {
        tti.tick_in_frame(self.ticks_per_frame)
    }

    fn slot_in_subframe(&self, tti: Tti) -> u32 {
        tti.0 % self.rat.ticks_per_subframe()
    }

    /// Create the context of `rnti`
    pub fn add_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
        let mut ues = self.ues.lock();
        if ues.contains_key(&rnti) {
            return Err(LayerError::DuplicateRnti(rnti));
        }
        ues.insert(rnti, UeContext::new(rnti, self.cc));
        Ok(())
    }

    /// Drop the context of `rnti`
    pub fn rem_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
        self.ues
            .lock()
            .remove(&rnti)
            .map(|_| ())
            .ok_or(LayerError::UnknownRnti(rnti))
    }

    pub fn get_nof_rnti(&self) -> usize {
        self.ues.lock().len()
    }

    pub fn has_rnti(&self, rnti: Rnti) -> bool {
        self.ues.lock().contains_key(&rnti)
    }

    /// Accumulated measurements of every UE on this carrier
    pub fn get_metrics(&self) -> Vec<UeMetrics> {
        self.ues.lock().values().map(|ue| ue.metrics.clone()).collect()
    }

    fn check_allocation(&self, prb_start: u16, nof_prb: u16, mcs: u8, aggregation: u8) -> Result<(), String> {
        if nof_prb == 0 || prb_start as u32 + nof_prb as u32 > self.cell.nof_prb as u32 {
            return Err(format!("PRB {}+{} outside {} PRB", prb_start, nof_prb, self.cell.nof_prb));
        }
        if mcs > ModulationScheme::MAX_MCS {
            return Err(format!("MCS {}", mcs));
        }
        if !AGGREGATION_LEVELS.contains(&aggregation) {
            return Err(format!("aggregation level {}", aggregation));
        }
        Ok(())
    }

    /// Uplink processing of the Rx tick: channel estimation, PUCCH, then PUSCH
    pub fn work_ul(&self, sf_cfg: &SfConfig, ul_grants: &[UlGrant], rx: &RfBufferSet) -> Result<(UlMetrics, ChannelMetrics), LayerError> {
        let _enter = self.span.enter();
        let tti = sf_cfg.tti;
        let tick = self.tick_in_frame(tti);
        let mut dsp = self.dsp.lock();
        let CcDsp {
            demodulator, ul_grid, ..
        } = &mut *dsp;

        demodulator.demodulate(rx.get(self.cc, 0), self.slot_in_subframe(tti), ul_grid)?;

        let mut channel = ChannelMetrics::default();
        let rssi_db = power_to_db(ul_grid.average_power());
        channel.add_tick(rssi_db);

        let mut ul = UlMetrics::default();

        // HARQ-ACKs of every carrier are bundled on the primary cell
        if self.cc == 0 {
            if let Some(pending) = self.common.get_dl_pending_ack(tti) {
                self.decode_pucch(tti, tick, ul_grid, &pending, &mut ul);
            }
        }

        let mut ues = self.ues.lock();
        for grant in ul_grants {
            if let Err(e) = self.check_allocation(grant.prb_start, grant.nof_prb, grant.mcs, grant.aggregation) {
                warn!("Dropping PUSCH of {}: {}", grant.rnti, e);
                continue;
            }
            let tbs = grant.tbs();
            if tbs == 0 {
                warn!("Dropping PUSCH of {}: empty transport block", grant.rnti);
                continue;
            }

            let chest = estimate_pusch(ul_grid, tick, self.cell.pci, grant.prb_start, grant.nof_prb);
            let k0 = SUBCARRIERS_PER_PRB * grant.prb_start as usize;
            let k1 = k0 + SUBCARRIERS_PER_PRB * grant.nof_prb as usize;
            let sinr_db = chest.snr_db(k0, k1);

            let res = pusch_res(grant.prb_start, grant.nof_prb);
            let mut llrs = equalize_and_demap(ul_grid, &chest, &res, grant.mcs);
            let c_init = scrambling_c_init(grant.rnti.value(), tick, self.cell.pci);

            let mut scratch = Softbuffer::new();
            let ue = ues.get_mut(&grant.rnti);
            if ue.is_none() {
                debug!("PUSCH for {} without UE context", grant.rnti);
            }
            let softbuffer = match ue {
                Some(ue) => &mut ue.ul_softbuffers[grant.harq_pid as usize % NOF_HARQ_PROCESSES],
                None => &mut scratch,
            };
            softbuffer.begin(grant.ndi, tbs, tti, self.ul_combining_gap, self.modulus);
            let result = sch::decode(&mut llrs, grant.rv, c_init, softbuffer);

            trace!(
                "PUSCH rnti={} pid={} crc={} combined={} sinr={:.1}dB",
                grant.rnti,
                grant.harq_pid,
                result.crc_ok,
                result.nof_combined,
                sinr_db
            );

            ul.add_pusch(grant.mcs, sinr_db, result.crc_ok, tbs);
            if let Some(ue) = ues.get_mut(&grant.rnti) {
                ue.metrics
                    .add_ul(grant.mcs, sinr_db, rssi_db, result.crc_ok, result.nof_combined);
            }

            self.stack.snr_info(tti, grant.rnti, self.cc, sinr_db);
            self.stack
                .crc_info(tti, grant.rnti, self.cc, grant.harq_pid, result.crc_ok, tbs);
            if let Some(data) = result.data {
                self.stack.push_pdu(tti, grant.rnti, self.cc, data);
            }
        }

        Ok((ul, channel))
    }

    fn decode_pucch(&self, tti: Tti, tick: u32, grid: &ResourceGrid, pending: &super::phy_common::PendingAcks, ul: &mut UlMetrics) {
        let mut handled: Vec<Rnti> = Vec::new();
        for entry in pending.acks() {
            if handled.contains(&entry.rnti) {
                continue;
            }
            handled.push(entry.rnti);

            // the UE answers on the resource of its last assignment
            let last = pending
                .acks()
                .iter()
                .filter(|a| a.rnti == entry.rnti)
                .max_by_key(|a| a.dai)
                .unwrap_or(entry);
            let k = pucch_subcarrier(last.n_pucch, self.cell.nof_prb, self.cell.nof_pucch_prb);
            let result = pucch::detect(grid, k, last.n_pucch, tick, self.cell.pci, self.pucch_threshold);
            ul.add_ack(result.ack);

            trace!(
                "PUCCH rnti={} n_pucch={} ack={:?} snr={:.1}dB",
                entry.rnti,
                last.n_pucch,
                result.ack,
                result.snr_db
            );

            for ack in pending.acks().iter().filter(|a| a.rnti == entry.rnti) {
                self.stack
                    .ack_info(tti, ack.rnti, ack.cc, ack.harq_pid, result.ack.unwrap_or(false));
            }
        }
    }

    /// Downlink processing of the Tx tick: reference signals, PDCCH, then PDSCH.
    ///
    /// Returns the UL grants that were actually signalled, which are the only
    /// ones whose PUSCH will be decoded.
    pub fn work_dl(
        &self,
        sf_cfg: &SfConfig,
        dl_sched: &DlSchedResult,
        ul_grants: &[UlGrant],
        mbsfn: &MbsfnConfig,
        tx: &mut RfBufferSet,
    ) -> Result<(Vec<UlGrant>, DlMetrics), LayerError> {
        let _enter = self.span.enter();
        let tti = sf_cfg.tti;
        let tick = self.tick_in_frame(tti);
        let v_shift = self.cell.v_shift();
        let cfi = if mbsfn.is_mbsfn {
            sf_cfg.cfi.min(mbsfn.non_mbsfn_region)
        } else {
            sf_cfg.cfi
        }
        .clamp(1, 3);

        let mut dsp = self.dsp.lock();
        let CcDsp { modulator, dl_grid, .. } = &mut *dsp;
        dl_grid.clear();

        for &l in CRS_SYMBOLS.iter().filter(|&&l| !mbsfn.is_mbsfn || l < cfi as usize) {
            let reference = crs_values(tick, l, self.cell.pci, self.cell.nof_prb);
            for (m, k) in crs_subcarriers(self.cell.nof_prb, v_shift).enumerate() {
                dl_grid.set((k, l), reference[m]);
            }
        }

        let region = ControlRegion::new(self.cell.nof_prb, cfi, self.cell.pci, v_shift, tick);
        let mut cces = CceAllocator::new(region.nof_cce(), tick);
        let mut metrics = DlMetrics::default();

        if mbsfn.is_mbsfn && !dl_sched.grants.is_empty() {
            debug!("MBSFN tick {}: {} DL grants not transmitted", tti, dl_sched.grants.len());
        }
        let dl_grants: &[DlGrant] = if mbsfn.is_mbsfn { &[] } else { &dl_sched.grants };

        for grant in dl_grants {
            if let Err(e) = self.check_allocation(grant.prb_start, grant.nof_prb, grant.mcs, grant.aggregation) {
                warn!("Dropping DL grant of {}: {}", grant.rnti, e);
                continue;
            }
            let tbs = grant.tbs(cfi);
            if tbs == 0 {
                warn!("Dropping DL grant of {}: empty transport block", grant.rnti);
                continue;
            }
            let Some(location) = cces.allocate(grant.rnti, grant.aggregation) else {
                warn!("No free CCE for DL grant of {} at L{}", grant.rnti, grant.aggregation);
                metrics.nof_pdcch_dropped += 1;
                continue;
            };

            let dai = if grant.rnti.is_crnti() {
                let n_pucch = pucch::n_pucch(location.cce, self.cell.n1_pucch_an);
                let ack_tti = tti.add(self.k_ack, self.modulus);
                self.common
                    .set_dl_pending_ack(sf_cfg.tti_rx, ack_tti, self.cc, grant.rnti, grant.harq_pid, n_pucch)
            } else {
                0
            };

            let dci = Dci {
                format: DciFormat::DlAssignment,
                harq_pid: grant.harq_pid,
                mcs: grant.mcs,
                ndi: grant.ndi,
                rv: grant.rv,
                prb_start: grant.prb_start,
                nof_prb: grant.nof_prb,
                tpc: 1,
                dai,
            };
            region.encode(&dci, grant.rnti, location, dl_grid)?;
            metrics.nof_pdcch += 1;

            let tb = fit_transport_block(&grant.data, tbs);
            let res = pdsch_res(grant.prb_start, grant.nof_prb, cfi, v_shift);
            let c_init = scrambling_c_init(grant.rnti.value(), tick, self.cell.pci);
            map_shared_channel(dl_grid, &res, &tb, grant.mcs, grant.rv, c_init);

            metrics.add_pdsch(grant.mcs, tbs);
            if let Some(ue) = self.ues.lock().get_mut(&grant.rnti) {
                ue.metrics.add_dl(grant.mcs);
            }
            trace!(
                "PDSCH rnti={} pid={} mcs={} prb={}+{} tbs={} dai={}",
                grant.rnti,
                grant.harq_pid,
                grant.mcs,
                grant.prb_start,
                grant.nof_prb,
                tbs,
                dai
            );
        }

        let mut signalled = Vec::with_capacity(ul_grants.len());
        for grant in ul_grants {
            if let Err(e) = self.check_allocation(grant.prb_start, grant.nof_prb, grant.mcs, grant.aggregation) {
                warn!("Dropping UL grant of {}: {}", grant.rnti, e);
                continue;
            }
            let Some(location) = cces.allocate(grant.rnti, grant.aggregation) else {
                warn!("No free CCE for UL grant of {} at L{}", grant.rnti, grant.aggregation);
                metrics.nof_pdcch_dropped += 1;
                continue;
            };

            let dci = Dci {
                format: DciFormat::UlGrant,
                harq_pid: grant.harq_pid,
                mcs: grant.mcs,
                ndi: grant.ndi,
                rv: grant.rv,
                prb_start: grant.prb_start,
                nof_prb: grant.nof_prb,
                tpc: 1,
                dai: 0,
            };
            region.encode(&dci, grant.rnti, location, dl_grid)?;
            metrics.nof_pdcch += 1;
            signalled.push(grant.clone());
        }

        modulate_ports(modulator, dl_grid, self.slot_in_subframe(tti), tx, self.cc)?;
        Ok((signalled, metrics))
    }

    /// Receive the downlink of `rnti` from `rx` as a UE would
    pub fn decode_dl(&self, rx: &[Complex32], sf_cfg: &SfConfig, rnti: Rnti) -> Result<Option<DlDecodeResult>, LayerError> {
        let tti = sf_cfg.tti;
        let tick = self.tick_in_frame(tti);
        let v_shift = self.cell.v_shift();
        let cfi = sf_cfg.cfi.clamp(1, 3);

        let mut grid = ResourceGrid::new(self.cell.nof_prb);
        self.dsp
            .lock()
            .demodulator
            .demodulate(rx, self.slot_in_subframe(tti), &mut grid)?;

        let chest = estimate_dl(&grid, tick, self.cell.pci, v_shift, &CRS_SYMBOLS);
        let region = ControlRegion::new(self.cell.nof_prb, cfi, self.cell.pci, v_shift, tick);
        let found = region.blind_search(&grid, &chest, rnti);

        let ul_dci = found
            .iter()
            .find(|(dci, _)| dci.format == DciFormat::UlGrant)
            .map(|(dci, _)| *dci);
        let Some(&(dci, location)) = found.iter().find(|(dci, _)| dci.format == DciFormat::DlAssignment) else {
            return Ok(None);
        };

        if self
            .check_allocation(dci.prb_start, dci.nof_prb, dci.mcs, location.level)
            .is_err()
        {
            return Ok(None);
        }

        let tbs = sch::dl_tbs(dci.mcs, dci.nof_prb, cfi);
        let res = pdsch_res(dci.prb_start, dci.nof_prb, cfi, v_shift);
        let mut llrs = equalize_and_demap(&grid, &chest, &res, dci.mcs);
        let c_init = scrambling_c_init(rnti.value(), tick, self.cell.pci);

        let mut ues = self.ues.lock();
        let mut scratch = Softbuffer::new();
        let softbuffer = match ues.get_mut(&rnti) {
            Some(ue) => &mut ue.dl_softbuffers[dci.harq_pid as usize % NOF_HARQ_PROCESSES],
            None => &mut scratch,
        };
        softbuffer.begin(dci.ndi, tbs, tti, DL_COMBINING_GAP, self.modulus);
        let SchDecodeResult {
            crc_ok,
            data,
            nof_combined,
        } = sch::decode(&mut llrs, dci.rv, c_init, softbuffer);

        Ok(Some(DlDecodeResult {
            dci,
            location,
            crc_ok,
            data,
            nof_combined,
            ul_dci,
        }))
    }

    /// Build the uplink of `rnti` as a UE would: PUSCH for `pusch` and a
    /// HARQ-ACK `(n_pucch, ack)` on the PUCCH, written to port 0 of `tx`
    pub fn encode_ul(
        &self,
        sf_cfg: &SfConfig,
        rnti: Rnti,
        pusch: Option<(&UlGrant, &[u8])>,
        harq_ack: Option<(usize, bool)>,
        out: &mut [Complex32],
    ) -> Result<(), LayerError> {
        let tti = sf_cfg.tti;
        let tick = self.tick_in_frame(tti);
        let mut grid = ResourceGrid::new(self.cell.nof_prb);

        if let Some((grant, data)) = pusch {
            self.check_allocation(grant.prb_start, grant.nof_prb, grant.mcs, grant.aggregation)
                .map_err(LayerError::ProcessingError)?;
            let k0 = SUBCARRIERS_PER_PRB * grant.prb_start as usize;
            let k1 = k0 + SUBCARRIERS_PER_PRB * grant.nof_prb as usize;
            for &l in PUSCH_DMRS_SYMBOLS.iter() {
                let dmrs = pusch_dmrs_values(tick, l, self.cell.pci, self.cell.nof_prb);
                for k in k0..k1 {
                    grid.set((k, l), dmrs[k]);
                }
            }

            let tb = fit_transport_block(&Bytes::copy_from_slice(data), grant.tbs());
            let res = pusch_res(grant.prb_start, grant.nof_prb);
            let c_init = scrambling_c_init(rnti.value(), tick, self.cell.pci);
            map_shared_channel(&mut grid, &res, &tb, grant.mcs, grant.rv, c_init);
        }

        if let Some((n_pucch, ack)) = harq_ack {
            let k = pucch_subcarrier(n_pucch, self.cell.nof_prb, self.cell.nof_pucch_prb);
            pucch::encode(&mut grid, k, n_pucch, tick, self.cell.pci, ack);
        }

        self.dsp
            .lock()
            .modulator
            .modulate(&grid, self.slot_in_subframe(tti), out)
    }
}

/// Pad with zeros or cut `data` to exactly `tbs` bytes
fn fit_transport_block(data: &Bytes, tbs: usize) -> Bytes {
    if data.len() == tbs {
        return data.clone();
    }
    let mut tb = BytesMut::zeroed(tbs);
    let n = data.len().min(tbs);
    tb[..n].copy_from_slice(&data[..n]);
    tb.freeze()
}

/// Encode a transport block and map it onto `res`
fn map_shared_channel(grid: &mut ResourceGrid, res: &[Re], tb: &[u8], mcs: u8, rv: u8, c_init: u32) {
    let Some(modulation) = ModulationScheme::from_mcs(mcs) else {
        return;
    };
    let nof_bits = res.len() * modulation.bits_per_symbol();
    let bits = sch::encode(tb, rv, nof_bits, c_init);
    for (&re, symbol) in res.iter().zip(modulate(&bits, modulation)) {
        grid.set(re, symbol);
    }
}

/// Equalise `res` and produce their LLRs
fn equalize_and_demap(grid: &ResourceGrid, chest: &ChannelEstimate, res: &[Re], mcs: u8) -> Vec<f32> {
    let Some(modulation) = ModulationScheme::from_mcs(mcs) else {
        return Vec::new();
    };
    let (symbols, noise): (Vec<Complex32>, Vec<f32>) = res
        .iter()
        .map(|&(k, l)| chest.equalize(k, grid.get((k, l))))
        .unzip();
    demodulate_soft(&symbols, &noise, modulation)
}

/// Modulate the grid on port 0 and copy it to the other ports of carrier `cc`
fn modulate_ports(
    modulator: &mut OfdmModulator,
    grid: &ResourceGrid,
    slot_in_subframe: u32,
    tx: &mut RfBufferSet,
    cc: usize,
) -> Result<(), LayerError> {
    modulator.modulate(grid, slot_in_subframe, tx.get_mut(cc, 0))?;
    if tx.nof_ports() > 1 {
        let port0 = tx.get(cc, 0).to_vec();
        for port in 1..tx.nof_ports() {
            tx.get_mut(cc, port).copy_from_slice(&port0);
        }
    }
    Ok(())
}
