//! MAC Scheduler Implementation
//!
//! Round-robin scheduling of attached UEs over every carrier, with per-UE
//! downlink queues, uplink buffer status and HARQ retransmission. Random
//! access preambles reported by the PHY get a temporary C-RNTI and a random
//! access response; the events are queued for the control task that attaches
//! the UE.

use super::sched::{DlGrant, DlSchedResult, UlGrant, UlSchedResult};
use super::StackInterfacePhy;
use crate::phy::config::NOF_HARQ_PROCESSES;
use crate::phy::sch::{dl_tbs, ul_tbs};
use crate::LayerError;
use bytes::{BufMut, Bytes, BytesMut};
use common::{Rnti, Tti};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, trace, warn};

/// Redundancy versions in transmission order
const RV_SEQUENCE: [u8; 4] = [0, 2, 3, 1];
/// Ticks after which a DL process still waiting for feedback is released
const ACK_TIMEOUT: u32 = 16;
/// Decoded UL PDUs kept for `take_ul_pdus`
const UL_PDU_BACKLOG: usize = 256;

/// MAC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    /// Carriers scheduled
    pub nof_carriers: usize,
    /// PRB per carrier
    pub nof_prb: u16,
    /// PRB reserved for PUCCH at each band edge
    pub nof_pucch_prb: u16,
    /// Downlink MCS of UE data
    pub dl_mcs: u8,
    /// Uplink MCS of UE data
    pub ul_mcs: u8,
    /// Upper bound of PRB given to one UE per tick
    pub max_prb_per_ue: u16,
    /// PDCCH aggregation level of UE grants
    pub aggregation: u8,
    /// Transmissions of a transport block before it is dropped
    pub max_harq_tx: u8,
    /// Grant to PUSCH delay, selects the synchronous UL HARQ process
    pub k_pusch: u32,
    /// Maximum attached UEs
    pub max_ues: usize,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            nof_carriers: 1,
            nof_prb: 25,
            nof_pucch_prb: 2,
            dl_mcs: 16,
            ul_mcs: 10,
            max_prb_per_ue: 12,
            aggregation: 2,
            max_harq_tx: 4,
            k_pusch: 4,
            max_ues: 32,
        }
    }
}

/// Preamble detection turned into a random access attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RachEvent {
    pub tti: Tti,
    pub cc: usize,
    pub preamble: u8,
    pub ta: u32,
    /// Temporary C-RNTI handed out in the response
    pub temp_crnti: Rnti,
}

/// MAC counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MacMetrics {
    pub nof_tti: u64,
    pub nof_ues: usize,
    pub dl_tx: u64,
    pub dl_retx: u64,
    pub dl_ack: u64,
    pub dl_nack: u64,
    pub dl_dropped: u64,
    pub dl_tx_bytes: u64,
    pub ul_grants: u64,
    pub ul_crc_ok: u64,
    pub ul_crc_ko: u64,
    pub ul_dropped: u64,
    pub ul_rx_bytes: u64,
    pub nof_rach: u64,
    pub nof_rar: u64,
}

#[derive(Debug, Clone, Default)]
struct HarqProcess {
    /// Transport block of a DL process
    data: Option<Bytes>,
    ndi: bool,
    nof_tx: u8,
    mcs: u8,
    nof_prb: u16,
    /// Transmitted, feedback pending
    awaiting: bool,
    needs_retx: bool,
    last_tx: Tti,
}

impl HarqProcess {
    fn is_free(&self) -> bool {
        !self.awaiting && !self.needs_retx
    }

    fn start(&mut self, mcs: u8, nof_prb: u16, tti: Tti) {
        self.ndi = !self.ndi;
        self.nof_tx = 1;
        self.mcs = mcs;
        self.nof_prb = nof_prb;
        self.awaiting = true;
        self.needs_retx = false;
        self.last_tx = tti;
    }

    fn retransmit(&mut self, tti: Tti) -> u8 {
        let rv = RV_SEQUENCE[self.nof_tx as usize % RV_SEQUENCE.len()];
        self.nof_tx += 1;
        self.awaiting = true;
        self.needs_retx = false;
        self.last_tx = tti;
        rv
    }

    /// Apply feedback; returns true when the block was dropped
    fn feedback(&mut self, ok: bool, max_tx: u8) -> bool {
        self.awaiting = false;
        if ok {
            self.data = None;
            return false;
        }
        if self.nof_tx >= max_tx {
            self.data = None;
            return true;
        }
        self.needs_retx = true;
        false
    }
}

#[derive(Debug)]
struct UeState {
    dl_queue: VecDeque<Bytes>,
    ul_buffer: usize,
    dl_harq: Vec<Vec<HarqProcess>>,
    ul_harq: Vec<Vec<HarqProcess>>,
    ul_snr_db: f32,
}

impl UeState {
    fn new(nof_carriers: usize) -> Self {
        let processes = || vec![HarqProcess::default(); NOF_HARQ_PROCESSES];
        Self {
            dl_queue: VecDeque::new(),
            ul_buffer: 0,
            dl_harq: (0..nof_carriers).map(|_| processes()).collect(),
            ul_harq: (0..nof_carriers).map(|_| processes()).collect(),
            ul_snr_db: 0.0,
        }
    }
}

struct MacState {
    ues: BTreeMap<Rnti, UeState>,
    dl_rr: usize,
    ul_rr: usize,
    pending_rar: VecDeque<RachEvent>,
    rach_events: VecDeque<RachEvent>,
    ul_pdus: VecDeque<(Rnti, Bytes)>,
    next_crnti: u16,
    metrics: MacMetrics,
}

/// Round-robin MAC driving the PHY
pub struct MacLayer {
    config: MacConfig,
    state: Mutex<MacState>,
}

impl MacLayer {
    pub fn new(config: MacConfig) -> Result<Self, LayerError> {
        if config.nof_carriers == 0 || config.nof_prb <= 2 * config.nof_pucch_prb {
            return Err(LayerError::InvalidConfiguration(format!(
                "MAC: {} carriers of {} PRB with {} PUCCH PRB per edge",
                config.nof_carriers, config.nof_prb, config.nof_pucch_prb
            )));
        }
        if config.dl_mcs > 28 || config.ul_mcs > 28 || config.max_harq_tx == 0 || config.max_prb_per_ue == 0 {
            return Err(LayerError::InvalidConfiguration(
                "MAC: MCS above 28, zero HARQ transmissions or zero PRB per UE".to_string(),
            ));
        }
        info!(
            "MAC: {} carriers x {} PRB, DL MCS {}, UL MCS {}",
            config.nof_carriers, config.nof_prb, config.dl_mcs, config.ul_mcs
        );

        Ok(Self {
            config,
            state: Mutex::new(MacState {
                ues: BTreeMap::new(),
                dl_rr: 0,
                ul_rr: 0,
                pending_rar: VecDeque::new(),
                rach_events: VecDeque::new(),
                ul_pdus: VecDeque::new(),
                next_crnti: Rnti::CRNTI_START,
                metrics: MacMetrics::default(),
            }),
        })
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    /// Attach `rnti` to the scheduler
    pub fn add_ue(&self, rnti: Rnti) -> Result<(), LayerError> {
        let mut state = self.state.lock();
        if state.ues.contains_key(&rnti) {
            return Err(LayerError::DuplicateRnti(rnti));
        }
        if state.ues.len() >= self.config.max_ues {
            return Err(LayerError::ResourceUnavailable);
        }
        state.ues.insert(rnti, UeState::new(self.config.nof_carriers));
        debug!("MAC: UE {} attached", rnti);
        Ok(())
    }

    /// Detach `rnti`, dropping its queues and HARQ state
    pub fn rem_ue(&self, rnti: Rnti) -> Result<(), LayerError> {
        self.state
            .lock()
            .ues
            .remove(&rnti)
            .map(|_| debug!("MAC: UE {} detached", rnti))
            .ok_or(LayerError::UnknownRnti(rnti))
    }

    pub fn nof_ues(&self) -> usize {
        self.state.lock().ues.len()
    }

    /// Queue downlink data for `rnti`
    pub fn push_dl_data(&self, rnti: Rnti, data: Bytes) -> Result<(), LayerError> {
        let mut state = self.state.lock();
        let ue = state.ues.get_mut(&rnti).ok_or(LayerError::UnknownRnti(rnti))?;
        ue.dl_queue.push_back(data);
        Ok(())
    }

    /// Set the uplink bytes `rnti` has waiting
    pub fn set_ul_buffer(&self, rnti: Rnti, nof_bytes: usize) -> Result<(), LayerError> {
        let mut state = self.state.lock();
        let ue = state.ues.get_mut(&rnti).ok_or(LayerError::UnknownRnti(rnti))?;
        ue.ul_buffer = nof_bytes;
        Ok(())
    }

    /// Latest UL SINR reported for `rnti`
    pub fn ul_snr_db(&self, rnti: Rnti) -> Option<f32> {
        self.state.lock().ues.get(&rnti).map(|ue| ue.ul_snr_db)
    }

    /// Next random access attempt waiting for attachment
    pub fn pop_rach(&self) -> Option<RachEvent> {
        self.state.lock().rach_events.pop_front()
    }

    /// Drain the decoded uplink PDUs
    pub fn take_ul_pdus(&self) -> Vec<(Rnti, Bytes)> {
        self.state.lock().ul_pdus.drain(..).collect()
    }

    pub fn metrics(&self) -> MacMetrics {
        let state = self.state.lock();
        MacMetrics {
            nof_ues: state.ues.len(),
            ..state.metrics.clone()
        }
    }

    fn allocate_crnti(state: &mut MacState) -> Rnti {
        loop {
            let rnti = Rnti::new(state.next_crnti);
            state.next_crnti = if state.next_crnti >= Rnti::CRNTI_END {
                Rnti::CRNTI_START
            } else {
                state.next_crnti + 1
            };
            if !state.ues.contains_key(&rnti) {
                return rnti;
            }
        }
    }

    /// Smallest allocation carrying `nof_bytes`, capped at `max_prb`
    fn dl_prb_for(nof_bytes: usize, mcs: u8, cfi: u8, max_prb: u16) -> u16 {
        (1..=max_prb)
            .find(|&n| dl_tbs(mcs, n, cfi) >= nof_bytes)
            .unwrap_or(max_prb)
    }

    fn schedule_rar(&self, state: &mut MacState, tti: Tti, result: &mut DlSchedResult, prb: &mut u16) {
        while let Some(event) = state.pending_rar.pop_front() {
            let mut payload = BytesMut::with_capacity(6);
            payload.put_u8(event.preamble);
            payload.put_u16(event.ta as u16);
            payload.put_u16(event.temp_crnti.value());
            payload.put_u8(0);
            let payload = payload.freeze();

            let nof_prb = Self::dl_prb_for(payload.len(), 0, result.cfi, 4);
            if *prb + nof_prb > self.config.nof_prb {
                state.pending_rar.push_front(event);
                break;
            }
            let t_id = (event.tti.0 % 10) as u8;
            result.grants.push(DlGrant {
                rnti: Rnti::ra_rnti(t_id),
                harq_pid: 0,
                mcs: 0,
                ndi: true,
                rv: 0,
                prb_start: *prb,
                nof_prb,
                aggregation: 4,
                data: payload,
            });
            *prb += nof_prb;
            state.metrics.nof_rar += 1;
            trace!("RAR for preamble {} at {} -> {}", event.preamble, tti, event.temp_crnti);
        }
    }
}

impl StackInterfacePhy for MacLayer {
    fn tti_clock(&self) {
        self.state.lock().metrics.nof_tti += 1;
    }

    fn get_dl_sched(&self, tti: Tti, results: &mut [DlSchedResult]) {
        let mut state = self.state.lock();
        let state = &mut *state;

        for (cc, result) in results.iter_mut().enumerate().take(self.config.nof_carriers) {
            let mut prb = 0u16;
            if cc == 0 {
                self.schedule_rar(state, tti, result, &mut prb);
            }

            // retransmissions first, then new data in round-robin order
            for (&rnti, ue) in state.ues.iter_mut() {
                for (pid, harq) in ue.dl_harq[cc].iter_mut().enumerate() {
                    if harq.awaiting && tti.distance_from(harq.last_tx, 10240) > ACK_TIMEOUT {
                        warn!("MAC: no HARQ feedback for {} pid {}, dropping", rnti, pid);
                        harq.awaiting = false;
                        harq.data = None;
                        state.metrics.dl_dropped += 1;
                    }
                    if !harq.needs_retx || prb + harq.nof_prb > self.config.nof_prb {
                        continue;
                    }
                    let Some(data) = harq.data.clone() else {
                        harq.needs_retx = false;
                        continue;
                    };
                    let rv = harq.retransmit(tti);
                    result.grants.push(DlGrant {
                        rnti,
                        harq_pid: pid as u8,
                        mcs: harq.mcs,
                        ndi: harq.ndi,
                        rv,
                        prb_start: prb,
                        nof_prb: harq.nof_prb,
                        aggregation: self.config.aggregation,
                        data,
                    });
                    prb += harq.nof_prb;
                    state.metrics.dl_retx += 1;
                }
            }

            let rntis: Vec<Rnti> = state.ues.keys().copied().collect();
            if rntis.is_empty() {
                continue;
            }
            let start = state.dl_rr % rntis.len();
            for &rnti in rntis.iter().cycle().skip(start).take(rntis.len()) {
                if prb >= self.config.nof_prb {
                    break;
                }
                let Some(ue) = state.ues.get_mut(&rnti) else {
                    continue;
                };
                let Some(front) = ue.dl_queue.front_mut() else {
                    continue;
                };
                let Some(pid) = ue.dl_harq[cc].iter().position(HarqProcess::is_free) else {
                    continue;
                };

                let max_prb = self.config.max_prb_per_ue.min(self.config.nof_prb - prb);
                let nof_prb = Self::dl_prb_for(front.len(), self.config.dl_mcs, result.cfi, max_prb);
                let tbs = dl_tbs(self.config.dl_mcs, nof_prb, result.cfi);
                if tbs == 0 {
                    continue;
                }
                let data = if front.len() > tbs {
                    front.split_to(tbs)
                } else {
                    ue.dl_queue.pop_front().unwrap_or_default()
                };

                let harq = &mut ue.dl_harq[cc][pid];
                harq.start(self.config.dl_mcs, nof_prb, tti);
                harq.data = Some(data.clone());
                state.metrics.dl_tx += 1;
                state.metrics.dl_tx_bytes += data.len() as u64;

                result.grants.push(DlGrant {
                    rnti,
                    harq_pid: pid as u8,
                    mcs: self.config.dl_mcs,
                    ndi: harq.ndi,
                    rv: 0,
                    prb_start: prb,
                    nof_prb,
                    aggregation: self.config.aggregation,
                    data,
                });
                prb += nof_prb;
            }
            state.dl_rr = state.dl_rr.wrapping_add(1);
        }
    }

    fn get_ul_sched(&self, tti: Tti, results: &mut [UlSchedResult]) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let pid = (tti.0 + self.config.k_pusch) as usize % NOF_HARQ_PROCESSES;
        let first_prb = self.config.nof_pucch_prb;
        let last_prb = self.config.nof_prb - self.config.nof_pucch_prb;

        for (cc, result) in results.iter_mut().enumerate().take(self.config.nof_carriers) {
            let mut prb = first_prb;
            let rntis: Vec<Rnti> = state.ues.keys().copied().collect();
            if rntis.is_empty() {
                continue;
            }
            let start = state.ul_rr % rntis.len();
            for &rnti in rntis.iter().cycle().skip(start).take(rntis.len()) {
                let Some(ue) = state.ues.get_mut(&rnti) else {
                    continue;
                };
                let harq = &mut ue.ul_harq[cc][pid];
                if harq.awaiting && tti.distance_from(harq.last_tx, 10240) > ACK_TIMEOUT {
                    warn!("MAC: no CRC for {} UL pid {}, dropping", rnti, pid);
                    harq.awaiting = false;
                    state.metrics.ul_dropped += 1;
                }

                if harq.needs_retx {
                    if prb + harq.nof_prb > last_prb {
                        continue;
                    }
                    let rv = harq.retransmit(tti);
                    result.grants.push(UlGrant {
                        rnti,
                        harq_pid: pid as u8,
                        mcs: harq.mcs,
                        ndi: harq.ndi,
                        rv,
                        prb_start: prb,
                        nof_prb: harq.nof_prb,
                        aggregation: self.config.aggregation,
                    });
                    prb += harq.nof_prb;
                    state.metrics.ul_grants += 1;
                    continue;
                }

                if ue.ul_buffer == 0 || harq.awaiting || prb >= last_prb {
                    continue;
                }
                let max_prb = self.config.max_prb_per_ue.min(last_prb - prb);
                let nof_prb = (1..=max_prb)
                    .find(|&n| ul_tbs(self.config.ul_mcs, n) >= ue.ul_buffer)
                    .unwrap_or(max_prb);
                harq.start(self.config.ul_mcs, nof_prb, tti);
                result.grants.push(UlGrant {
                    rnti,
                    harq_pid: pid as u8,
                    mcs: self.config.ul_mcs,
                    ndi: harq.ndi,
                    rv: 0,
                    prb_start: prb,
                    nof_prb,
                    aggregation: self.config.aggregation,
                });
                prb += nof_prb;
                state.metrics.ul_grants += 1;
            }
            state.ul_rr = state.ul_rr.wrapping_add(1);
        }
    }

    fn crc_info(&self, tti: Tti, rnti: Rnti, cc: usize, harq_pid: u8, crc_ok: bool, nof_bytes: usize) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(ue) = state.ues.get_mut(&rnti) else {
            return;
        };
        let Some(harq) = ue.ul_harq.get_mut(cc).and_then(|h| h.get_mut(harq_pid as usize)) else {
            return;
        };
        if harq.feedback(crc_ok, self.config.max_harq_tx) {
            debug!("MAC: UL block of {} pid {} dropped at {}", rnti, harq_pid, tti);
            state.metrics.ul_dropped += 1;
        }
        if crc_ok {
            ue.ul_buffer = ue.ul_buffer.saturating_sub(nof_bytes);
            state.metrics.ul_crc_ok += 1;
        } else {
            state.metrics.ul_crc_ko += 1;
        }
    }

    fn push_pdu(&self, _tti: Tti, rnti: Rnti, _cc: usize, data: Bytes) {
        let mut state = self.state.lock();
        state.metrics.ul_rx_bytes += data.len() as u64;
        if state.ul_pdus.len() >= UL_PDU_BACKLOG {
            state.ul_pdus.pop_front();
        }
        state.ul_pdus.push_back((rnti, data));
    }

    fn ack_info(&self, tti: Tti, rnti: Rnti, cc: usize, harq_pid: u8, ack: bool) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(harq) = state
            .ues
            .get_mut(&rnti)
            .and_then(|ue| ue.dl_harq.get_mut(cc))
            .and_then(|h| h.get_mut(harq_pid as usize))
        else {
            return;
        };
        if !harq.awaiting {
            trace!("MAC: unexpected HARQ-ACK from {} pid {} at {}", rnti, harq_pid, tti);
            return;
        }
        if harq.feedback(ack, self.config.max_harq_tx) {
            debug!("MAC: DL block of {} pid {} dropped after {} transmissions", rnti, harq_pid, harq.nof_tx);
            state.metrics.dl_dropped += 1;
        }
        if ack {
            state.metrics.dl_ack += 1;
        } else {
            state.metrics.dl_nack += 1;
        }
    }

    fn snr_info(&self, _tti: Tti, rnti: Rnti, _cc: usize, snr_db: f32) {
        if let Some(ue) = self.state.lock().ues.get_mut(&rnti) {
            ue.ul_snr_db = snr_db;
        }
    }

    fn rach_detected(&self, tti: Tti, cc: usize, preamble: u8, ta: u32) {
        let mut state = self.state.lock();
        let temp_crnti = Self::allocate_crnti(&mut state);
        let event = RachEvent {
            tti,
            cc,
            preamble,
            ta,
            temp_crnti,
        };
        info!("RACH: tti={} cc={} preamble={} ta={} temp_crnti={}", tti, cc, preamble, ta, temp_crnti);
        state.pending_rar.push_back(event);
        state.rach_events.push_back(event);
        state.metrics.nof_rach += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacLayer {
        MacLayer::new(MacConfig::default()).unwrap()
    }

    fn dl(mac: &MacLayer, tti: u32) -> DlSchedResult {
        let mut results = vec![DlSchedResult::default()];
        mac.get_dl_sched(Tti(tti), &mut results);
        results.remove(0)
    }

    fn ul(mac: &MacLayer, tti: u32) -> UlSchedResult {
        let mut results = vec![UlSchedResult::default()];
        mac.get_ul_sched(Tti(tti), &mut results);
        results.remove(0)
    }

    #[test]
    fn test_invalid_config() {
        let config = MacConfig {
            nof_prb: 4,
            ..MacConfig::default()
        };
        assert!(MacLayer::new(config).is_err());
    }

    #[test]
    fn test_ue_attach_detach() {
        let mac = mac();
        let rnti = Rnti::new(0x46);
        mac.add_ue(rnti).unwrap();
        assert!(matches!(mac.add_ue(rnti), Err(LayerError::DuplicateRnti(_))));
        mac.rem_ue(rnti).unwrap();
        assert!(mac.rem_ue(rnti).is_err());
        assert!(mac.push_dl_data(rnti, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_round_robin_dl() {
        let mac = mac();
        for rnti in [0x46u16, 0x47] {
            mac.add_ue(Rnti::new(rnti)).unwrap();
            mac.push_dl_data(Rnti::new(rnti), Bytes::from(vec![rnti as u8; 40])).unwrap();
        }
        let result = dl(&mac, 0);
        assert_eq!(result.grants.len(), 2);
        let first = &result.grants[0];
        let second = &result.grants[1];
        assert_eq!(second.prb_start, first.prb_start + first.nof_prb);
        assert!(first.tbs(result.cfi) >= 40);
        assert!(second.prb_start + second.nof_prb <= 25);
    }

    #[test]
    fn test_dl_harq_retransmission_and_drop() {
        let mac = mac();
        let rnti = Rnti::new(0x50);
        mac.add_ue(rnti).unwrap();
        mac.push_dl_data(rnti, Bytes::from_static(b"payload")).unwrap();

        let first = dl(&mac, 0).grants.remove(0);
        assert_eq!(first.rv, 0);

        let mut rvs = Vec::new();
        for k in 1..4u32 {
            mac.ack_info(Tti(k * 8), rnti, 0, first.harq_pid, false);
            let retx = dl(&mac, k * 8).grants.remove(0);
            assert_eq!(retx.ndi, first.ndi);
            assert_eq!(retx.data, first.data);
            rvs.push(retx.rv);
        }
        assert_eq!(rvs, vec![2, 3, 1]);

        mac.ack_info(Tti(32), rnti, 0, first.harq_pid, false);
        assert!(dl(&mac, 33).grants.is_empty());
        let metrics = mac.metrics();
        assert_eq!(metrics.dl_dropped, 1);
        assert_eq!(metrics.dl_retx, 3);
        assert_eq!(metrics.dl_nack, 4);
    }

    #[test]
    fn test_dl_ack_toggles_ndi() {
        let mac = mac();
        let rnti = Rnti::new(0x51);
        mac.add_ue(rnti).unwrap();
        mac.push_dl_data(rnti, Bytes::from_static(b"one")).unwrap();
        let first = dl(&mac, 0).grants.remove(0);
        mac.ack_info(Tti(8), rnti, 0, first.harq_pid, true);

        mac.push_dl_data(rnti, Bytes::from_static(b"two")).unwrap();
        let second = dl(&mac, 9).grants.remove(0);
        assert_eq!(second.harq_pid, first.harq_pid);
        assert_ne!(second.ndi, first.ndi);
    }

    #[test]
    fn test_large_sdu_is_segmented() {
        let mac = mac();
        let rnti = Rnti::new(0x52);
        mac.add_ue(rnti).unwrap();
        mac.push_dl_data(rnti, Bytes::from(vec![7u8; 5000])).unwrap();
        let grant = dl(&mac, 0).grants.remove(0);
        assert_eq!(grant.nof_prb, 12);
        assert_eq!(grant.data.len(), grant.tbs(2));
        // remainder goes out on the next free process
        assert_eq!(dl(&mac, 1).grants.len(), 1);
    }

    #[test]
    fn test_ul_synchronous_harq() {
        let mac = mac();
        let rnti = Rnti::new(0x60);
        mac.add_ue(rnti).unwrap();
        mac.set_ul_buffer(rnti, 100).unwrap();

        let grant = ul(&mac, 4).grants.remove(0);
        assert_eq!(grant.harq_pid, 0);
        assert!(grant.prb_start >= 2);
        assert!(grant.tbs() >= 100);

        mac.crc_info(Tti(8), rnti, 0, 0, false, grant.tbs());
        let retx = ul(&mac, 12).grants.remove(0);
        assert_eq!(retx.rv, 2);
        assert_eq!(retx.nof_prb, grant.nof_prb);

        mac.crc_info(Tti(16), rnti, 0, 0, true, retx.tbs());
        assert!(ul(&mac, 20).grants.is_empty());
        assert_eq!(mac.metrics().ul_crc_ok, 1);
    }

    #[test]
    fn test_ul_process_released_without_crc() {
        let mac = mac();
        let rnti = Rnti::new(0x61);
        mac.add_ue(rnti).unwrap();
        mac.set_ul_buffer(rnti, 100).unwrap();

        // the PUSCH of this grant is never decoded
        let grant = ul(&mac, 4).grants.remove(0);
        assert_eq!(grant.harq_pid, 0);
        assert!(ul(&mac, 12).grants.is_empty());
        assert!(ul(&mac, 20).grants.is_empty());

        let next = ul(&mac, 28).grants.remove(0);
        assert_eq!(next.harq_pid, 0);
        assert_eq!(next.rv, 0);
        assert_ne!(next.ndi, grant.ndi);
        assert_eq!(mac.metrics().ul_dropped, 1);

        mac.crc_info(Tti(32), rnti, 0, 0, true, next.tbs());
        assert_eq!(mac.metrics().ul_crc_ok, 1);
    }

    #[test]
    fn test_rach_allocates_crnti_and_rar() {
        let mac = mac();
        mac.rach_detected(Tti(21), 0, 9, 3);
        let event = mac.pop_rach().unwrap();
        assert!(event.temp_crnti.is_crnti());
        assert_eq!(event.preamble, 9);
        assert!(mac.pop_rach().is_none());

        let result = dl(&mac, 24);
        assert_eq!(result.grants.len(), 1);
        let rar = &result.grants[0];
        assert_eq!(rar.rnti, Rnti::ra_rnti(1));
        assert_eq!(rar.aggregation, 4);
        assert_eq!(rar.data[0], 9);
        assert_eq!(u16::from_be_bytes([rar.data[3], rar.data[4]]), event.temp_crnti.value());
    }

    #[test]
    fn test_ul_pdus_are_collected() {
        let mac = mac();
        mac.push_pdu(Tti(0), Rnti::new(0x46), 0, Bytes::from_static(b"abc"));
        assert_eq!(mac.take_ul_pdus(), vec![(Rnti::new(0x46), Bytes::from_static(b"abc"))]);
        assert_eq!(mac.metrics().ul_rx_bytes, 3);
    }
}
