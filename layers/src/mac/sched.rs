//! Scheduling Decisions Exchanged with the PHY
//!
//! Grants produced by the stack for one tick and one carrier. The PHY encodes
//! the DCIs and shared channels they describe and reports the outcome back
//! through `StackInterfacePhy`.

use crate::phy::sch::{dl_tbs, ul_tbs};
use bytes::Bytes;
use common::Rnti;

/// Downlink assignment with its transport block
#[derive(Debug, Clone, PartialEq)]
pub struct DlGrant {
    pub rnti: Rnti,
    pub harq_pid: u8,
    pub mcs: u8,
    pub ndi: bool,
    pub rv: u8,
    pub prb_start: u16,
    pub nof_prb: u16,
    /// PDCCH aggregation level (1, 2, 4 or 8)
    pub aggregation: u8,
    /// Transport block, padded or cut to the TBS by the PHY
    pub data: Bytes,
}

impl DlGrant {
    /// Transport block size in bytes for a control region of `cfi` symbols
    pub fn tbs(&self, cfi: u8) -> usize {
        dl_tbs(self.mcs, self.nof_prb, cfi)
    }
}

/// Uplink grant, signalled at the DL tick and received `k_pusch` ticks later
#[derive(Debug, Clone, PartialEq)]
pub struct UlGrant {
    pub rnti: Rnti,
    pub harq_pid: u8,
    pub mcs: u8,
    pub ndi: bool,
    pub rv: u8,
    pub prb_start: u16,
    pub nof_prb: u16,
    pub aggregation: u8,
}

impl UlGrant {
    /// Transport block size in bytes
    pub fn tbs(&self) -> usize {
        ul_tbs(self.mcs, self.nof_prb)
    }
}

/// Downlink scheduling of one carrier for one tick
#[derive(Debug, Clone, PartialEq)]
pub struct DlSchedResult {
    /// Control region size in symbols (1..=3)
    pub cfi: u8,
    pub grants: Vec<DlGrant>,
}

impl Default for DlSchedResult {
    fn default() -> Self {
        Self {
            cfi: 2,
            grants: Vec::new(),
        }
    }
}

/// Uplink scheduling of one carrier for one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UlSchedResult {
    pub grants: Vec<UlGrant>,
}
