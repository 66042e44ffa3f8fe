//! Medium Access Control (MAC) Layer
//!
//! The stack side of the PHY boundary: the interface the PHY pipeline calls
//! every tick (`StackInterfacePhy`), the control interface the PHY exposes
//! (`PhyInterfaceStack`), and a round-robin MAC implementing the former.

pub mod sched;
pub mod scheduler;

pub use sched::{DlGrant, DlSchedResult, UlGrant, UlSchedResult};
pub use scheduler::{MacConfig, MacLayer, MacMetrics, RachEvent};

use crate::phy::metrics::PhyMetrics;
use crate::LayerError;
use bytes::Bytes;
use common::{Rnti, Tti};

/// Stack services consumed by the PHY workers.
///
/// Called synchronously from the Tx/Rx thread (`tti_clock`), the pool
/// workers (scheduling and decode reports) and the PRACH workers
/// (`rach_detected`), so implementations must be cheap and thread safe.
pub trait StackInterfacePhy: Send + Sync {
    /// A new tick started
    fn tti_clock(&self);

    /// Downlink scheduling for `tti`, one entry per carrier in `results`
    fn get_dl_sched(&self, tti: Tti, results: &mut [DlSchedResult]);

    /// Uplink grants to signal at `tti`, one entry per carrier in `results`
    fn get_ul_sched(&self, tti: Tti, results: &mut [UlSchedResult]);

    /// CRC outcome of a PUSCH transport block
    fn crc_info(&self, tti: Tti, rnti: Rnti, cc: usize, harq_pid: u8, crc_ok: bool, nof_bytes: usize);

    /// Transport block decoded with a valid CRC
    fn push_pdu(&self, tti: Tti, rnti: Rnti, cc: usize, data: Bytes);

    /// HARQ-ACK feedback of a downlink transport block (DTX reported as NACK)
    fn ack_info(&self, tti: Tti, rnti: Rnti, cc: usize, harq_pid: u8, ack: bool);

    /// Uplink SINR measurement
    fn snr_info(&self, tti: Tti, rnti: Rnti, cc: usize, snr_db: f32);

    /// Random access preamble detected; `ta` in units of 16 Ts
    fn rach_detected(&self, tti: Tti, cc: usize, preamble: u8, ta: u32);
}

/// PHY control services used by the stack
pub trait PhyInterfaceStack: Send + Sync {
    /// Create the UE context of `rnti` in every worker and carrier
    fn add_rnti(&self, rnti: Rnti) -> Result<(), LayerError>;

    /// Drop the UE context of `rnti` everywhere
    fn rem_rnti(&self, rnti: Rnti) -> Result<(), LayerError>;

    /// Number of attached RNTIs
    fn get_nof_rnti(&self) -> usize;

    /// Snapshot of carrier, UE and radio measurements
    fn get_metrics(&self) -> PhyMetrics;

    /// Clear pending grants, ACKs and measurements
    fn reset(&self);
}
