//! PHY Metrics
//!
//! Accumulators filled by the carrier workers and snapshots handed to the stack.
//! Averages are running means weighted by `n_samples`, so two accumulators can be
//! merged without keeping the individual samples.

use common::Rnti;
use serde::Serialize;

/// Fold `value` into a running mean that already holds `n - 1` samples
fn update_mean(mean: &mut f32, n: u64, value: f32) {
    if n > 0 {
        *mean += (value - *mean) / n as f32;
    }
}

/// Weighted merge of two running means
fn merge_mean(mean: &mut f32, n: u64, other_mean: f32, other_n: u64) {
    let total = n + other_n;
    if total > 0 {
        *mean = (*mean * n as f32 + other_mean * other_n as f32) / total as f32;
    }
}

/// Downlink processing of one carrier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DlMetrics {
    /// PDSCH transmissions
    pub n_samples: u64,
    pub mcs: f32,
    pub nof_tx_bytes: u64,
    /// DCIs encoded (DL and UL)
    pub nof_pdcch: u64,
    /// Grants dropped for lack of CCEs
    pub nof_pdcch_dropped: u64,
}

impl DlMetrics {
    pub fn add_pdsch(&mut self, mcs: u8, nof_bytes: usize) {
        self.n_samples += 1;
        update_mean(&mut self.mcs, self.n_samples, mcs as f32);
        self.nof_tx_bytes += nof_bytes as u64;
    }

    pub fn merge(&mut self, other: &DlMetrics) {
        merge_mean(&mut self.mcs, self.n_samples, other.mcs, other.n_samples);
        self.n_samples += other.n_samples;
        self.nof_tx_bytes += other.nof_tx_bytes;
        self.nof_pdcch += other.nof_pdcch;
        self.nof_pdcch_dropped += other.nof_pdcch_dropped;
    }
}

/// Uplink processing of one carrier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UlMetrics {
    /// PUSCH receptions
    pub n_samples: u64,
    pub mcs: f32,
    pub sinr_db: f32,
    pub nof_crc_ok: u64,
    pub nof_crc_ko: u64,
    pub nof_rx_bytes: u64,
    pub nof_ack: u64,
    pub nof_nack: u64,
    pub nof_dtx: u64,
}

impl UlMetrics {
    pub fn add_pusch(&mut self, mcs: u8, sinr_db: f32, crc_ok: bool, nof_bytes: usize) {
        self.n_samples += 1;
        update_mean(&mut self.mcs, self.n_samples, mcs as f32);
        update_mean(&mut self.sinr_db, self.n_samples, sinr_db);
        if crc_ok {
            self.nof_crc_ok += 1;
            self.nof_rx_bytes += nof_bytes as u64;
        } else {
            self.nof_crc_ko += 1;
        }
    }

    pub fn add_ack(&mut self, ack: Option<bool>) {
        match ack {
            Some(true) => self.nof_ack += 1,
            Some(false) => self.nof_nack += 1,
            None => self.nof_dtx += 1,
        }
    }

    /// Fraction of PUSCH receptions that failed the CRC
    pub fn bler(&self) -> f32 {
        let total = self.nof_crc_ok + self.nof_crc_ko;
        if total == 0 {
            0.0
        } else {
            self.nof_crc_ko as f32 / total as f32
        }
    }

    pub fn merge(&mut self, other: &UlMetrics) {
        merge_mean(&mut self.mcs, self.n_samples, other.mcs, other.n_samples);
        merge_mean(&mut self.sinr_db, self.n_samples, other.sinr_db, other.n_samples);
        self.n_samples += other.n_samples;
        self.nof_crc_ok += other.nof_crc_ok;
        self.nof_crc_ko += other.nof_crc_ko;
        self.nof_rx_bytes += other.nof_rx_bytes;
        self.nof_ack += other.nof_ack;
        self.nof_nack += other.nof_nack;
        self.nof_dtx += other.nof_dtx;
    }
}

/// Per-tick channel measurements of one carrier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelMetrics {
    /// Ticks processed
    pub n_samples: u64,
    pub rssi_db: f32,
    /// Preambles detected
    pub nof_prach: u64,
}

impl ChannelMetrics {
    pub fn add_tick(&mut self, rssi_db: f32) {
        self.n_samples += 1;
        update_mean(&mut self.rssi_db, self.n_samples, rssi_db);
    }

    pub fn merge(&mut self, other: &ChannelMetrics) {
        merge_mean(&mut self.rssi_db, self.n_samples, other.rssi_db, other.n_samples);
        self.n_samples += other.n_samples;
        self.nof_prach += other.nof_prach;
    }
}

/// Everything measured on one carrier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CarrierMetrics {
    pub dl: DlMetrics,
    pub ul: UlMetrics,
    pub channel: ChannelMetrics,
}

impl CarrierMetrics {
    pub fn merge(&mut self, other: &CarrierMetrics) {
        self.dl.merge(&other.dl);
        self.ul.merge(&other.ul);
        self.channel.merge(&other.channel);
    }
}

/// Measurements of one UE on one carrier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UeMetrics {
    pub rnti: Rnti,
    pub cc: usize,
    pub dl_n_samples: u64,
    pub dl_mcs: f32,
    pub ul_n_samples: u64,
    pub ul_mcs: f32,
    pub ul_sinr_db: f32,
    pub ul_rssi_db: f32,
    pub ul_crc_ok: u64,
    pub ul_crc_ko: u64,
    /// Transmissions combined by the last successful PUSCH decode
    pub ul_last_combined: u32,
}

impl UeMetrics {
    pub fn new(rnti: Rnti, cc: usize) -> Self {
        Self {
            rnti,
            cc,
            dl_n_samples: 0,
            dl_mcs: 0.0,
            ul_n_samples: 0,
            ul_mcs: 0.0,
            ul_sinr_db: 0.0,
            ul_rssi_db: 0.0,
            ul_crc_ok: 0,
            ul_crc_ko: 0,
            ul_last_combined: 0,
        }
    }

    pub fn add_dl(&mut self, mcs: u8) {
        self.dl_n_samples += 1;
        update_mean(&mut self.dl_mcs, self.dl_n_samples, mcs as f32);
    }

    pub fn add_ul(&mut self, mcs: u8, sinr_db: f32, rssi_db: f32, crc_ok: bool, nof_combined: u32) {
        self.ul_n_samples += 1;
        update_mean(&mut self.ul_mcs, self.ul_n_samples, mcs as f32);
        update_mean(&mut self.ul_sinr_db, self.ul_n_samples, sinr_db);
        update_mean(&mut self.ul_rssi_db, self.ul_n_samples, rssi_db);
        if crc_ok {
            self.ul_crc_ok += 1;
            self.ul_last_combined = nof_combined;
        } else {
            self.ul_crc_ko += 1;
        }
    }

    /// Merge the copy held by another worker for the same RNTI and carrier
    pub fn merge(&mut self, other: &UeMetrics) {
        merge_mean(&mut self.dl_mcs, self.dl_n_samples, other.dl_mcs, other.dl_n_samples);
        merge_mean(&mut self.ul_mcs, self.ul_n_samples, other.ul_mcs, other.ul_n_samples);
        merge_mean(&mut self.ul_sinr_db, self.ul_n_samples, other.ul_sinr_db, other.ul_n_samples);
        merge_mean(&mut self.ul_rssi_db, self.ul_n_samples, other.ul_rssi_db, other.ul_n_samples);
        self.dl_n_samples += other.dl_n_samples;
        self.ul_n_samples += other.ul_n_samples;
        self.ul_crc_ok += other.ul_crc_ok;
        self.ul_crc_ko += other.ul_crc_ko;
        self.ul_last_combined = self.ul_last_combined.max(other.ul_last_combined);
    }
}

/// Radio events seen by the PHY
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RadioMetrics {
    pub nof_overflow: u64,
    pub nof_underflow: u64,
    pub nof_late: u64,
    pub nof_failure: u64,
}

/// Snapshot returned by `Phy::get_metrics`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhyMetrics {
    pub carriers: Vec<CarrierMetrics>,
    pub ues: Vec<UeMetrics>,
    pub radio: RadioMetrics,
    /// Ticks handed to the worker pool
    pub nof_ticks: u64,
    /// PRACH occasions dropped because the detector queue was full
    pub nof_prach_dropped: u64,
    /// Pending table entries overwritten before being consumed
    pub nof_pending_overwritten: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut ul = UlMetrics::default();
        ul.add_pusch(10, 20.0, true, 100);
        ul.add_pusch(20, 10.0, false, 100);
        assert_eq!(ul.n_samples, 2);
        assert!((ul.mcs - 15.0).abs() < 1e-6);
        assert!((ul.sinr_db - 15.0).abs() < 1e-6);
        assert_eq!(ul.nof_rx_bytes, 100);
        assert!((ul.bler() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_merge_is_weighted() {
        let mut a = DlMetrics::default();
        a.add_pdsch(10, 50);
        let mut b = DlMetrics::default();
        for _ in 0..3 {
            b.add_pdsch(20, 50);
        }
        a.merge(&b);
        assert_eq!(a.n_samples, 4);
        assert!((a.mcs - 17.5).abs() < 1e-5);
        assert_eq!(a.nof_tx_bytes, 200);
    }

    #[test]
    fn test_ue_metrics_merge() {
        let rnti = Rnti::new(0x46);
        let mut a = UeMetrics::new(rnti, 0);
        a.add_ul(4, 12.0, -30.0, true, 1);
        let mut b = UeMetrics::new(rnti, 0);
        b.add_ul(8, 16.0, -30.0, true, 2);
        a.merge(&b);
        assert_eq!(a.ul_n_samples, 2);
        assert!((a.ul_mcs - 6.0).abs() < 1e-6);
        assert_eq!(a.ul_last_combined, 2);
    }

    #[test]
    fn test_metrics_serialize() {
        let metrics = PhyMetrics {
            carriers: vec![CarrierMetrics::default()],
            ..Default::default()
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains("\"n_samples\":0"));
    }
}
