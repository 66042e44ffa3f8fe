//! PHY Configuration
//!
//! Cell, timing and PRACH parameters supplied at `Phy::init` time. Changing any
//! of them requires tearing the pipeline down and building a new one.

use crate::LayerError;
use common::{fft_size_for_prb, samples_per_tick, Pci, Rat};
use serde::{Deserialize, Serialize};

/// Maximum number of subframe workers in the pool
pub const MAX_WORKERS: usize = 4;
/// Maximum number of component carriers
pub const MAX_CARRIERS: usize = 5;
/// Maximum number of antenna ports per carrier
pub const MAX_PORTS: usize = 4;
/// HARQ processes per UE and direction
pub const NOF_HARQ_PROCESSES: usize = 8;
/// Subframes that may carry MBSFN in FDD
pub const MBSFN_CAPABLE_SUBFRAMES: [u8; 6] = [1, 2, 3, 6, 7, 8];

/// One component carrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    /// Physical cell identity
    pub pci: u16,
    /// Carrier width in PRB
    pub nof_prb: u16,
    /// Antenna ports (radio channels per carrier)
    pub nof_ports: usize,
    /// PUCCH resource offset added to the first CCE of a DL assignment
    pub n1_pucch_an: u16,
    /// PRBs reserved for PUCCH at each band edge
    pub nof_pucch_prb: u16,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            pci: 1,
            nof_prb: 25,
            nof_ports: 1,
            n1_pucch_an: 0,
            nof_pucch_prb: 2,
        }
    }
}

impl CellConfig {
    /// FFT size used by this carrier
    pub fn fft_size(&self) -> usize {
        fft_size_for_prb(self.nof_prb).unwrap_or(0)
    }

    /// Number of subcarriers carrying data
    pub fn nof_subcarriers(&self) -> usize {
        12 * self.nof_prb as usize
    }

    /// Frequency shift of the cell reference signals
    pub fn v_shift(&self) -> usize {
        (self.pci % 6) as usize
    }

    fn validate(&self, rat: Rat, index: usize) -> Result<(), LayerError> {
        if !rat.is_valid_nof_prb(self.nof_prb) {
            return Err(LayerError::InvalidConfiguration(format!(
                "cell {}: {} PRB not supported for {}",
                index, self.nof_prb, rat
            )));
        }
        let max_pci = match rat {
            Rat::Lte => Pci::MAX_LTE,
            Rat::Nr { .. } => Pci::MAX,
        };
        if self.pci > max_pci {
            return Err(LayerError::InvalidConfiguration(format!(
                "cell {}: PCI {} exceeds {}",
                index, self.pci, max_pci
            )));
        }
        if self.nof_ports == 0 || self.nof_ports > MAX_PORTS {
            return Err(LayerError::InvalidConfiguration(format!(
                "cell {}: {} antenna ports (1..={})",
                index, self.nof_ports, MAX_PORTS
            )));
        }
        if 2 * self.nof_pucch_prb >= self.nof_prb {
            return Err(LayerError::InvalidConfiguration(format!(
                "cell {}: {} PUCCH PRB per edge leave no room for PUSCH",
                index, self.nof_pucch_prb
            )));
        }
        Ok(())
    }
}

/// HARQ timing, all in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarqTiming {
    /// Rx to Tx processing delay (tti_tx_dl = tti_rx + tx_delay)
    pub tx_delay: u32,
    /// UL grant to PUSCH reception
    pub k_pusch: u32,
    /// PDSCH transmission to HARQ-ACK reception
    pub k_ack: u32,
}

impl Default for HarqTiming {
    fn default() -> Self {
        Self {
            tx_delay: 4,
            k_pusch: 4,
            k_ack: 4,
        }
    }
}

impl HarqTiming {
    /// Longest distance between writing a pending entry and consuming it
    pub fn max_round_trip(&self) -> u32 {
        self.tx_delay + self.k_pusch.max(self.k_ack)
    }

    /// Shortest distance between writing a pending entry and consuming it
    pub fn min_round_trip(&self) -> u32 {
        self.tx_delay + self.k_pusch.min(self.k_ack)
    }
}

/// PRACH parameters shared by all carriers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrachConfig {
    /// Run preamble detection at all
    pub enabled: bool,
    /// FDD PRACH configuration index (0..=15)
    pub config_index: u8,
    /// First root sequence
    pub root_seq_index: u16,
    /// Zero correlation zone configuration (0..=15)
    pub zero_corr_zone: u8,
    /// First PRB of the preamble
    pub freq_offset: u16,
    /// Peak-to-average detection threshold
    pub threshold: f32,
    /// Pending detection jobs per carrier before new occasions are dropped
    pub queue_depth: usize,
}

impl Default for PrachConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_index: 3,
            root_seq_index: 22,
            zero_corr_zone: 12,
            freq_offset: 2,
            threshold: 20.0,
            queue_depth: 4,
        }
    }
}

/// Complete PHY configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhyConfig {
    /// Radio access technology and numerology
    pub rat: Rat,
    /// Component carriers, the first one is the primary cell
    pub cells: Vec<CellConfig>,
    /// Subframe workers in the pool
    pub nof_workers: usize,
    /// Real-time priority of pool workers (0 disables)
    pub worker_priority: i32,
    /// Real-time priority of the Tx/Rx thread
    pub txrx_priority: i32,
    /// Real-time priority of PRACH workers
    pub prach_priority: i32,
    /// HARQ timing
    pub timing: HarqTiming,
    /// Slots in the pending grant/ACK tables
    pub pending_window: u32,
    /// PUCCH detection threshold (linear SNR) below which feedback is DTX
    pub pucch_threshold: f32,
    /// Subframes configured as MBSFN
    pub mbsfn_subframes: Vec<u8>,
    /// Control symbols kept in MBSFN subframes
    pub mbsfn_control_symbols: u8,
    /// PRACH detection
    pub prach: PrachConfig,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            rat: Rat::Lte,
            cells: vec![CellConfig::default()],
            nof_workers: MAX_WORKERS,
            worker_priority: 0,
            txrx_priority: 0,
            prach_priority: 0,
            timing: HarqTiming::default(),
            pending_window: 20,
            pucch_threshold: 4.0,
            mbsfn_subframes: Vec::new(),
            mbsfn_control_symbols: 2,
            prach: PrachConfig::default(),
        }
    }
}

impl PhyConfig {
    /// Check every parameter, failing with the first violation found
    pub fn validate(&self) -> Result<(), LayerError> {
        self.rat.scs()?;

        if self.nof_workers == 0 || self.nof_workers > MAX_WORKERS {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} workers (1..={})",
                self.nof_workers, MAX_WORKERS
            )));
        }

        if self.cells.is_empty() || self.cells.len() > MAX_CARRIERS {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} carriers (1..={})",
                self.cells.len(),
                MAX_CARRIERS
            )));
        }

        for (index, cell) in self.cells.iter().enumerate() {
            cell.validate(self.rat, index)?;
        }

        let first = &self.cells[0];
        if self
            .cells
            .iter()
            .any(|c| c.nof_prb != first.nof_prb || c.nof_ports != first.nof_ports)
        {
            return Err(LayerError::InvalidConfiguration(
                "all carriers must share PRB count and antenna ports".to_string(),
            ));
        }

        if self.timing.tx_delay == 0 {
            return Err(LayerError::InvalidConfiguration("tx_delay must be at least 1 tick".to_string()));
        }

        // the reader of an entry must run on the same slot as its writer, or later
        let min_round_trip = self.timing.min_round_trip();
        if (min_round_trip as usize) < self.nof_workers {
            return Err(LayerError::InvalidConfiguration(format!(
                "HARQ round trip {} is shorter than the {} workers in flight",
                min_round_trip, self.nof_workers
            )));
        }

        let round_trip = self.timing.max_round_trip();
        if self.pending_window <= round_trip {
            return Err(LayerError::InvalidConfiguration(format!(
                "pending window {} must exceed HARQ round trip {}",
                self.pending_window, round_trip
            )));
        }

        if self.rat.tick_modulus() % self.pending_window != 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "pending window {} must divide the tick modulus {}",
                self.pending_window,
                self.rat.tick_modulus()
            )));
        }

        if let Some(sf) = self
            .mbsfn_subframes
            .iter()
            .find(|sf| !MBSFN_CAPABLE_SUBFRAMES.contains(sf))
        {
            return Err(LayerError::InvalidConfiguration(format!(
                "subframe {} cannot carry MBSFN",
                sf
            )));
        }
        if !(1..=2).contains(&self.mbsfn_control_symbols) {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} MBSFN control symbols (1..=2)",
                self.mbsfn_control_symbols
            )));
        }

        if self.prach.enabled {
            if self.prach.config_index > 15 || self.prach.zero_corr_zone > 15 {
                return Err(LayerError::InvalidConfiguration(format!(
                    "PRACH config index {} / zero correlation zone {} (0..=15)",
                    self.prach.config_index, self.prach.zero_corr_zone
                )));
            }
            if self.prach.freq_offset + 6 > first.nof_prb {
                return Err(LayerError::InvalidConfiguration(format!(
                    "PRACH at PRB {} does not fit in {} PRB",
                    self.prach.freq_offset, first.nof_prb
                )));
            }
            if self.prach.root_seq_index > 837 {
                return Err(LayerError::InvalidConfiguration(format!(
                    "PRACH root sequence {} (0..=837)",
                    self.prach.root_seq_index
                )));
            }
            if self.prach.queue_depth == 0 {
                return Err(LayerError::InvalidConfiguration("PRACH queue depth must be positive".to_string()));
            }
        }

        Ok(())
    }

    /// Number of carriers
    pub fn nof_carriers(&self) -> usize {
        self.cells.len()
    }

    /// Antenna ports per carrier
    pub fn nof_ports(&self) -> usize {
        self.cells.first().map(|c| c.nof_ports).unwrap_or(1)
    }

    /// Radio channels the pipeline expects (carriers x ports)
    pub fn nof_radio_channels(&self) -> usize {
        self.nof_carriers() * self.nof_ports()
    }

    /// FFT size shared by all carriers
    pub fn fft_size(&self) -> usize {
        self.cells.first().map(|c| c.fft_size()).unwrap_or(0)
    }

    /// Baseband samples per tick and channel
    pub fn samples_per_tick(&self) -> usize {
        samples_per_tick(self.fft_size())
    }

    /// Baseband sample rate in Hz
    pub fn sample_rate(&self) -> f64 {
        let scs_hz = self.rat.scs().map(|s| s.as_hz()).unwrap_or(15_000.0);
        self.fft_size() as f64 * scs_hz
    }

    /// Whether the tick falls in a configured MBSFN subframe (slot 0 of the subframe for NR)
    pub fn is_mbsfn(&self, tick_in_frame: u32) -> bool {
        let subframe = tick_in_frame / self.rat.ticks_per_subframe();
        self.mbsfn_subframes.contains(&(subframe as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PhyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fft_size(), 512);
        assert_eq!(config.samples_per_tick(), 7680);
        assert!((config.sample_rate() - 7.68e6).abs() < 1.0);
    }

    #[test]
    fn test_window_must_exceed_round_trip() {
        let mut config = PhyConfig::default();
        config.pending_window = 8;
        assert!(matches!(config.validate(), Err(LayerError::InvalidConfiguration(_))));
        config.pending_window = 9;
        assert!(config.validate().is_err());
        config.pending_window = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_round_trip_must_cover_workers_in_flight() {
        let mut config = PhyConfig::default();
        config.timing = HarqTiming {
            tx_delay: 1,
            k_pusch: 1,
            k_ack: 1,
        };
        config.pending_window = 4;
        config.nof_workers = 4;
        assert!(matches!(config.validate(), Err(LayerError::InvalidConfiguration(_))));

        config.nof_workers = 2;
        assert!(config.validate().is_ok());

        // the shorter of the two delays decides
        config.nof_workers = 4;
        config.timing = HarqTiming {
            tx_delay: 2,
            k_pusch: 1,
            k_ack: 6,
        };
        config.pending_window = 10;
        assert!(config.validate().is_err());
        config.timing.k_pusch = 2;
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.min_round_trip(), 4);
    }

    #[test]
    fn test_worker_and_carrier_bounds() {
        let mut config = PhyConfig::default();
        config.nof_workers = 5;
        assert!(config.validate().is_err());

        config.nof_workers = 2;
        config.cells = vec![CellConfig::default(); 6];
        assert!(config.validate().is_err());

        config.cells = Vec::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_cell_parameters() {
        let mut config = PhyConfig::default();
        config.cells[0].nof_prb = 27;
        assert!(config.validate().is_err());

        let mut config = PhyConfig::default();
        config.cells[0].nof_ports = 0;
        assert!(config.validate().is_err());

        let mut config = PhyConfig::default();
        config.cells.push(CellConfig {
            nof_prb: 50,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mbsfn_subframes() {
        let mut config = PhyConfig::default();
        config.mbsfn_subframes = vec![1, 6];
        assert!(config.validate().is_ok());
        assert!(config.is_mbsfn(6));
        assert!(!config.is_mbsfn(5));

        config.mbsfn_subframes = vec![0];
        assert!(config.validate().is_err());
    }
}
