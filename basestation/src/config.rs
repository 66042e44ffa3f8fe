//! TOML Configuration of the Base Station
//!
//! Every field has a default, so an empty file describes a single 5 MHz LTE
//! cell on the loopback radio.

use anyhow::{Context, Result};
use common::{Bandwidth, Rat};
use layers::mac::MacConfig;
use layers::phy::{CellConfig, HarqTiming, PhyConfig, PrachConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BsConfig {
    pub log: LogConfig,
    pub phy: PhySection,
    /// Component carriers, `[[cell]]` tables in file order
    #[serde(rename = "cell")]
    pub cells: Vec<CellSection>,
    pub prach: PrachConfig,
    pub radio: RadioConfig,
    pub mac: MacConfig,
}

/// Logging and reporting
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    /// Seconds between metrics reports (0 disables)
    pub metrics_period_s: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            metrics_period_s: 5,
        }
    }
}

/// Pipeline parameters shared by all carriers
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PhySection {
    pub rat: Rat,
    pub nof_workers: usize,
    pub worker_priority: i32,
    pub txrx_priority: i32,
    pub prach_priority: i32,
    pub timing: HarqTiming,
    pub pending_window: u32,
    pub pucch_threshold: f32,
    pub mbsfn_subframes: Vec<u8>,
    pub mbsfn_control_symbols: u8,
}

impl Default for PhySection {
    fn default() -> Self {
        let phy = PhyConfig::default();
        Self {
            rat: phy.rat,
            nof_workers: phy.nof_workers,
            worker_priority: phy.worker_priority,
            txrx_priority: phy.txrx_priority,
            prach_priority: phy.prach_priority,
            timing: phy.timing,
            pending_window: phy.pending_window,
            pucch_threshold: phy.pucch_threshold,
            mbsfn_subframes: phy.mbsfn_subframes,
            mbsfn_control_symbols: phy.mbsfn_control_symbols,
        }
    }
}

/// One `[[cell]]` table
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CellSection {
    /// Channel bandwidth in MHz, takes precedence over `nof_prb`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mhz: Option<f32>,
    #[serde(flatten)]
    pub cell: CellConfig,
}

impl CellSection {
    fn resolve(&self, rat: Rat) -> Result<CellConfig> {
        let mut cell = self.cell.clone();
        if let Some(mhz) = self.bandwidth_mhz {
            let bandwidth = Bandwidth::from_mhz(mhz)?;
            cell.nof_prb = bandwidth
                .nof_prb(rat)
                .with_context(|| format!("{} MHz channel not defined for {}", mhz, rat))?;
        }
        Ok(cell)
    }
}

/// Radio driver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RadioDriver {
    /// srsRAN-compatible ZMQ IQ exchange
    Zmq,
    /// In-process synthetic radio
    Loopback,
}

/// Radio front end
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RadioConfig {
    pub driver: RadioDriver,
    /// ZMQ device arguments ("tx_port=...,rx_port=...,base_srate=...")
    pub device_args: String,
    /// Pace the loopback radio to the sample rate
    pub realtime: bool,
    /// Loopback receive noise amplitude
    pub noise_amplitude: f32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            driver: RadioDriver::Loopback,
            device_args: "tx_port=tcp://*:2000,rx_port=tcp://localhost:2001".to_string(),
            realtime: true,
            noise_amplitude: 0.001,
        }
    }
}

impl BsConfig {
    /// Read and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing configuration {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Carriers in use, one default cell when none is configured
    pub fn cells(&self) -> Result<Vec<CellConfig>> {
        if self.cells.is_empty() {
            return Ok(vec![CellConfig::default()]);
        }
        self.cells
            .iter()
            .enumerate()
            .map(|(index, section)| section.resolve(self.phy.rat).with_context(|| format!("cell {}", index)))
            .collect()
    }

    pub fn phy_config(&self) -> Result<PhyConfig> {
        Ok(PhyConfig {
            rat: self.phy.rat,
            cells: self.cells()?,
            nof_workers: self.phy.nof_workers,
            worker_priority: self.phy.worker_priority,
            txrx_priority: self.phy.txrx_priority,
            prach_priority: self.phy.prach_priority,
            timing: self.phy.timing,
            pending_window: self.phy.pending_window,
            pucch_threshold: self.phy.pucch_threshold,
            mbsfn_subframes: self.phy.mbsfn_subframes.clone(),
            mbsfn_control_symbols: self.phy.mbsfn_control_symbols,
            prach: self.prach.clone(),
        })
    }

    /// MAC parameters with the carrier layout taken from the cells
    pub fn mac_config(&self) -> Result<MacConfig> {
        let cells = self.cells()?;
        let primary = &cells[0];
        Ok(MacConfig {
            nof_carriers: cells.len(),
            nof_prb: primary.nof_prb,
            nof_pucch_prb: primary.nof_pucch_prb,
            k_pusch: self.phy.timing.k_pusch,
            ..self.mac.clone()
        })
    }
}
