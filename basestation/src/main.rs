//! Albor Space Base Station Main Application
//!
//! Wires the radio, the round-robin MAC and the PHY pipeline together. The PHY
//! runs on its own real-time threads; the tokio runtime only hosts the control
//! tasks (RACH attachment, metrics report) and waits for Ctrl-C.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{BsConfig, RadioDriver};
use interfaces::{LoopbackConfig, LoopbackRadio, RadioInterface, ZmqRadio, ZmqRadioConfig};
use layers::mac::{MacLayer, PhyInterfaceStack};
use layers::phy::{Phy, PhyLogContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Period of the RACH attachment task
const CONTROL_PERIOD: Duration = Duration::from_millis(10);
/// Period of the Tx/Rx liveness check
const WATCHDOG_PERIOD: Duration = Duration::from_millis(500);

/// Albor Space LTE/NR base station
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Subframe workers in the PHY pool
    #[arg(long)]
    nof_workers: Option<usize>,

    /// Radio driver
    #[arg(long, value_enum)]
    radio: Option<RadioDriver>,

    /// ZMQ device arguments (e.g. "tx_port=tcp://*:2000,rx_port=tcp://localhost:2001")
    #[arg(long)]
    device_args: Option<String>,
}

impl Args {
    /// Command line values take precedence over the file
    fn apply(&self, config: &mut BsConfig) {
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(nof_workers) = self.nof_workers {
            config.phy.nof_workers = nof_workers;
        }
        if let Some(driver) = self.radio {
            config.radio.driver = driver;
        }
        if let Some(device_args) = &self.device_args {
            config.radio.device_args = device_args.clone();
        }
    }
}

fn open_radio(config: &BsConfig, nof_channels: usize, sample_rate: f64) -> Result<Arc<dyn RadioInterface>> {
    match config.radio.driver {
        RadioDriver::Zmq => {
            let mut zmq_config = ZmqRadioConfig::from_device_args(&config.radio.device_args, nof_channels)?;
            if (zmq_config.sample_rate - sample_rate).abs() > 1.0 {
                warn!(
                    "base_srate {} MHz overridden by the cell sample rate {} MHz",
                    zmq_config.sample_rate / 1e6,
                    sample_rate / 1e6
                );
                zmq_config.sample_rate = sample_rate;
            }
            info!("ZMQ radio: TX {:?}, RX {:?}", zmq_config.tx_addresses, zmq_config.rx_addresses);
            Ok(Arc::new(ZmqRadio::new(zmq_config).context("opening ZMQ radio")?))
        }
        RadioDriver::Loopback => {
            info!("Loopback radio, realtime={}", config.radio.realtime);
            Ok(Arc::new(LoopbackRadio::new(LoopbackConfig {
                nof_channels,
                sample_rate,
                realtime: config.radio.realtime,
                noise_amplitude: config.radio.noise_amplitude,
                tx_capture: 0,
                ..LoopbackConfig::default()
            })))
        }
    }
}

/// Attach every UE that completed a preamble; returns how many were attached
fn attach_ues(phy: &dyn PhyInterfaceStack, mac: &MacLayer) -> usize {
    let mut attached = 0;
    while let Some(event) = mac.pop_rach() {
        let rnti = event.temp_crnti;
        if let Err(e) = phy.add_rnti(rnti) {
            warn!("PHY rejected {}: {}", rnti, e);
            continue;
        }
        if let Err(e) = mac.add_ue(rnti) {
            warn!("MAC rejected {}: {}", rnti, e);
            if let Err(e) = phy.rem_rnti(rnti) {
                warn!("PHY kept {} after MAC rejection: {}", rnti, e);
            }
            continue;
        }
        info!("UE {} attached after preamble {} on carrier {}", rnti, event.preamble, event.cc);
        attached += 1;
    }
    attached
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => BsConfig::load(path)?,
        None => BsConfig::default(),
    };
    args.apply(&mut config);

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor Space base station");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path.display());
    }

    let phy_config = config.phy_config()?;
    phy_config.validate().context("invalid PHY configuration")?;
    for (cc, cell) in phy_config.cells.iter().enumerate() {
        info!("Cell {}: PCI {}, {} PRB, {} ports", cc, cell.pci, cell.nof_prb, cell.nof_ports);
    }

    let radio = open_radio(&config, phy_config.nof_radio_channels(), phy_config.sample_rate())?;
    let mac = Arc::new(MacLayer::new(config.mac_config()?).context("invalid MAC configuration")?);
    let phy = Arc::new(Phy::init(phy_config, radio, mac.clone(), PhyLogContext::new("bs")).context("starting PHY")?);
    info!("Base station running");

    // Attach UEs that completed a preamble
    let control_handle = {
        let phy = phy.clone();
        let mac = mac.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CONTROL_PERIOD);
            loop {
                interval.tick().await;
                attach_ues(phy.as_ref(), &mac);
            }
        })
    };

    let stats_handle = (config.log.metrics_period_s > 0).then(|| {
        let phy = phy.clone();
        let mac = mac.clone();
        let period = Duration::from_secs(config.log.metrics_period_s);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let phy_metrics = phy.get_metrics();
                let mac_metrics = mac.metrics();

                info!(
                    "Ticks: {}, UEs: {}, DL tx/retx: {}/{}, UL crc ok/ko: {}/{}, PRACH dropped: {}",
                    phy_metrics.nof_ticks,
                    mac_metrics.nof_ues,
                    mac_metrics.dl_tx,
                    mac_metrics.dl_retx,
                    mac_metrics.ul_crc_ok,
                    mac_metrics.ul_crc_ko,
                    phy_metrics.nof_prach_dropped
                );
                let radio = phy_metrics.radio;
                if radio.nof_overflow + radio.nof_underflow + radio.nof_late + radio.nof_failure > 0 {
                    warn!(
                        "Radio: {} overflows, {} underflows, {} late, {} failures",
                        radio.nof_overflow, radio.nof_underflow, radio.nof_late, radio.nof_failure
                    );
                }
                match serde_json::to_string(&phy_metrics) {
                    Ok(json) => debug!("PHY metrics: {}", json),
                    Err(e) => warn!("Serializing PHY metrics failed: {}", e),
                }
                if let Ok(json) = serde_json::to_string(&mac_metrics) {
                    debug!("MAC metrics: {}", json);
                }
            }
        })
    });

    let watchdog = {
        let phy = phy.clone();
        async move {
            let mut interval = tokio::time::interval(WATCHDOG_PERIOD);
            while phy.is_running() {
                interval.tick().await;
            }
        }
    };

    // Wait for shutdown signal
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Waiting for Ctrl-C failed: {}", e),
        },
        _ = watchdog => {
            warn!("PHY processing stopped unexpectedly");
        }
    }

    info!("Shutting down base station");
    control_handle.abort();
    if let Some(handle) = stats_handle {
        handle.abort();
    }

    // joins the PHY threads
    let stopper = phy.clone();
    tokio::task::spawn_blocking(move || stopper.stop())
        .await
        .context("stopping PHY")?;

    info!("Processed {} ticks", phy.nof_ticks());
    info!("Base station shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Rnti, Tti};
    use layers::mac::{MacConfig, StackInterfacePhy};
    use layers::phy::PhyMetrics;
    use layers::LayerError;
    use std::sync::Mutex;

    /// PHY stand-in that accepts every RNTI and records removals
    #[derive(Default)]
    struct RecordingPhy {
        added: Mutex<Vec<Rnti>>,
        removed: Mutex<Vec<Rnti>>,
        fail_removal: bool,
    }

    impl PhyInterfaceStack for RecordingPhy {
        fn add_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
            self.added.lock().unwrap().push(rnti);
            Ok(())
        }
        fn rem_rnti(&self, rnti: Rnti) -> Result<(), LayerError> {
            self.removed.lock().unwrap().push(rnti);
            if self.fail_removal {
                return Err(LayerError::UnknownRnti(rnti));
            }
            Ok(())
        }
        fn get_nof_rnti(&self) -> usize {
            self.added.lock().unwrap().len() - self.removed.lock().unwrap().len()
        }
        fn get_metrics(&self) -> PhyMetrics {
            PhyMetrics::default()
        }
        fn reset(&self) {}
    }

    fn mac(max_ues: usize) -> MacLayer {
        MacLayer::new(MacConfig {
            max_ues,
            ..MacConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_preamble_attaches_ue() {
        let phy = RecordingPhy::default();
        let mac = mac(4);
        mac.rach_detected(Tti(1), 0, 5, 0);
        assert_eq!(attach_ues(&phy, &mac), 1);
        assert_eq!(mac.nof_ues(), 1);
        assert_eq!(phy.get_nof_rnti(), 1);
        assert_eq!(attach_ues(&phy, &mac), 0);
    }

    #[test]
    fn test_mac_rejection_rolls_back_phy() {
        let mac = mac(1);
        mac.add_ue(Rnti::new(0x1000)).unwrap();
        mac.rach_detected(Tti(1), 0, 5, 0);
        mac.rach_detected(Tti(11), 0, 6, 0);

        let phy = RecordingPhy {
            fail_removal: true,
            ..RecordingPhy::default()
        };
        // a failed rollback is logged and the next event is still handled
        assert_eq!(attach_ues(&phy, &mac), 0);
        assert_eq!(*phy.removed.lock().unwrap(), *phy.added.lock().unwrap());
        assert_eq!(phy.removed.lock().unwrap().len(), 2);
        assert_eq!(mac.nof_ues(), 1);
    }
}
