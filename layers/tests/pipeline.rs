//! End-to-end runs of the PHY pipeline over the loopback radio

use bytes::Bytes;
use common::{Rnti, Tti};
use interfaces::{LoopbackConfig, LoopbackRadio, RfTimestamp};
use layers::mac::{
    DlSchedResult, MacConfig, MacLayer, PhyInterfaceStack, StackInterfacePhy, UlSchedResult,
};
use layers::phy::prach::PrachGenerator;
use layers::phy::{CellConfig, HarqTiming, Phy, PhyConfig, PhyLogContext};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records what the PHY asks of the stack
#[derive(Default)]
struct RecordingStack {
    clock: AtomicU64,
    dl_sched: Mutex<Vec<Tti>>,
    rach: Mutex<Vec<(Tti, usize, u8, u32)>>,
}

impl StackInterfacePhy for RecordingStack {
    fn tti_clock(&self) {
        self.clock.fetch_add(1, Ordering::Relaxed);
    }
    fn get_dl_sched(&self, tti: Tti, _results: &mut [DlSchedResult]) {
        self.dl_sched.lock().push(tti);
    }
    fn get_ul_sched(&self, _tti: Tti, _results: &mut [UlSchedResult]) {}
    fn crc_info(&self, _: Tti, _: Rnti, _: usize, _: u8, _: bool, _: usize) {}
    fn push_pdu(&self, _: Tti, _: Rnti, _: usize, _: Bytes) {}
    fn ack_info(&self, _: Tti, _: Rnti, _: usize, _: u8, _: bool) {}
    fn snr_info(&self, _: Tti, _: Rnti, _: usize, _: f32) {}
    fn rach_detected(&self, tti: Tti, cc: usize, preamble: u8, ta: u32) {
        self.rach.lock().push((tti, cc, preamble, ta));
    }
}

fn loopback(config: &PhyConfig) -> Arc<LoopbackRadio> {
    Arc::new(LoopbackRadio::new(LoopbackConfig {
        nof_channels: config.nof_radio_channels(),
        sample_rate: config.sample_rate(),
        tx_capture: 1024,
        ..LoopbackConfig::default()
    }))
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_ticks_are_consecutive_and_tx_ordered() {
    init_tracing();
    let config = PhyConfig {
        cells: vec![CellConfig {
            nof_prb: 100,
            ..CellConfig::default()
        }],
        nof_workers: 4,
        ..PhyConfig::default()
    };
    let radio = loopback(&config);
    let stack = Arc::new(RecordingStack::default());
    let phy = Phy::init(config, radio.clone(), stack.clone(), PhyLogContext::new("consecutive")).unwrap();

    let mut n_samples = Vec::new();
    wait_for("100 ticks", || {
        n_samples.push(phy.get_metrics().carriers[0].channel.n_samples);
        phy.nof_ticks() >= 100
    });
    phy.stop();

    assert!(n_samples.windows(2).all(|w| w[0] <= w[1]));

    let nof_ticks = phy.nof_ticks();
    let mut ttis = stack.dl_sched.lock().clone();
    assert_eq!(ttis.len() as u64, nof_ticks);
    ttis.sort();
    for (i, tti) in ttis.iter().enumerate() {
        assert_eq!(*tti, Tti(i as u32 + 4));
    }
    assert!(stack.clock.load(Ordering::Relaxed) >= 100);

    // ticks still in flight when the Tx/Rx thread stopped are never sent
    let tx = radio.transmitted();
    assert!(!tx.is_empty() && tx.len() as u64 <= nof_ticks);
    assert!(tx.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(tx[0].timestamp, RfTimestamp(4 * 30720));
    assert_eq!(radio.tx_counters().1, 0);
    assert_eq!(phy.get_metrics().radio.nof_late, 0);
}

#[test]
fn test_overflow_skips_one_tick() {
    let config = PhyConfig::default();
    let spt = config.samples_per_tick() as u64;
    let radio = loopback(&config);
    radio.inject_overflow(RfTimestamp(5 * spt));
    let stack = Arc::new(RecordingStack::default());
    let phy = Phy::init(config, radio.clone(), stack.clone(), PhyLogContext::new("overflow")).unwrap();

    wait_for("20 ticks", || phy.nof_ticks() >= 20);
    phy.stop();

    let ttis = stack.dl_sched.lock().clone();
    assert!(!ttis.contains(&Tti(9)));
    assert!(ttis.contains(&Tti(8)) && ttis.contains(&Tti(10)));
    assert_eq!(phy.get_metrics().radio.nof_overflow, 1);

    let tx = radio.transmitted();
    assert!(tx.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(!tx.iter().any(|r| r.timestamp == RfTimestamp(9 * spt)));
}

#[test]
fn test_rnti_on_two_carriers() {
    let config = PhyConfig {
        cells: vec![
            CellConfig::default(),
            CellConfig {
                pci: 2,
                ..CellConfig::default()
            },
        ],
        ..PhyConfig::default()
    };
    let radio = loopback(&config);
    let stack = Arc::new(RecordingStack::default());
    let phy = Phy::init(config, radio, stack, PhyLogContext::new("two-cells")).unwrap();

    let rnti = Rnti::new(0x1234);
    phy.add_rnti(rnti).unwrap();
    assert_eq!(phy.get_nof_rnti(), 1);
    assert_eq!(phy.get_nof_rnti_per_carrier(), vec![1, 1]);
    assert!(phy.add_rnti(rnti).is_err());

    wait_for("a few ticks", || phy.nof_ticks() >= 10);
    let metrics = phy.get_metrics();
    assert_eq!(metrics.carriers.len(), 2);
    assert_eq!(metrics.ues.len(), 2);

    // a failed removal leaves every slot untouched
    assert!(phy.rem_rnti(Rnti::new(0x4321)).is_err());
    assert!(phy.get_nof_rnti_per_worker().iter().flatten().all(|&n| n == 1));

    phy.rem_rnti(rnti).unwrap();
    assert_eq!(phy.get_nof_rnti(), 0);
    assert!(phy.get_nof_rnti_per_worker().iter().flatten().all(|&n| n == 0));
    phy.stop();
}

#[test]
fn test_reset_while_running() {
    init_tracing();
    let config = PhyConfig::default();
    let spt = config.samples_per_tick() as u64;
    let radio = Arc::new(LoopbackRadio::new(LoopbackConfig {
        nof_channels: config.nof_radio_channels(),
        sample_rate: config.sample_rate(),
        realtime: true,
        ..LoopbackConfig::default()
    }));
    radio.inject_overflow(RfTimestamp(5 * spt));
    let stack = Arc::new(RecordingStack::default());
    let phy = Phy::init(config, radio, stack, PhyLogContext::new("reset")).unwrap();

    wait_for("50 ticks", || phy.nof_ticks() >= 50);
    let before = phy.get_metrics();
    assert!(before.carriers[0].channel.n_samples >= 40);
    assert_eq!(before.radio.nof_overflow, 1);

    phy.reset();
    let after = phy.get_metrics();
    assert!(after.carriers[0].channel.n_samples < 10);
    assert_eq!(after.radio.nof_overflow, 0);
    assert!(after.nof_ticks >= before.nof_ticks);

    // the Tx/Rx thread keeps dispatching after every slot was held
    let resumed_from = phy.nof_ticks();
    wait_for("20 more ticks", || phy.nof_ticks() >= resumed_from + 20);
    assert!(phy.is_running());
    assert!(phy.get_metrics().carriers[0].channel.n_samples >= 10);
    assert_eq!(phy.get_metrics().nof_pending_overwritten, 0);
    phy.stop();
}

#[test]
fn test_short_round_trip_is_rejected() {
    let config = PhyConfig {
        timing: HarqTiming {
            tx_delay: 1,
            k_pusch: 1,
            k_ack: 1,
        },
        pending_window: 4,
        nof_workers: 4,
        ..PhyConfig::default()
    };
    let radio = loopback(&config);
    let stack = Arc::new(RecordingStack::default());
    assert!(Phy::init(config, radio, stack, PhyLogContext::new("round-trip")).is_err());
}

#[test]
fn test_radio_channel_mismatch_is_rejected() {
    let config = PhyConfig::default();
    let radio = Arc::new(LoopbackRadio::new(LoopbackConfig {
        nof_channels: 2,
        ..LoopbackConfig::default()
    }));
    let stack = Arc::new(RecordingStack::default());
    assert!(Phy::init(config, radio, stack, PhyLogContext::new("mismatch")).is_err());
}

#[test]
fn test_injected_preamble_is_reported() {
    init_tracing();
    let config = PhyConfig::default();
    let spt = config.samples_per_tick();
    let cell = config.cells[0].clone();
    let generator = PrachGenerator::new(&config.prach, cell.nof_prb, cell.fft_size(), 0);
    let samples = generator.generate(23, 0).unwrap();
    assert_eq!(samples.len(), spt);

    let radio = loopback(&config);
    // subframe 1 of frame 1
    radio.inject_rx(RfTimestamp(11 * spt as u64), vec![samples]);
    let stack = Arc::new(RecordingStack::default());
    let phy = Phy::init(config, radio, stack.clone(), PhyLogContext::new("prach")).unwrap();

    wait_for("the preamble", || !stack.rach.lock().is_empty());
    phy.stop();

    let rach = stack.rach.lock().clone();
    assert_eq!(rach, vec![(Tti(11), 0, 23, 0)]);
    assert_eq!(phy.get_metrics().carriers[0].channel.nof_prach, 1);
}

#[test]
fn test_mac_retransmits_without_feedback() {
    init_tracing();
    let config = PhyConfig::default();
    let radio = loopback(&config);
    let mac = Arc::new(
        MacLayer::new(MacConfig {
            nof_prb: config.cells[0].nof_prb,
            ..MacConfig::default()
        })
        .unwrap(),
    );
    let phy = Phy::init(config, radio, mac.clone(), PhyLogContext::new("mac")).unwrap();

    let rnti = Rnti::new(0x4601);
    phy.add_rnti(rnti).unwrap();
    mac.add_ue(rnti).unwrap();
    mac.push_dl_data(rnti, Bytes::from(vec![0xa5; 64])).unwrap();

    // a silent uplink carries no PUCCH, every assignment is NACKed
    wait_for("the block to be dropped", || mac.metrics().dl_dropped >= 1);
    phy.stop();

    let metrics = mac.metrics();
    assert_eq!(metrics.dl_tx, 1);
    assert_eq!(metrics.dl_retx, 3);
    assert_eq!(metrics.dl_ack, 0);
    assert!(metrics.dl_nack >= 4);

    let json = serde_json::to_value(&metrics).unwrap();
    assert_eq!(json["dl_dropped"], 1);
    let phy_json = serde_json::to_value(phy.get_metrics()).unwrap();
    assert!(phy_json["ues"][0]["dl_n_samples"].as_u64().unwrap() >= 4);
}
