//! Loopback Radio
//!
//! Synthetic radio used for offline runs and tests. Receive buffers are filled with
//! noise (or samples injected for a given timestamp) and transmissions are recorded
//! so that callers can inspect what the PHY sent. With `realtime` enabled the
//! radio paces `rx_now` to the nominal sample rate.

use crate::radio::{RadioInterface, RfBufferSet, RfTimestamp};
use crate::InterfaceError;
use num_complex::Complex32;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Loopback radio configuration
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Number of radio channels (carriers x ports)
    pub nof_channels: usize,
    /// Sample rate in Hz, used for pacing
    pub sample_rate: f64,
    /// Sleep so that `rx_now` follows the wall clock
    pub realtime: bool,
    /// Peak amplitude of the uniform receive noise (0 gives silence)
    pub noise_amplitude: f32,
    /// Number of transmissions kept in the capture log
    pub tx_capture: usize,
    /// Keep transmitted samples in the capture log, not just their power
    pub capture_samples: bool,
    /// Seed for the noise generator
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            nof_channels: 1,
            sample_rate: 30.72e6,
            realtime: false,
            noise_amplitude: 0.0,
            tx_capture: 64,
            capture_samples: false,
            seed: 0x5eed,
        }
    }
}

/// One recorded transmission
#[derive(Debug, Clone)]
pub struct TxRecord {
    /// Timestamp requested by the PHY
    pub timestamp: RfTimestamp,
    /// Average power over all channels
    pub power: f32,
    /// Transmitted samples (only when `capture_samples` is set)
    pub buffers: Option<RfBufferSet>,
}

struct LoopbackState {
    rx_timestamp: u64,
    injected: HashMap<u64, Vec<Vec<Complex32>>>,
    overflows: HashSet<u64>,
    tx_log: VecDeque<TxRecord>,
    last_tx: Option<u64>,
    nof_tx: u64,
    nof_late: u64,
    rng: StdRng,
    started: Option<Instant>,
}

/// In-process radio with injectable receive samples and a transmit log
pub struct LoopbackRadio {
    config: LoopbackConfig,
    state: Mutex<LoopbackState>,
}

impl LoopbackRadio {
    /// Create a new loopback radio
    pub fn new(config: LoopbackConfig) -> Self {
        debug!(
            "Loopback radio: {} channels, {} MHz, realtime={}",
            config.nof_channels,
            config.sample_rate / 1e6,
            config.realtime
        );

        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            state: Mutex::new(LoopbackState {
                rx_timestamp: 0,
                injected: HashMap::new(),
                overflows: HashSet::new(),
                tx_log: VecDeque::new(),
                last_tx: None,
                nof_tx: 0,
                nof_late: 0,
                rng,
                started: None,
            }),
        }
    }

    /// Deliver `channels` instead of noise for the receive call starting at `timestamp`
    pub fn inject_rx(&self, timestamp: RfTimestamp, channels: Vec<Vec<Complex32>>) {
        self.state.lock().injected.insert(timestamp.0, channels);
    }

    /// Make the receive call starting at `timestamp` report an overflow
    pub fn inject_overflow(&self, timestamp: RfTimestamp) {
        self.state.lock().overflows.insert(timestamp.0);
    }

    /// Copy of the transmit log
    pub fn transmitted(&self) -> Vec<TxRecord> {
        self.state.lock().tx_log.iter().cloned().collect()
    }

    /// Drain the transmit log
    pub fn take_transmitted(&self) -> Vec<TxRecord> {
        self.state.lock().tx_log.drain(..).collect()
    }

    /// Total number of transmissions and how many of them were late
    pub fn tx_counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.nof_tx, state.nof_late)
    }

    /// Timestamp of the next receive call
    pub fn rx_position(&self) -> RfTimestamp {
        RfTimestamp(self.state.lock().rx_timestamp)
    }
}

impl RadioInterface for LoopbackRadio {
    fn rx_now(&self, buffers: &mut RfBufferSet, timestamp: &mut RfTimestamp) -> Result<(), InterfaceError> {
        if buffers.nof_channels() != self.config.nof_channels {
            return Err(InterfaceError::InvalidConfig(format!(
                "buffer set has {} channels, radio has {}",
                buffers.nof_channels(),
                self.config.nof_channels
            )));
        }

        let nof_samples = buffers.nof_samples() as u64;
        let (start, deadline) = {
            let mut state = self.state.lock();
            let start = state.rx_timestamp;
            state.rx_timestamp += nof_samples;
            let started = *state.started.get_or_insert_with(Instant::now);
            let deadline = started + Duration::from_secs_f64((start + nof_samples) as f64 / self.config.sample_rate);

            if state.overflows.remove(&start) {
                return Err(InterfaceError::Overflow(start));
            }

            match state.injected.remove(&start) {
                Some(channels) => {
                    for (ch, samples) in channels.into_iter().enumerate().take(buffers.nof_channels()) {
                        buffers.set_channel(ch, samples)?;
                    }
                    trace!("Loopback RX: injected samples at {}", start);
                }
                None if self.config.noise_amplitude > 0.0 => {
                    let amplitude = self.config.noise_amplitude;
                    for ch in 0..buffers.nof_channels() {
                        for sample in buffers.channel_mut(ch) {
                            *sample = Complex32::new(
                                state.rng.gen_range(-amplitude..amplitude),
                                state.rng.gen_range(-amplitude..amplitude),
                            );
                        }
                    }
                }
                None => buffers.zero(),
            }

            (start, deadline)
        };

        if self.config.realtime {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }

        *timestamp = RfTimestamp(start);
        Ok(())
    }

    fn tx(&self, buffers: &RfBufferSet, timestamp: RfTimestamp) -> Result<(), InterfaceError> {
        let mut state = self.state.lock();
        state.nof_tx += 1;

        if let Some(last) = state.last_tx {
            if timestamp.0 <= last {
                state.nof_late += 1;
                return Err(InterfaceError::Late {
                    requested: timestamp.0,
                    current: last,
                });
            }
        }
        state.last_tx = Some(timestamp.0);

        if self.config.tx_capture > 0 {
            if state.tx_log.len() == self.config.tx_capture {
                state.tx_log.pop_front();
            }
            let record = TxRecord {
                timestamp,
                power: buffers.average_power(),
                buffers: self.config.capture_samples.then(|| buffers.clone()),
            };
            state.tx_log.push_back(record);
        }

        Ok(())
    }

    fn nof_channels(&self) -> usize {
        self.config.nof_channels
    }

    fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_timestamps_advance() {
        let radio = LoopbackRadio::new(LoopbackConfig::default());
        let mut buffers = RfBufferSet::new(1, 1, 1920);
        let mut ts = RfTimestamp::default();

        radio.rx_now(&mut buffers, &mut ts).unwrap();
        assert_eq!(ts, RfTimestamp(0));
        radio.rx_now(&mut buffers, &mut ts).unwrap();
        assert_eq!(ts, RfTimestamp(1920));
        assert_eq!(radio.rx_position(), RfTimestamp(3840));
        assert_eq!(buffers.average_power(), 0.0);
    }

    #[test]
    fn test_injected_samples_and_overflow() {
        let radio = LoopbackRadio::new(LoopbackConfig::default());
        let mut buffers = RfBufferSet::new(1, 1, 4);
        let mut ts = RfTimestamp::default();

        radio.inject_rx(RfTimestamp(4), vec![vec![Complex32::new(1.0, 0.0); 4]]);
        radio.inject_overflow(RfTimestamp(8));

        radio.rx_now(&mut buffers, &mut ts).unwrap();
        radio.rx_now(&mut buffers, &mut ts).unwrap();
        assert_eq!(ts, RfTimestamp(4));
        assert!((buffers.average_power() - 1.0).abs() < 1e-6);

        assert!(matches!(radio.rx_now(&mut buffers, &mut ts), Err(InterfaceError::Overflow(8))));
        radio.rx_now(&mut buffers, &mut ts).unwrap();
        assert_eq!(ts, RfTimestamp(12));
    }

    #[test]
    fn test_noise_generation() {
        let config = LoopbackConfig {
            noise_amplitude: 0.1,
            ..Default::default()
        };
        let radio = LoopbackRadio::new(config);
        let mut buffers = RfBufferSet::new(1, 1, 256);
        let mut ts = RfTimestamp::default();
        radio.rx_now(&mut buffers, &mut ts).unwrap();

        let power = buffers.average_power();
        assert!(power > 0.0 && power < 0.02);
    }

    #[test]
    fn test_tx_log_and_late_detection() {
        let config = LoopbackConfig {
            tx_capture: 2,
            ..Default::default()
        };
        let radio = LoopbackRadio::new(config);
        let buffers = RfBufferSet::new(1, 1, 8);

        radio.tx(&buffers, RfTimestamp(100)).unwrap();
        radio.tx(&buffers, RfTimestamp(108)).unwrap();
        radio.tx(&buffers, RfTimestamp(116)).unwrap();
        assert!(radio.tx(&buffers, RfTimestamp(116)).is_err());

        let log = radio.take_transmitted();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].timestamp, RfTimestamp(108));
        assert_eq!(radio.tx_counters(), (4, 1));
        assert!(radio.transmitted().is_empty());
    }
}
