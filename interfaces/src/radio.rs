//! Radio Collaborator Interface
//!
//! Blocking, sample-accurate receive/transmit of one tick worth of baseband
//! samples for every carrier and antenna port.

use crate::InterfaceError;
use num_complex::Complex32;
use std::fmt;

/// Sample-accurate timestamp: number of samples since the radio started streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RfTimestamp(pub u64);

impl RfTimestamp {
    /// Timestamp `nof_samples` later
    pub fn add_samples(self, nof_samples: u64) -> Self {
        Self(self.0 + nof_samples)
    }

    /// Timestamp in seconds for a given sample rate
    pub fn as_secs(&self, sample_rate: f64) -> f64 {
        self.0 as f64 / sample_rate
    }
}

impl fmt::Display for RfTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tick of baseband samples for every (carrier, port) channel
///
/// Channels are laid out carrier-major: channel `cc * nof_ports + port`.
#[derive(Clone)]
pub struct RfBufferSet {
    nof_carriers: usize,
    nof_ports: usize,
    nof_samples: usize,
    buffers: Vec<Vec<Complex32>>,
}

impl RfBufferSet {
    /// Allocate zeroed buffers
    pub fn new(nof_carriers: usize, nof_ports: usize, nof_samples: usize) -> Self {
        let buffers = (0..nof_carriers * nof_ports)
            .map(|_| vec![Complex32::new(0.0, 0.0); nof_samples])
            .collect();

        Self {
            nof_carriers,
            nof_ports,
            nof_samples,
            buffers,
        }
    }

    /// Number of component carriers
    pub fn nof_carriers(&self) -> usize {
        self.nof_carriers
    }

    /// Number of antenna ports per carrier
    pub fn nof_ports(&self) -> usize {
        self.nof_ports
    }

    /// Samples per channel
    pub fn nof_samples(&self) -> usize {
        self.nof_samples
    }

    /// Total number of radio channels
    pub fn nof_channels(&self) -> usize {
        self.buffers.len()
    }

    /// Samples of one carrier/port
    pub fn get(&self, cc: usize, port: usize) -> &[Complex32] {
        &self.buffers[cc * self.nof_ports + port]
    }

    /// Mutable samples of one carrier/port
    pub fn get_mut(&mut self, cc: usize, port: usize) -> &mut [Complex32] {
        &mut self.buffers[cc * self.nof_ports + port]
    }

    /// Samples of a flat radio channel index
    pub fn channel(&self, channel: usize) -> &[Complex32] {
        &self.buffers[channel]
    }

    /// Mutable samples of a flat radio channel index
    pub fn channel_mut(&mut self, channel: usize) -> &mut [Complex32] {
        &mut self.buffers[channel]
    }

    /// Replace one channel with externally produced samples (length must match)
    pub fn set_channel(&mut self, channel: usize, samples: Vec<Complex32>) -> Result<(), InterfaceError> {
        if samples.len() != self.nof_samples || channel >= self.buffers.len() {
            return Err(InterfaceError::InvalidConfig(format!(
                "channel {} expects {} samples, got {}",
                channel,
                self.nof_samples,
                samples.len()
            )));
        }
        self.buffers[channel] = samples;
        Ok(())
    }

    /// Zero every channel
    pub fn zero(&mut self) {
        for buffer in &mut self.buffers {
            buffer.fill(Complex32::new(0.0, 0.0));
        }
    }

    /// Average power over all channels
    pub fn average_power(&self) -> f32 {
        let total: usize = self.buffers.iter().map(|b| b.len()).sum();
        if total == 0 {
            return 0.0;
        }
        let energy: f32 = self
            .buffers
            .iter()
            .flat_map(|b| b.iter())
            .map(|s| s.norm_sqr())
            .sum();
        energy / total as f32
    }
}

impl fmt::Debug for RfBufferSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RfBufferSet")
            .field("nof_carriers", &self.nof_carriers)
            .field("nof_ports", &self.nof_ports)
            .field("nof_samples", &self.nof_samples)
            .finish()
    }
}

/// Radio device consumed by the PHY Tx/Rx thread
pub trait RadioInterface: Send + Sync {
    /// Block until one buffer set worth of samples has been received.
    /// On return `timestamp` holds the time of the first sample.
    fn rx_now(&self, buffers: &mut RfBufferSet, timestamp: &mut RfTimestamp) -> Result<(), InterfaceError>;

    /// Transmit a buffer set starting at `timestamp`
    fn tx(&self, buffers: &RfBufferSet, timestamp: RfTimestamp) -> Result<(), InterfaceError>;

    /// Number of radio channels (carriers x ports)
    fn nof_channels(&self) -> usize;

    /// Sample rate in Hz
    fn sample_rate(&self) -> f64;
}

/// Sink for asynchronous radio events
pub trait RadioEventHandler: Send + Sync {
    /// Receive samples were lost
    fn radio_overflow(&self);

    /// Transmit stream ran dry
    fn radio_underflow(&self);

    /// A transmission arrived after its timestamp
    fn radio_late(&self);

    /// Unrecoverable device error
    fn radio_failure(&self);
}
