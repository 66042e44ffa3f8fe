//! ZMQ RF Driver for IQ Sample Exchange
//!
//! This module implements the ZMQ-based RF driver for exchanging IQ samples
//! with srsUE and other compatible software radios. Every radio channel has its
//! own socket pair: a REP socket that answers transmit requests from the peer and
//! a REQ socket that requests receive samples from the peer.

use crate::radio::{RadioInterface, RfBufferSet, RfTimestamp};
use crate::InterfaceError;
use num_complex::Complex32;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use zmq::{Context, Socket};

/// Default sample rate (100 PRB LTE carrier)
pub const DEFAULT_SAMPLE_RATE: f64 = 30.72e6;

/// Default ZMQ ports for channel 0
pub const DEFAULT_TX_PORT: u16 = 2000;
pub const DEFAULT_RX_PORT: u16 = 2001;

/// Port stride between consecutive channels
const CHANNEL_PORT_STRIDE: u16 = 100;

/// ZMQ RF configuration
#[derive(Debug, Clone)]
pub struct ZmqRadioConfig {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Number of channels (carriers x ports)
    pub num_channels: usize,
    /// TX binding address per channel
    pub tx_addresses: Vec<String>,
    /// RX connection address per channel
    pub rx_addresses: Vec<String>,
    /// Socket timeout in milliseconds
    pub timeout_ms: i32,
}

impl ZmqRadioConfig {
    /// Default configuration for `num_channels` channels
    pub fn new(num_channels: usize) -> Self {
        let tx_addresses = (0..num_channels)
            .map(|ch| format!("tcp://*:{}", DEFAULT_TX_PORT + CHANNEL_PORT_STRIDE * ch as u16))
            .collect();
        let rx_addresses = (0..num_channels)
            .map(|ch| format!("tcp://localhost:{}", DEFAULT_RX_PORT + CHANNEL_PORT_STRIDE * ch as u16))
            .collect();

        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            num_channels,
            tx_addresses,
            rx_addresses,
            timeout_ms: 100,
        }
    }

    /// Parse device arguments in srsRAN format
    /// Format: "key1=value1,key2=value2,..."
    /// Supports indexed port names: tx_port0, rx_port0, tx_port1, rx_port1, etc.
    pub fn from_device_args(args: &str, num_channels: usize) -> Result<Self, InterfaceError> {
        let mut config = Self::new(num_channels);

        for pair in args.split(',') {
            let parts: Vec<&str> = pair.trim().split('=').collect();
            if parts.len() != 2 {
                continue;
            }

            let key = parts[0].trim();
            let value = parts[1].trim();

            match key {
                "base_srate" => {
                    config.sample_rate = value
                        .parse::<f64>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid base_srate".to_string()))?;
                }
                "timeout_ms" => {
                    config.timeout_ms = value
                        .parse::<i32>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid timeout_ms".to_string()))?;
                }
                _ => {
                    if let Some(index) = key.strip_prefix("tx_port") {
                        let channel = parse_channel_index(index, num_channels)?;
                        config.tx_addresses[channel] = value.to_string();
                    } else if let Some(index) = key.strip_prefix("rx_port") {
                        let channel = parse_channel_index(index, num_channels)?;
                        config.rx_addresses[channel] = value.to_string();
                    } else {
                        debug!("Ignoring unknown ZMQ device argument '{}'", key);
                    }
                }
            }
        }

        Ok(config)
    }
}

fn parse_channel_index(index: &str, num_channels: usize) -> Result<usize, InterfaceError> {
    let channel = if index.is_empty() {
        0
    } else {
        index
            .parse::<usize>()
            .map_err(|_| InterfaceError::InvalidConfig(format!("Invalid port index '{}'", index)))?
    };

    if channel >= num_channels {
        return Err(InterfaceError::InvalidConfig(format!(
            "Port index {} exceeds {} channels",
            channel, num_channels
        )));
    }
    Ok(channel)
}

/// TX/RX statistics
#[derive(Debug, Default, Clone)]
pub struct RfStats {
    pub tx_samples: u64,
    pub rx_samples: u64,
    pub tx_underruns: u64,
    pub rx_overruns: u64,
    pub tx_late_packets: u64,
}

/// State for TX socket handling
#[derive(Debug, Clone, Copy, PartialEq)]
enum TxState {
    WaitingForRequest,
    RequestReceived,
}

/// Socket pair and stream state of one radio channel
struct ZmqChannel {
    tx_socket: Socket,
    rx_socket: Socket,
    tx_state: TxState,
    /// Stream position after the last sample sent on this channel
    tx_position: u64,
    rx_request_pending: bool,
    /// Received samples not yet consumed by `rx_now`
    rx_backlog: Vec<Complex32>,
}

/// Convert samples to raw bytes (srsRAN format: little-endian cf_t)
fn samples_to_bytes(samples: &[Complex32], bytes: &mut Vec<u8>) {
    bytes.reserve(samples.len() * 8);
    for sample in samples {
        bytes.extend_from_slice(&sample.re.to_le_bytes());
        bytes.extend_from_slice(&sample.im.to_le_bytes());
    }
}

/// Convert raw bytes (srsRAN format) to samples
fn bytes_to_samples(bytes: &[u8], out: &mut Vec<Complex32>) -> Result<(), InterfaceError> {
    if bytes.len() % 8 != 0 {
        return Err(InterfaceError::InvalidMessage);
    }

    out.reserve(bytes.len() / 8);
    for chunk in bytes.chunks_exact(8) {
        let re = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let im = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
        out.push(Complex32::new(re, im));
    }
    Ok(())
}

/// Stream positions shared by all channels
struct StreamState {
    rx_timestamp: u64,
    /// Furthest position reached by any channel
    tx_timestamp: u64,
    stats: RfStats,
}

/// ZMQ radio driver
pub struct ZmqRadio {
    config: ZmqRadioConfig,
    _context: Context,
    channels: Vec<Mutex<ZmqChannel>>,
    stream: Mutex<StreamState>,
}

impl ZmqRadio {
    /// Create the driver, binding TX sockets and connecting RX sockets
    pub fn new(config: ZmqRadioConfig) -> Result<Self, InterfaceError> {
        if config.tx_addresses.len() != config.num_channels || config.rx_addresses.len() != config.num_channels {
            return Err(InterfaceError::InvalidConfig(
                "address list length does not match channel count".to_string(),
            ));
        }

        info!("Initializing ZMQ RF driver");
        info!("Sample rate: {} MHz", config.sample_rate / 1e6);
        info!("Channels: {}", config.num_channels);

        let context = Context::new();
        let mut channels = Vec::with_capacity(config.num_channels);

        for ch in 0..config.num_channels {
            // TX uses REP and binds (waits for requests from UE)
            let tx_socket = context.socket(zmq::REP)?;
            tx_socket.bind(&config.tx_addresses[ch])?;
            tx_socket.set_rcvtimeo(config.timeout_ms)?;
            tx_socket.set_sndtimeo(config.timeout_ms)?;
            info!("Channel {}: TX socket bound to {} (REP)", ch, config.tx_addresses[ch]);

            // RX uses REQ and connects (sends requests to UE)
            let rx_socket = context.socket(zmq::REQ)?;
            rx_socket.connect(&config.rx_addresses[ch])?;
            rx_socket.set_rcvtimeo(config.timeout_ms)?;
            rx_socket.set_sndtimeo(config.timeout_ms)?;
            info!("Channel {}: RX socket connected to {} (REQ)", ch, config.rx_addresses[ch]);

            channels.push(Mutex::new(ZmqChannel {
                tx_socket,
                rx_socket,
                tx_state: TxState::WaitingForRequest,
                tx_position: 0,
                rx_request_pending: false,
                rx_backlog: Vec::new(),
            }));
        }

        Ok(Self {
            config,
            _context: context,
            channels,
            stream: Mutex::new(StreamState {
                rx_timestamp: 0,
                tx_timestamp: 0,
                stats: RfStats::default(),
            }),
        })
    }

    /// Get a snapshot of the driver statistics
    pub fn stats(&self) -> RfStats {
        self.stream.lock().stats.clone()
    }

    /// Fill `out` from the peer, keeping surplus samples for the next call
    fn receive_channel(&self, channel: &mut ZmqChannel, out: &mut [Complex32]) -> Result<(), InterfaceError> {
        let mut filled = 0;

        while filled < out.len() {
            if !channel.rx_backlog.is_empty() {
                let take = channel.rx_backlog.len().min(out.len() - filled);
                out[filled..filled + take].copy_from_slice(&channel.rx_backlog[..take]);
                channel.rx_backlog.drain(..take);
                filled += take;
                continue;
            }

            if !channel.rx_request_pending {
                channel.rx_socket.send(&[0u8][..], 0).map_err(|e| match e {
                    zmq::Error::EAGAIN => InterfaceError::Timeout,
                    other => InterfaceError::ZmqError(other),
                })?;
                channel.rx_request_pending = true;
            }

            match channel.rx_socket.recv_bytes(0) {
                Ok(bytes) => {
                    channel.rx_request_pending = false;
                    bytes_to_samples(&bytes, &mut channel.rx_backlog)?;
                    trace!("RX: received {} samples", bytes.len() / 8);
                }
                Err(zmq::Error::EAGAIN) => return Err(InterfaceError::Timeout),
                Err(e) => return Err(InterfaceError::ZmqError(e)),
            }
        }

        Ok(())
    }

    /// Answer one peer request with `bytes`
    fn transmit_channel(&self, channel: &mut ZmqChannel, bytes: &[u8]) -> Result<(), InterfaceError> {
        if channel.tx_state == TxState::WaitingForRequest {
            let mut dummy = [0u8; 1];
            match channel.tx_socket.recv_into(&mut dummy, 0) {
                Ok(_) => channel.tx_state = TxState::RequestReceived,
                Err(zmq::Error::EAGAIN) => return Err(InterfaceError::Timeout),
                Err(e) => return Err(InterfaceError::ZmqError(e)),
            }
        }

        channel.tx_socket.send(bytes, 0)?;
        channel.tx_state = TxState::WaitingForRequest;
        Ok(())
    }
}

impl RadioInterface for ZmqRadio {
    fn rx_now(&self, buffers: &mut RfBufferSet, timestamp: &mut RfTimestamp) -> Result<(), InterfaceError> {
        if buffers.nof_channels() != self.channels.len() {
            return Err(InterfaceError::InvalidConfig(format!(
                "buffer set has {} channels, radio has {}",
                buffers.nof_channels(),
                self.channels.len()
            )));
        }

        let start = self.stream.lock().rx_timestamp;
        let nof_samples = buffers.nof_samples() as u64;

        for (ch, channel) in self.channels.iter().enumerate() {
            let mut channel = channel.lock();
            if let Err(e) = self.receive_channel(&mut channel, buffers.channel_mut(ch)) {
                let mut stream = self.stream.lock();
                // The tick is lost either way, keep the stream position aligned
                stream.rx_timestamp += nof_samples;
                stream.stats.rx_overruns += 1;
                return match e {
                    InterfaceError::Timeout => Err(InterfaceError::Overflow(start)),
                    other => Err(other),
                };
            }
        }

        let mut stream = self.stream.lock();
        stream.rx_timestamp = start + nof_samples;
        stream.stats.rx_samples += nof_samples;
        *timestamp = RfTimestamp(start);
        Ok(())
    }

    fn tx(&self, buffers: &RfBufferSet, timestamp: RfTimestamp) -> Result<(), InterfaceError> {
        let current = self.stream.lock().tx_timestamp;
        if timestamp.0 < current {
            let mut stream = self.stream.lock();
            stream.stats.tx_late_packets += 1;
            return Err(InterfaceError::Late {
                requested: timestamp.0,
                current,
            });
        }

        // ZMQ carries no timestamps: each channel fills the gap up to the requested time with zeros
        let nof_samples = buffers.nof_samples() as u64;
        let mut nof_sent = 0u64;
        let mut failure = None;

        for (ch, channel) in self.channels.iter().enumerate() {
            let mut channel = channel.lock();
            let gap = timestamp.0.saturating_sub(channel.tx_position) as usize;
            if gap > 0 {
                debug!("TX: channel {} inserting {} zero samples before timestamp {}", ch, gap, timestamp);
            }
            let mut bytes = Vec::with_capacity((gap + buffers.nof_samples()) * 8);
            bytes.resize(gap * 8, 0);
            samples_to_bytes(buffers.channel(ch), &mut bytes);

            if let Err(e) = self.transmit_channel(&mut channel, &bytes) {
                warn!("TX: channel {} failed at timestamp {}: {}", ch, timestamp, e);
                failure = Some(e);
                break;
            }
            channel.tx_position = timestamp.0 + nof_samples;
            nof_sent += gap as u64 + nof_samples;
        }

        let mut stream = self.stream.lock();
        stream.stats.tx_samples += nof_sent;
        // channels that already sent moved on, the others catch up with zeros next time
        if nof_sent > 0 {
            stream.tx_timestamp = timestamp.0 + nof_samples;
        }
        match failure {
            None => Ok(()),
            Some(e) => {
                stream.stats.tx_underruns += 1;
                match e {
                    InterfaceError::Timeout => Err(InterfaceError::Underflow(timestamp.0)),
                    other => Err(other),
                }
            }
        }
    }

    fn nof_channels(&self) -> usize {
        self.channels.len()
    }

    fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_args_parsing() {
        let config = ZmqRadioConfig::from_device_args(
            "tx_port0=tcp://*:3000,rx_port0=tcp://localhost:3001,tx_port1=tcp://*:3100,base_srate=23.04e6",
            2,
        )
        .unwrap();

        assert_eq!(config.tx_addresses[0], "tcp://*:3000");
        assert_eq!(config.rx_addresses[0], "tcp://localhost:3001");
        assert_eq!(config.tx_addresses[1], "tcp://*:3100");
        assert_eq!(config.rx_addresses[1], "tcp://localhost:2101");
        assert!((config.sample_rate - 23.04e6).abs() < 1.0);
    }

    #[test]
    fn test_device_args_rejects_bad_index() {
        assert!(ZmqRadioConfig::from_device_args("tx_port3=tcp://*:1", 2).is_err());
        assert!(ZmqRadioConfig::from_device_args("base_srate=fast", 1).is_err());
    }

    #[test]
    fn test_failed_channel_catches_up() {
        let config = ZmqRadioConfig {
            sample_rate: 1.92e6,
            num_channels: 2,
            tx_addresses: vec!["tcp://127.0.0.1:47310".to_string(), "tcp://127.0.0.1:47311".to_string()],
            rx_addresses: vec!["tcp://127.0.0.1:47312".to_string(), "tcp://127.0.0.1:47313".to_string()],
            timeout_ms: 500,
        };
        let radio = ZmqRadio::new(config).unwrap();

        let peer_context = Context::new();
        let peer = |port: u16| {
            let socket = peer_context.socket(zmq::REQ).unwrap();
            socket.set_rcvtimeo(2000).unwrap();
            socket.connect(&format!("tcp://127.0.0.1:{}", port)).unwrap();
            socket
        };

        // only channel 0 has a peer asking for samples
        let peer0 = peer(47310);
        peer0.send(&[0u8][..], 0).unwrap();
        let buffers = RfBufferSet::new(2, 1, 16);
        assert!(matches!(
            radio.tx(&buffers, RfTimestamp(0)),
            Err(InterfaceError::Underflow(0))
        ));
        assert_eq!(peer0.recv_bytes(0).unwrap().len(), 16 * 8);
        assert_eq!(radio.stats().tx_underruns, 1);
        assert!(matches!(radio.tx(&buffers, RfTimestamp(0)), Err(InterfaceError::Late { .. })));

        let peer1 = peer(47311);
        peer0.send(&[0u8][..], 0).unwrap();
        peer1.send(&[0u8][..], 0).unwrap();
        radio.tx(&buffers, RfTimestamp(16)).unwrap();
        assert_eq!(peer0.recv_bytes(0).unwrap().len(), 16 * 8);
        // the missed tick is replaced by zeros
        assert_eq!(peer1.recv_bytes(0).unwrap().len(), 32 * 8);
        assert_eq!(radio.stats().tx_samples, 48);
    }

    #[test]
    fn test_sample_byte_conversion() {
        let samples = vec![Complex32::new(1.5, -2.0), Complex32::new(0.0, 0.25)];
        let mut bytes = Vec::new();
        samples_to_bytes(&samples, &mut bytes);
        assert_eq!(bytes.len(), 16);

        let mut decoded = Vec::new();
        bytes_to_samples(&bytes, &mut decoded).unwrap();
        assert_eq!(decoded, samples);

        assert!(bytes_to_samples(&bytes[..7], &mut decoded).is_err());
    }
}
