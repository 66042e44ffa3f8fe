//! Radio Collaborator Interfaces Library
//!
//! This crate provides the radio abstraction consumed by the PHY Tx/Rx thread:
//! per-tick sample buffer sets, the ZMQ IQ driver for srsRAN-compatible peers and
//! a synthetic loopback radio.

pub mod loopback;
pub mod radio;
pub mod zmq_rf;

pub use loopback::{LoopbackConfig, LoopbackRadio, TxRecord};
pub use radio::{RadioEventHandler, RadioInterface, RfBufferSet, RfTimestamp};
pub use zmq_rf::{RfStats, ZmqRadio, ZmqRadioConfig};

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("ZMQ error: {0}")]
    ZmqError(#[from] zmq::Error),

    #[error("Invalid message format")]
    InvalidMessage,

    #[error("Interface not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Receive overflow: samples lost at timestamp {0}")]
    Overflow(u64),

    #[error("Transmit underflow at timestamp {0}")]
    Underflow(u64),

    #[error("Late transmission: timestamp {requested} behind stream position {current}")]
    Late { requested: u64, current: u64 },

    #[error("Operation timed out")]
    Timeout,
}
