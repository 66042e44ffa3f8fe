//! Protocol Stack Layers Library
//!
//! This crate implements the real-time PHY pipeline of an LTE eNB / NR gNB
//! (channel primitives, carrier and subframe workers, worker pool, Tx/Rx
//! thread, PRACH pool) and the round-robin MAC that drives it.

pub mod mac;
pub mod phy;
pub mod threading;

use common::{CommonError, Rnti};
use interfaces::InterfaceError;
use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Invalid protocol data unit")]
    InvalidPdu,

    #[error("Layer not initialized")]
    NotInitialized,

    #[error("Resource unavailable")]
    ResourceUnavailable,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("RNTI {0} already present")]
    DuplicateRnti(Rnti),

    #[error("RNTI {0} not found")]
    UnknownRnti(Rnti),

    #[error("Worker index {index} out of range (pool of {nof_workers})")]
    WorkerIndex { index: usize, nof_workers: usize },

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Common(#[from] CommonError),
}
