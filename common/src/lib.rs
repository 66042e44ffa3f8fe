//! Common Utilities and Types Library
//!
//! This crate provides shared types and utilities used across the PHY pipeline.

pub mod types;
pub mod utils;

// Re-export commonly used items
pub use types::*;
pub use utils::*;

use thiserror::Error;

/// Errors raised while interpreting common values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommonError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}
