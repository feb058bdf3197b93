//! Common error types for typec-ppc.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

use crate::hw_trait::I2cError;
use crate::peripheral::nx20p348x::CodecError;
use crate::ppc::types::{Faults, Mode};

/// Main error type for typec-ppc operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bus transaction failed; no state was changed by the failed step
    #[error("communication error on port {port}: {source}")]
    Communication {
        port: usize,
        #[source]
        source: I2cError,
    },

    /// Out-of-range limit, level or board parameter, rejected before any write
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The chip did not confirm the requested mode within the retry budget
    #[error("port {port}: transition to {target} timed out")]
    TransitionTimeout { port: usize, target: Mode },

    /// An interrupt arrived while a transition was waiting for confirmation
    #[error("port {port}: transition to {target} aborted by pending interrupt")]
    TransitionAborted { port: usize, target: Mode },

    /// A protective fault is latched and must be acknowledged first
    #[error("port {port}: faults pending ({faults})")]
    FaultPending { port: usize, faults: Faults },

    /// The transition cannot be requested by software
    #[error("port {port}: cannot transition from {from} to {to}")]
    InvalidTransition { port: usize, from: Mode, to: Mode },

    /// The chip reported that it could not leave dead-battery mode
    #[error("port {port}: dead battery exit error")]
    DeadBatteryExitError { port: usize },

    /// Register contents that the codec refuses to interpret
    #[error("port {port}: {source}")]
    Codec {
        port: usize,
        #[source]
        source: CodecError,
    },

    /// Feature absent on this chip variant
    #[error("{feature} not supported by {chip}")]
    NotSupported {
        feature: &'static str,
        chip: &'static str,
    },

    /// DEVICE_ID does not match the register map in use
    #[error("port {port}: device id 0x{found:02X}, expected 0x{expected:02X}")]
    UnexpectedDeviceId { port: usize, expected: u8, found: u8 },

    /// Port index outside the configured table
    #[error("no such port: {0}")]
    InvalidPort(usize),

    /// I/O errors while loading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file parse errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Communication error constructor for `map_err`.
    pub(crate) fn bus(port: usize) -> impl FnOnce(I2cError) -> Error {
        move |source| Error::Communication { port, source }
    }

    /// Codec error constructor for `map_err`.
    pub(crate) fn codec(port: usize) -> impl FnOnce(CodecError) -> Error {
        move |source| Error::Codec { port, source }
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
