//! Hardware abstraction layer traits.
//!
//! Drivers in this crate talk to their chips through the [`I2c`] trait so
//! that board integration can hand in whatever bus implementation it has:
//! a Linux i2c-dev node, a tunnel through a management controller, or the
//! in-memory model in [`crate::transport::sim`].

use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single bus transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum I2cError {
    #[error("no acknowledge from device 0x{0:02X}")]
    Nack(u8),
    #[error("bus arbitration lost")]
    ArbitrationLost,
    #[error("bus transaction timed out")]
    Timeout,
    #[error("bus error: {0}")]
    Other(String),
}

/// Register-level access to devices on one I2C bus.
///
/// Each call is a complete bus transaction. Callers never pipeline: a
/// transaction is awaited to completion before the next one is issued.
#[async_trait]
pub trait I2c: Send {
    /// Write `data` to the device at 7-bit `address`.
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), I2cError>;

    /// Write `bytes`, then read `buffer.len()` bytes back with a repeated start.
    async fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), I2cError>;

    /// Read one 8-bit register.
    async fn read_register(&mut self, address: u8, register: u8) -> Result<u8, I2cError> {
        let mut data = [0u8; 1];
        self.write_read(address, &[register], &mut data).await?;
        Ok(data[0])
    }

    /// Write one 8-bit register.
    async fn write_register(
        &mut self,
        address: u8,
        register: u8,
        value: u8,
    ) -> Result<(), I2cError> {
        self.write(address, &[register, value]).await
    }
}
