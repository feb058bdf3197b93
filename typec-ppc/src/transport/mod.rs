//! Bus implementations for the [`crate::hw_trait::I2c`] trait.
//!
//! Real buses belong to the board integration layer. This module carries
//! the simulated controller used for tests and for running the driver
//! without hardware.

pub mod sim;
