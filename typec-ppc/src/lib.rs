//! Driver for USB Type-C power path controllers.
//!
//! A power path controller switches VBUS between the connector and the
//! system's sink and source rails and protects those paths against
//! over-voltage, over-current, short circuit and reverse current. This crate
//! drives the NX20P348x family over I2C for any number of independent
//! ports; see [`ppc::PpcDriver`] for the interface used by the
//! power-delivery control loop.

pub mod config;
pub mod error;
pub mod hw_trait;
pub mod peripheral;
pub mod ppc;
pub mod tracing;
pub mod transport;
