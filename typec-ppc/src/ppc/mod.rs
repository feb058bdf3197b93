//! Type-C power path controller driver.
//!
//! [`PpcDriver`] is the interface the power-delivery control loop and the
//! charge manager use. [`Ppc`] implements it for the NX20P348x family on
//! top of any [`crate::hw_trait::I2c`] bus; the register layout comes from
//! the variant's [`crate::peripheral::nx20p348x::RegisterMap`].

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::peripheral::nx20p348x::{CurrentLimit, OvpThreshold};

pub mod driver;
pub mod fault;
mod mode;
pub mod port;
pub mod task;
pub mod types;

pub use driver::{Ppc, PortSetup, RegisterDump};
pub use fault::FaultReport;
pub use port::{PortStatus, OVERCURRENT_EVENT_THRESHOLD};
pub use types::{FaultEvent, FaultKind, Faults, Mode, Polarity, PowerPath};

/// Change notifications for the charge manager. One-way: receivers never
/// call back into the driver from the notification path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    ModeChanged {
        port: usize,
        mode: Mode,
    },
    Fault {
        port: usize,
        mode: Mode,
        observed: Faults,
        latched: Faults,
        shutdown: bool,
    },
}

/// Operations on a set of Type-C power path controllers, by port index.
#[async_trait]
pub trait PpcDriver: Send + Sync {
    /// Number of configured ports.
    fn port_count(&self) -> usize;

    /// Bring the controller on `port` under firmware control.
    async fn initialize(&self, port: usize) -> Result<()>;

    async fn set_mode(&self, port: usize, mode: Mode) -> Result<()>;

    /// Set the 5V source current limit by step index (0 = 0.4 A, 15 = 3.4 A).
    async fn set_current_limit(&self, port: usize, step: u8) -> Result<CurrentLimit>;

    /// Set the HV over-voltage lockout by level index (0 = 6.0 V, 6 = 23.0 V).
    async fn set_ovp_threshold(&self, port: usize, level: u8) -> Result<OvpThreshold>;

    async fn enable_vconn(&self, port: usize, enable: bool) -> Result<()>;

    async fn set_polarity(&self, port: usize, polarity: Polarity) -> Result<()>;

    async fn discharge_vbus(&self, port: usize, enable: bool) -> Result<()>;

    async fn set_frs_enable(&self, port: usize, enable: bool) -> Result<()>;

    /// Service an interrupt from the controller on `port`.
    async fn handle_interrupt(&self, port: usize) -> Result<Option<FaultReport>>;

    /// Clear latched faults and re-arm interrupts.
    async fn acknowledge_faults(&self, port: usize) -> Result<Faults>;

    /// Reset the overcurrent event counter, typically on disconnect.
    async fn clear_overcurrent_events(&self, port: usize) -> Result<()>;

    async fn dump_registers(&self, port: usize) -> Result<Vec<RegisterDump>>;

    fn is_sourcing_vbus(&self, port: usize) -> Result<bool>;

    fn is_sinking_vbus(&self, port: usize) -> Result<bool>;

    fn is_vconn_enabled(&self, port: usize) -> Result<bool>;

    fn current_mode(&self, port: usize) -> Result<Mode>;

    fn latched_faults(&self, port: usize) -> Result<Faults>;

    fn is_latched_off(&self, port: usize) -> Result<bool>;

    fn status(&self, port: usize) -> Result<PortStatus>;

    fn subscribe(&self) -> broadcast::Receiver<PortEvent>;
}
