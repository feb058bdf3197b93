//! Per-port state.
//!
//! Each Type-C port owns its bus handle behind an async mutex, which
//! serializes every register sequence on that port, and a snapshot of its
//! state behind a read/write lock so queries never wait on bus traffic.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, Mutex};
use tracing::trace;

use crate::config::PortConfig;
use crate::error::{Error, Result};
use crate::hw_trait::I2c;
use crate::peripheral::nx20p348x::{
    CurrentLimit, OvpThreshold, RegisterMap, INTERRUPTS_ALL_ENABLED, INTERRUPTS_ALL_MASKED,
};
use crate::ppc::types::{Faults, Mode, Polarity};
use crate::ppc::PortEvent;

/// Overcurrent events after which a port refuses to source until the
/// counter is cleared, usually on disconnect.
pub const OVERCURRENT_EVENT_THRESHOLD: u32 = 3;

/// Point-in-time view of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub mode: Mode,
    pub sourcing_vbus: bool,
    pub sinking_vbus: bool,
    pub vconn_enabled: bool,
    pub polarity: Polarity,
    /// Latched until acknowledged
    pub faults: Faults,
    pub current_limit: Option<CurrentLimit>,
    pub ovp_threshold: Option<OvpThreshold>,
    pub overcurrent_events: u32,
    pub frs_enabled: bool,
    pub vbus_discharge: bool,
}

impl Default for PortStatus {
    /// State of a freshly powered chip.
    fn default() -> Self {
        Self {
            mode: Mode::DeadBattery,
            sourcing_vbus: false,
            sinking_vbus: true,
            vconn_enabled: false,
            polarity: Polarity::default(),
            faults: Faults::empty(),
            current_limit: None,
            ovp_threshold: None,
            overcurrent_events: 0,
            frs_enabled: false,
            vbus_discharge: false,
        }
    }
}

impl PortStatus {
    /// Set the mode together with the enable flags it implies.
    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.sourcing_vbus = mode.is_source();
        self.sinking_vbus = mode.is_sink();
    }

    pub fn is_latched_off(&self) -> bool {
        self.overcurrent_events >= OVERCURRENT_EVENT_THRESHOLD
    }
}

/// Bus access for one controller. Only reachable through the port mutex.
pub(crate) struct PortIo<I2C> {
    i2c: I2C,
    address: u8,
    port: usize,
    pub(crate) map: &'static RegisterMap,
}

impl<I2C: I2c> PortIo<I2C> {
    pub(crate) async fn read(&mut self, register: u8) -> Result<u8> {
        let value = self
            .i2c
            .read_register(self.address, register)
            .await
            .map_err(Error::bus(self.port))?;
        trace!(port = self.port, "read 0x{:02X} = 0x{:02X}", register, value);
        Ok(value)
    }

    pub(crate) async fn write(&mut self, register: u8, value: u8) -> Result<()> {
        trace!(port = self.port, "write 0x{:02X} <- 0x{:02X}", register, value);
        self.i2c
            .write_register(self.address, register, value)
            .await
            .map_err(Error::bus(self.port))
    }

    /// Read-modify-write: clear `mask`, then set `bits & mask`.
    pub(crate) async fn update(&mut self, register: u8, mask: u8, bits: u8) -> Result<u8> {
        let old = self.read(register).await?;
        let new = (old & !mask) | (bits & mask);
        if new != old {
            self.write(register, new).await?;
        }
        Ok(new)
    }

    pub(crate) async fn mask_interrupts(&mut self) -> Result<()> {
        let map = self.map;
        self.write(map.interrupt1_mask, INTERRUPTS_ALL_MASKED).await?;
        self.write(map.interrupt2_mask, INTERRUPTS_ALL_MASKED).await
    }

    pub(crate) async fn unmask_interrupts(&mut self) -> Result<()> {
        let map = self.map;
        self.write(map.interrupt1_mask, INTERRUPTS_ALL_ENABLED).await?;
        self.write(map.interrupt2_mask, INTERRUPTS_ALL_ENABLED).await
    }
}

/// One physical Type-C port.
pub(crate) struct Port<I2C> {
    pub(crate) index: usize,
    pub(crate) config: PortConfig,
    pub(crate) io: Mutex<PortIo<I2C>>,
    status: RwLock<PortStatus>,
    /// Interrupt handlers waiting for `io`
    pending_interrupts: AtomicUsize,
    events: broadcast::Sender<PortEvent>,
}

impl<I2C: I2c> Port<I2C> {
    pub(crate) fn new(
        index: usize,
        config: PortConfig,
        map: &'static RegisterMap,
        i2c: I2C,
        events: broadcast::Sender<PortEvent>,
    ) -> Self {
        let io = PortIo {
            i2c,
            address: config.device_address(),
            port: index,
            map,
        };
        Self {
            index,
            config,
            io: Mutex::new(io),
            status: RwLock::new(PortStatus::default()),
            pending_interrupts: AtomicUsize::new(0),
            events,
        }
    }

    /// Publish `event` to subscribers, if there are any.
    pub(crate) fn publish(&self, event: PortEvent) {
        trace!(port = self.index, "port event: {:?}", event);
        if self.events.send(event).is_err() {
            trace!(port = self.index, "no port event subscribers");
        }
    }

    pub(crate) fn status(&self) -> PortStatus {
        self.status.read().clone()
    }

    /// Apply `f` to the snapshot under one write lock, so readers see either
    /// all of the change or none of it.
    pub(crate) fn update_status<R>(&self, f: impl FnOnce(&mut PortStatus) -> R) -> R {
        let mut status = self.status.write();
        f(&mut status)
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        self.pending_interrupts.load(Ordering::SeqCst) > 0
    }

    /// Lock the port for an interrupt, flagging any in-flight transition to
    /// give way first.
    pub(crate) async fn lock_for_interrupt(&self) -> tokio::sync::MutexGuard<'_, PortIo<I2C>> {
        self.pending_interrupts.fetch_add(1, Ordering::SeqCst);
        let io = self.io.lock().await;
        self.pending_interrupts.fetch_sub(1, Ordering::SeqCst);
        io
    }
}
