//! In-memory NX20P348x model.
//!
//! [`SimBus`] implements [`I2c`] over a set of simulated controllers keyed by
//! address. The model follows the chip closely enough to exercise the
//! driver: interrupt registers clear on read, a closed switch shows up in
//! SWITCH_STATUS after a configurable number of polls, and dead-battery
//! exit, stuck switches and bus failures can be injected.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::hw_trait::{I2c, I2cError};
use crate::peripheral::nx20p348x::{
    encode_mode, registers, DeviceControl, Interrupt1, Interrupt2, SwitchControl, SwitchStatus,
};
use crate::ppc::types::{Mode, PowerPath};

/// Value returned from DEVICE_ID by the model.
pub const SIM_DEVICE_ID: u8 = 0x09;

/// One simulated controller.
#[derive(Debug, Clone)]
pub struct SimNx20p348x {
    mode: Mode,
    /// Path requested through SWITCH_CONTROL and status polls left before
    /// it reports closed
    closing: Option<(PowerPath, u32)>,
    interrupt1: u8,
    interrupt2: u8,
    registers: [u8; 12],
    writes: Vec<(u8, u8)>,

    /// SWITCH_STATUS reads before a newly closed switch is reported
    pub switch_latency: u32,
    /// Requested switches never close
    pub stuck_switch: bool,
    /// The dead-battery exit bit is ignored
    pub stuck_dead_battery: bool,
    /// Every transaction NACKs
    pub offline: bool,
}

impl Default for SimNx20p348x {
    fn default() -> Self {
        Self::new(Mode::DeadBattery)
    }
}

impl SimNx20p348x {
    /// A controller that powered up in `mode`.
    pub fn new(mode: Mode) -> Self {
        let mut chip = Self {
            mode,
            closing: None,
            interrupt1: 0,
            interrupt2: 0,
            registers: [0; 12],
            writes: Vec::new(),
            switch_latency: 0,
            stuck_switch: false,
            stuck_dead_battery: false,
            offline: false,
        };
        chip.set_register(registers::DEVICE_ID, SIM_DEVICE_ID);
        // Reset value of the 5V SRC OCP and OVLO fields
        chip.set_register(registers::SRC_5V_OCP_THRESHOLD, 0x0F);
        chip.set_register(registers::OVLO_THRESHOLD, 0x01);
        chip
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Latch interrupt bits as the hardware would on a fault.
    pub fn raise(&mut self, interrupt1: Interrupt1, interrupt2: Interrupt2) {
        self.interrupt1 |= interrupt1.bits();
        self.interrupt2 |= interrupt2.bits();
    }

    /// Stored value of a plain register.
    pub fn register(&self, register: u8) -> u8 {
        self.registers.get(usize::from(register)).copied().unwrap_or(0)
    }

    fn set_register(&mut self, register: u8, value: u8) {
        if let Some(slot) = self.registers.get_mut(usize::from(register)) {
            *slot = value;
        }
    }

    /// Register writes in order, as `(register, value)`.
    pub fn writes(&self) -> &[(u8, u8)] {
        &self.writes
    }

    /// Writes to one register, in order.
    pub fn writes_to(&self, register: u8) -> Vec<u8> {
        self.writes
            .iter()
            .filter(|(reg, _)| *reg == register)
            .map(|(_, value)| *value)
            .collect()
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    fn read(&mut self, register: u8) -> u8 {
        match register {
            registers::DEVICE_STATUS => encode_mode(self.mode),
            registers::SWITCH_STATUS => self.poll_switch_status(),
            registers::INTERRUPT1 => std::mem::take(&mut self.interrupt1),
            registers::INTERRUPT2 => std::mem::take(&mut self.interrupt2),
            _ => self.register(register),
        }
    }

    fn poll_switch_status(&mut self) -> u8 {
        if let Some((path, remaining)) = self.closing {
            if remaining == 0 {
                self.mode = path.mode();
                self.closing = None;
            } else {
                self.closing = Some((path, remaining - 1));
            }
        }
        let status = match self.mode.path() {
            Some(PowerPath::HvSink) => SwitchStatus::HVSNK_STS,
            Some(PowerPath::HvSource) => SwitchStatus::HVSRC_STS,
            Some(PowerPath::FiveVSource) => SwitchStatus::SRC_5V_STS,
            None => SwitchStatus::empty(),
        };
        status.bits()
    }

    fn write(&mut self, register: u8, value: u8) {
        self.writes.push((register, value));
        match register {
            registers::DEVICE_STATUS
            | registers::SWITCH_STATUS
            | registers::INTERRUPT1
            | registers::INTERRUPT2 => {}
            registers::SWITCH_CONTROL => {
                self.set_register(register, value);
                self.switch_control(SwitchControl::from_bits_truncate(value));
            }
            registers::DEVICE_CONTROL => {
                self.set_register(register, value);
                let control = DeviceControl::from_bits_truncate(value);
                if control.contains(DeviceControl::DB_EXIT)
                    && self.mode == Mode::DeadBattery
                    && !self.stuck_dead_battery
                {
                    self.mode = Mode::Standby;
                }
            }
            _ => self.set_register(register, value),
        }
    }

    fn switch_control(&mut self, control: SwitchControl) {
        if self.mode == Mode::DeadBattery {
            return;
        }
        let requested: Vec<PowerPath> = [
            (SwitchControl::HVSNK_EN, PowerPath::HvSink),
            (SwitchControl::HVSRC_EN, PowerPath::HvSource),
            (SwitchControl::SRC_5V_EN, PowerPath::FiveVSource),
        ]
        .into_iter()
        .filter(|(bit, _)| control.contains(*bit))
        .map(|(_, path)| path)
        .collect();

        match requested.as_slice() {
            [] => {
                self.mode = Mode::Standby;
                self.closing = None;
            }
            [path] => {
                self.mode = Mode::Standby;
                self.closing = if self.stuck_switch {
                    None
                } else {
                    Some((*path, self.switch_latency))
                };
            }
            _ => {
                self.mode = Mode::Standby;
                self.closing = None;
                self.interrupt2 |= Interrupt2::EN_ERR.bits();
            }
        }
    }
}

/// A shared simulated bus. Clones refer to the same devices.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    devices: Arc<Mutex<HashMap<u8, SimNx20p348x>>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `chip` at 7-bit `address`, replacing anything already there.
    pub fn attach(&self, address: u8, chip: SimNx20p348x) {
        self.devices.lock().insert(address, chip);
    }

    /// Run `f` against the device at `address`.
    pub fn with_device<R>(&self, address: u8, f: impl FnOnce(&mut SimNx20p348x) -> R) -> Option<R> {
        self.devices.lock().get_mut(&address).map(f)
    }

    fn device<R>(
        &self,
        address: u8,
        f: impl FnOnce(&mut SimNx20p348x) -> R,
    ) -> Result<R, I2cError> {
        let mut devices = self.devices.lock();
        match devices.get_mut(&address) {
            Some(chip) if !chip.offline => Ok(f(chip)),
            _ => Err(I2cError::Nack(address)),
        }
    }
}

#[async_trait]
impl I2c for SimBus {
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), I2cError> {
        match data {
            [register, value] => self.device(address, |chip| chip.write(*register, *value)),
            [_register] => self.device(address, |_| ()),
            _ => Err(I2cError::Other(format!(
                "unsupported write of {} bytes",
                data.len()
            ))),
        }
    }

    async fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), I2cError> {
        let Some(&register) = bytes.first() else {
            return Err(I2cError::Other("read without register address".into()));
        };
        self.device(address, |chip| {
            for (offset, slot) in buffer.iter_mut().enumerate() {
                *slot = chip.read(register.wrapping_add(offset as u8));
            }
        })
    }
}
