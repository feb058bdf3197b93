//! NX20P348x USB Type-C power path controller register codec
//!
//! Register addresses, bitfields and the conversions between raw register
//! values and the typed values used by the driver. Nothing here performs
//! I/O.
//!
//! Datasheet: <https://www.nxp.com/docs/en/data-sheet/NX20P3483UK.pdf>

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use thiserror::Error;

use crate::ppc::types::{FaultEvent, FaultKind, Mode, PowerPath};

/// 7-bit address of the part with both strap pins low (0xE0 in 8-bit form).
pub const I2C_ADDR_BASE: u8 = 0x70;

/// Dead-battery mode hard-codes VBUS OVP at 6.8 V. VBUS must be negotiated
/// at or below this before the PD rail is dropped, or the port locks out.
pub const SAFE_RESET_VBUS_MV: u32 = 5000;

/// Register addresses for the reference layout
pub mod registers {
    pub const DEVICE_ID: u8 = 0x00;
    pub const DEVICE_STATUS: u8 = 0x01;
    pub const SWITCH_CONTROL: u8 = 0x02;
    pub const SWITCH_STATUS: u8 = 0x03;
    pub const INTERRUPT1: u8 = 0x04;
    pub const INTERRUPT2: u8 = 0x05;
    pub const INTERRUPT1_MASK: u8 = 0x06;
    pub const INTERRUPT2_MASK: u8 = 0x07;
    pub const OVLO_THRESHOLD: u8 = 0x08;
    pub const HV_SRC_OCP_THRESHOLD: u8 = 0x09;
    pub const SRC_5V_OCP_THRESHOLD: u8 = 0x0A;
    pub const DEVICE_CONTROL: u8 = 0x0B;
}

const DEVICE_MODE_MASK: u8 = 0x07;
pub const ILIM_MASK: u8 = 0x0F;
pub const OVLO_THRESHOLD_MASK: u8 = 0x07;

/// Interrupt enable value with every source enabled.
pub const INTERRUPTS_ALL_ENABLED: u8 = 0xFF;
/// Interrupt enable value with every source masked.
pub const INTERRUPTS_ALL_MASKED: u8 = 0x00;

bitflags! {
    /// SWITCH_CONTROL: path enables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SwitchControl: u8 {
        const HVSNK_EN = 1 << 0;
        const HVSRC_EN = 1 << 1;
        const SRC_5V_EN = 1 << 2;
    }

    /// SWITCH_STATUS: which switch is actually closed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SwitchStatus: u8 {
        const HVSNK_STS = 1 << 0;
        const HVSRC_STS = 1 << 1;
        const SRC_5V_STS = 1 << 2;
    }

    /// INTERRUPT1 latched fault bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt1: u8 {
        const OTP = 1 << 0;
        const OC_5VSRC = 1 << 1;
        const SC_5VSRC = 1 << 2;
        const RCP_5VSRC = 1 << 3;
        const OV_5VSRC = 1 << 4;
        const DBEXIT_ERR = 1 << 7;
    }

    /// INTERRUPT2 latched fault bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt2: u8 {
        const OV_HVSRC = 1 << 0;
        const OC_HVSRC = 1 << 1;
        const SC_HVSRC = 1 << 2;
        const RCP_HVSRC = 1 << 3;
        const OV_HVSNK = 1 << 4;
        const SC_HVSNK = 1 << 5;
        const RCP_HVSNK = 1 << 6;
        const EN_ERR = 1 << 7;
    }

    /// DEVICE_CONTROL.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceControl: u8 {
        const LDO_SD = 1 << 0;
        const VBUSDIS_EN = 1 << 1;
        const DB_EXIT = 1 << 2;
        const FRS_AT = 1 << 3;
    }
}

impl SwitchControl {
    /// Enable bit that closes `path`.
    pub fn for_path(path: PowerPath) -> Self {
        match path {
            PowerPath::HvSink => SwitchControl::HVSNK_EN,
            PowerPath::HvSource => SwitchControl::HVSRC_EN,
            PowerPath::FiveVSource => SwitchControl::SRC_5V_EN,
        }
    }
}

/// Codec error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid current limit code 0x{0:02X}")]
    InvalidCurrentLimit(u8),
    #[error("invalid OVP threshold code 0x{0:02X}")]
    InvalidOvpThreshold(u8),
    #[error("unknown device mode {0}")]
    UnknownMode(u8),
    #[error("switch status 0x{0:02X} reports more than one active path")]
    SwitchStatusInconsistent(u8),
}

/// 5V source current limit, 16 steps of 200 mA from 0.4 A to 3.4 A (minimum
/// trip values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[repr(u8)]
pub enum CurrentLimit {
    Ma400 = 0,
    Ma600 = 1,
    Ma800 = 2,
    Ma1000 = 3,
    Ma1200 = 4,
    Ma1400 = 5,
    Ma1600 = 6,
    Ma1800 = 7,
    Ma2000 = 8,
    Ma2200 = 9,
    Ma2400 = 10,
    Ma2600 = 11,
    Ma2800 = 12,
    Ma3000 = 13,
    Ma3200 = 14,
    Ma3400 = 15,
}

impl CurrentLimit {
    const ALL: [CurrentLimit; 16] = [
        CurrentLimit::Ma400,
        CurrentLimit::Ma600,
        CurrentLimit::Ma800,
        CurrentLimit::Ma1000,
        CurrentLimit::Ma1200,
        CurrentLimit::Ma1400,
        CurrentLimit::Ma1600,
        CurrentLimit::Ma1800,
        CurrentLimit::Ma2000,
        CurrentLimit::Ma2200,
        CurrentLimit::Ma2400,
        CurrentLimit::Ma2600,
        CurrentLimit::Ma2800,
        CurrentLimit::Ma3000,
        CurrentLimit::Ma3200,
        CurrentLimit::Ma3400,
    ];

    /// Step index, 0 (0.4 A) through 15 (3.4 A).
    pub fn step(self) -> u8 {
        self as u8
    }

    pub fn from_step(step: u8) -> Result<Self, CodecError> {
        Self::ALL
            .get(usize::from(step))
            .copied()
            .ok_or(CodecError::InvalidCurrentLimit(step))
    }

    pub fn milliamps(self) -> u32 {
        400 + 200 * u32::from(self.step())
    }

    /// Exact match only; the chip has no setting between steps.
    pub fn from_milliamps(ma: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|limit| limit.milliamps() == ma)
    }
}

/// HV over-voltage lockout threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[repr(u8)]
pub enum OvpThreshold {
    V6_0 = 0,
    V6_8 = 1,
    V10_0 = 2,
    V11_5 = 3,
    V14_0 = 4,
    V17_0 = 5,
    V23_0 = 6,
}

impl OvpThreshold {
    const ALL: [OvpThreshold; 7] = [
        OvpThreshold::V6_0,
        OvpThreshold::V6_8,
        OvpThreshold::V10_0,
        OvpThreshold::V11_5,
        OvpThreshold::V14_0,
        OvpThreshold::V17_0,
        OvpThreshold::V23_0,
    ];

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Result<Self, CodecError> {
        Self::ALL
            .get(usize::from(level))
            .copied()
            .ok_or(CodecError::InvalidOvpThreshold(level))
    }

    pub fn millivolts(self) -> u32 {
        match self {
            OvpThreshold::V6_0 => 6000,
            OvpThreshold::V6_8 => 6800,
            OvpThreshold::V10_0 => 10000,
            OvpThreshold::V11_5 => 11500,
            OvpThreshold::V14_0 => 14000,
            OvpThreshold::V17_0 => 17000,
            OvpThreshold::V23_0 => 23000,
        }
    }

    pub fn from_millivolts(mv: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|level| level.millivolts() == mv)
    }
}

/// Encode a current limit into the 5V SRC OCP field.
pub fn encode_current_limit(limit: CurrentLimit) -> u8 {
    limit.step() & ILIM_MASK
}

/// Decode the 5V SRC OCP field. Bits outside the 4-bit field are rejected
/// rather than masked off.
pub fn decode_current_limit(field: u8) -> Result<CurrentLimit, CodecError> {
    if field & !ILIM_MASK != 0 {
        return Err(CodecError::InvalidCurrentLimit(field));
    }
    CurrentLimit::from_step(field)
}

/// Encode an OVP level into the OVLO threshold field.
pub fn encode_ovp_threshold(level: OvpThreshold) -> u8 {
    level.level() & OVLO_THRESHOLD_MASK
}

/// Decode the OVLO threshold field. Code 7 is reserved.
pub fn decode_ovp_threshold(field: u8) -> Result<OvpThreshold, CodecError> {
    if field & !OVLO_THRESHOLD_MASK != 0 {
        return Err(CodecError::InvalidOvpThreshold(field));
    }
    OvpThreshold::from_level(field)
}

/// Decode the mode field of DEVICE_STATUS. Upper bits are ignored.
pub fn decode_mode(status: u8) -> Result<Mode, CodecError> {
    match status & DEVICE_MODE_MASK {
        0 => Ok(Mode::DeadBattery),
        1 => Ok(Mode::HvSink),
        2 => Ok(Mode::FiveVSource),
        3 => Ok(Mode::HvSource),
        4 => Ok(Mode::Standby),
        code => Err(CodecError::UnknownMode(code)),
    }
}

/// Inverse of [`decode_mode`], used by the simulated device.
pub fn encode_mode(mode: Mode) -> u8 {
    match mode {
        Mode::DeadBattery => 0,
        Mode::HvSink => 1,
        Mode::FiveVSource => 2,
        Mode::HvSource => 3,
        Mode::Standby => 4,
    }
}

/// Decoded SWITCH_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwitchState {
    pub hv_sink_active: bool,
    pub hv_src_active: bool,
    pub five_v_src_active: bool,
}

impl SwitchState {
    /// The single closed path, or `None` when all switches are open.
    pub fn active_path(&self) -> Option<PowerPath> {
        if self.hv_sink_active {
            Some(PowerPath::HvSink)
        } else if self.hv_src_active {
            Some(PowerPath::HvSource)
        } else if self.five_v_src_active {
            Some(PowerPath::FiveVSource)
        } else {
            None
        }
    }

    pub fn is_active(&self, path: PowerPath) -> bool {
        match path {
            PowerPath::HvSink => self.hv_sink_active,
            PowerPath::HvSource => self.hv_src_active,
            PowerPath::FiveVSource => self.five_v_src_active,
        }
    }
}

/// Decode SWITCH_STATUS. More than one closed switch is reported as an
/// error so the caller can surface it.
pub fn decode_switch_status(byte: u8) -> Result<SwitchState, CodecError> {
    let status = SwitchStatus::from_bits_truncate(byte);
    if status.bits().count_ones() > 1 {
        return Err(CodecError::SwitchStatusInconsistent(byte));
    }
    Ok(SwitchState {
        hv_sink_active: status.contains(SwitchStatus::HVSNK_STS),
        hv_src_active: status.contains(SwitchStatus::HVSRC_STS),
        five_v_src_active: status.contains(SwitchStatus::SRC_5V_STS),
    })
}

/// Decode both interrupt registers into individual fault events, in bit
/// order of INTERRUPT1 then INTERRUPT2. Reserved bits are ignored.
pub fn decode_interrupts(int1: u8, int2: u8) -> Vec<FaultEvent> {
    use FaultKind::*;
    use PowerPath::*;

    let int1_map: [(Interrupt1, FaultKind, Option<PowerPath>); 6] = [
        (Interrupt1::OTP, OverTemperature, None),
        (Interrupt1::OC_5VSRC, Overcurrent, Some(FiveVSource)),
        (Interrupt1::SC_5VSRC, ShortCircuit, Some(FiveVSource)),
        (Interrupt1::RCP_5VSRC, ReverseCurrentProtection, Some(FiveVSource)),
        (Interrupt1::OV_5VSRC, Overvoltage, Some(FiveVSource)),
        (Interrupt1::DBEXIT_ERR, DeadBatteryExitError, None),
    ];
    let int2_map: [(Interrupt2, FaultKind, Option<PowerPath>); 8] = [
        (Interrupt2::OV_HVSRC, Overvoltage, Some(HvSource)),
        (Interrupt2::OC_HVSRC, Overcurrent, Some(HvSource)),
        (Interrupt2::SC_HVSRC, ShortCircuit, Some(HvSource)),
        (Interrupt2::RCP_HVSRC, ReverseCurrentProtection, Some(HvSource)),
        (Interrupt2::OV_HVSNK, Overvoltage, Some(HvSink)),
        (Interrupt2::SC_HVSNK, ShortCircuit, Some(HvSink)),
        (Interrupt2::RCP_HVSNK, ReverseCurrentProtection, Some(HvSink)),
        (Interrupt2::EN_ERR, EnableError, None),
    ];

    let int1 = Interrupt1::from_bits_truncate(int1);
    let int2 = Interrupt2::from_bits_truncate(int2);

    let first = int1_map
        .into_iter()
        .filter(|(bit, _, _)| int1.contains(*bit))
        .map(|(_, kind, path)| FaultEvent { kind, path });
    let second = int2_map
        .into_iter()
        .filter(|(bit, _, _)| int2.contains(*bit))
        .map(|(_, kind, path)| FaultEvent { kind, path });
    first.chain(second).collect()
}

/// Helper functions for describing registers in log output
pub struct StatusDecoder;

impl StatusDecoder {
    pub fn decode_interrupt1(value: u8) -> Vec<&'static str> {
        let bits = Interrupt1::from_bits_truncate(value);
        let mut desc = Vec::new();
        if bits.contains(Interrupt1::OTP) { desc.push("over-temperature"); }
        if bits.contains(Interrupt1::OC_5VSRC) { desc.push("5V src overcurrent"); }
        if bits.contains(Interrupt1::SC_5VSRC) { desc.push("5V src short circuit"); }
        if bits.contains(Interrupt1::RCP_5VSRC) { desc.push("5V src reverse current"); }
        if bits.contains(Interrupt1::OV_5VSRC) { desc.push("5V src overvoltage"); }
        if bits.contains(Interrupt1::DBEXIT_ERR) { desc.push("dead battery exit error"); }
        desc
    }

    pub fn decode_interrupt2(value: u8) -> Vec<&'static str> {
        let bits = Interrupt2::from_bits_truncate(value);
        let mut desc = Vec::new();
        if bits.contains(Interrupt2::OV_HVSRC) { desc.push("HV src overvoltage"); }
        if bits.contains(Interrupt2::OC_HVSRC) { desc.push("HV src overcurrent"); }
        if bits.contains(Interrupt2::SC_HVSRC) { desc.push("HV src short circuit"); }
        if bits.contains(Interrupt2::RCP_HVSRC) { desc.push("HV src reverse current"); }
        if bits.contains(Interrupt2::OV_HVSNK) { desc.push("HV snk overvoltage"); }
        if bits.contains(Interrupt2::SC_HVSNK) { desc.push("HV snk short circuit"); }
        if bits.contains(Interrupt2::RCP_HVSNK) { desc.push("HV snk reverse current"); }
        if bits.contains(Interrupt2::EN_ERR) { desc.push("switch enable error"); }
        desc
    }

    pub fn decode_device_control(value: u8) -> Vec<&'static str> {
        let bits = DeviceControl::from_bits_truncate(value);
        let mut desc = Vec::new();
        if bits.contains(DeviceControl::LDO_SD) { desc.push("LDO shutdown"); }
        if bits.contains(DeviceControl::VBUSDIS_EN) { desc.push("VBUS discharge"); }
        if bits.contains(DeviceControl::DB_EXIT) { desc.push("dead battery exit"); }
        if bits.contains(DeviceControl::FRS_AT) { desc.push("fast role swap"); }
        desc
    }
}

/// 2-bit address strap of one chip instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressStrap {
    #[default]
    A0,
    A1,
    A2,
    A3,
}

impl AddressStrap {
    pub fn i2c_address(self) -> u8 {
        I2C_ADDR_BASE
            | match self {
                AddressStrap::A0 => 0,
                AddressStrap::A1 => 1,
                AddressStrap::A2 => 2,
                AddressStrap::A3 => 3,
            }
    }
}

/// A single control bit inside a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBit {
    pub register: u8,
    pub mask: u8,
}

/// Supported members of the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
pub enum ChipVariant {
    #[default]
    Nx20p3483,
    Nx20p3481,
}

impl ChipVariant {
    pub fn register_map(self) -> &'static RegisterMap {
        match self {
            ChipVariant::Nx20p3483 => &NX20P3483_MAP,
            ChipVariant::Nx20p3481 => &NX20P3481_MAP,
        }
    }
}

/// Register layout of one chip variant. The mode controller and the fault
/// policy only ever address the chip through this table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    pub name: &'static str,
    pub device_id: u8,
    pub device_status: u8,
    pub switch_control: u8,
    pub switch_status: u8,
    pub interrupt1: u8,
    pub interrupt2: u8,
    pub interrupt1_mask: u8,
    pub interrupt2_mask: u8,
    pub ovlo_threshold: u8,
    pub hv_src_ocp_threshold: u8,
    pub src_5v_ocp_threshold: u8,
    pub device_control: u8,
    /// VCONN switch, absent on parts that leave VCONN to the TCPC.
    pub vconn_enable: Option<RegisterBit>,
    /// DEVICE_ID contents to insist on at initialization. The family's ID
    /// values are not published, so the reference maps leave this open and
    /// boards that know their part pin it.
    pub expected_id: Option<u8>,
}

impl RegisterMap {
    /// Every register with its name, in address order.
    pub fn named_registers(&self) -> [(&'static str, u8); 12] {
        [
            ("DEVICE_ID", self.device_id),
            ("DEVICE_STATUS", self.device_status),
            ("SWITCH_CONTROL", self.switch_control),
            ("SWITCH_STATUS", self.switch_status),
            ("INTERRUPT1", self.interrupt1),
            ("INTERRUPT2", self.interrupt2),
            ("INTERRUPT1_MASK", self.interrupt1_mask),
            ("INTERRUPT2_MASK", self.interrupt2_mask),
            ("OVLO_THRESHOLD", self.ovlo_threshold),
            ("HV_SRC_OCP_THRESHOLD", self.hv_src_ocp_threshold),
            ("5V_SRC_OCP_THRESHOLD", self.src_5v_ocp_threshold),
            ("DEVICE_CONTROL", self.device_control),
        ]
    }
}

const fn reference_map(name: &'static str) -> RegisterMap {
    RegisterMap {
        name,
        device_id: registers::DEVICE_ID,
        device_status: registers::DEVICE_STATUS,
        switch_control: registers::SWITCH_CONTROL,
        switch_status: registers::SWITCH_STATUS,
        interrupt1: registers::INTERRUPT1,
        interrupt2: registers::INTERRUPT2,
        interrupt1_mask: registers::INTERRUPT1_MASK,
        interrupt2_mask: registers::INTERRUPT2_MASK,
        ovlo_threshold: registers::OVLO_THRESHOLD,
        hv_src_ocp_threshold: registers::HV_SRC_OCP_THRESHOLD,
        src_5v_ocp_threshold: registers::SRC_5V_OCP_THRESHOLD,
        device_control: registers::DEVICE_CONTROL,
        vconn_enable: None,
        expected_id: None,
    }
}

pub static NX20P3483_MAP: RegisterMap = reference_map("NX20P3483");
pub static NX20P3481_MAP: RegisterMap = reference_map("NX20P3481");
