//! Value types shared by the register codec, the mode controller and the
//! query interface.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter};

/// Power-path mode of one port. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
pub enum Mode {
    /// Hardware default after power-up, sinking through the HV path with
    /// fixed protection settings. Only hardware reset enters it.
    DeadBattery,
    HvSink,
    FiveVSource,
    HvSource,
    Standby,
}

impl Mode {
    /// The switch that carries VBUS in this mode, if any.
    pub fn path(self) -> Option<PowerPath> {
        match self {
            Mode::HvSink => Some(PowerPath::HvSink),
            Mode::FiveVSource => Some(PowerPath::FiveVSource),
            Mode::HvSource => Some(PowerPath::HvSource),
            Mode::DeadBattery | Mode::Standby => None,
        }
    }

    pub fn is_source(self) -> bool {
        matches!(self, Mode::FiveVSource | Mode::HvSource)
    }

    pub fn is_sink(self) -> bool {
        matches!(self, Mode::HvSink | Mode::DeadBattery)
    }

    /// True for modes where a switch is closed under firmware control.
    pub fn is_active(self) -> bool {
        self.path().is_some()
    }
}

/// One of the three switches inside the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum PowerPath {
    HvSink,
    HvSource,
    FiveVSource,
}

impl PowerPath {
    pub fn mode(self) -> Mode {
        match self {
            PowerPath::HvSink => Mode::HvSink,
            PowerPath::HvSource => Mode::HvSource,
            PowerPath::FiveVSource => Mode::FiveVSource,
        }
    }
}

/// CC orientation of the attached plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
pub enum Polarity {
    #[default]
    Cc1,
    Cc2,
}

/// Hardware fault categories reported through the interrupt registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum FaultKind {
    Overvoltage,
    Overcurrent,
    ShortCircuit,
    ReverseCurrentProtection,
    OverTemperature,
    DeadBatteryExitError,
    EnableError,
}

impl FaultKind {
    pub fn flag(self) -> Faults {
        match self {
            FaultKind::Overvoltage => Faults::OVERVOLTAGE,
            FaultKind::Overcurrent => Faults::OVERCURRENT,
            FaultKind::ShortCircuit => Faults::SHORT_CIRCUIT,
            FaultKind::ReverseCurrentProtection => Faults::REVERSE_CURRENT,
            FaultKind::OverTemperature => Faults::OVER_TEMPERATURE,
            FaultKind::DeadBatteryExitError => Faults::DEAD_BATTERY_EXIT_ERROR,
            FaultKind::EnableError => Faults::ENABLE_ERROR,
        }
    }
}

/// A single decoded interrupt bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub kind: FaultKind,
    /// Switch the fault was detected on; `None` for device-wide faults.
    pub path: Option<PowerPath>,
}

bitflags! {
    /// Latched fault kinds for one port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Faults: u8 {
        const OVERVOLTAGE = 1 << 0;
        const OVERCURRENT = 1 << 1;
        const SHORT_CIRCUIT = 1 << 2;
        const REVERSE_CURRENT = 1 << 3;
        const OVER_TEMPERATURE = 1 << 4;
        const DEAD_BATTERY_EXIT_ERROR = 1 << 5;
        const ENABLE_ERROR = 1 << 6;

        /// Faults that force a protective shutdown of an active path.
        const POWER_PATH = Self::OVERVOLTAGE.bits()
            | Self::OVERCURRENT.bits()
            | Self::SHORT_CIRCUIT.bits()
            | Self::REVERSE_CURRENT.bits();

        /// Faults that block enabling a source path until acknowledged.
        const BLOCKS_SOURCE = Self::POWER_PATH.bits() | Self::ENABLE_ERROR.bits();
    }
}

impl FromIterator<FaultEvent> for Faults {
    fn from_iter<T: IntoIterator<Item = FaultEvent>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Faults::empty(), |acc, event| acc | event.kind.flag())
    }
}

impl fmt::Display for Faults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_source_and_sink_are_exclusive() {
        for mode in Mode::iter() {
            assert!(
                !(mode.is_source() && mode.is_sink()),
                "{mode} reports both source and sink"
            );
        }
    }

    #[test]
    fn test_path_round_trips_through_mode() {
        for path in PowerPath::iter() {
            assert_eq!(path.mode().path(), Some(path));
        }
        assert_eq!(Mode::Standby.path(), None);
        assert_eq!(Mode::DeadBattery.path(), None);
    }

    #[test]
    fn test_every_fault_kind_has_a_distinct_flag() {
        let all: Faults = FaultKind::iter()
            .map(|kind| FaultEvent { kind, path: None })
            .collect();
        assert_eq!(all.bits().count_ones() as usize, FaultKind::iter().count());
    }

    #[test]
    fn test_faults_display() {
        assert_eq!(Faults::empty().to_string(), "none");
        assert_eq!(
            (Faults::OVERVOLTAGE | Faults::OVERCURRENT).to_string(),
            "OVERVOLTAGE, OVERCURRENT"
        );
    }

    #[test]
    fn test_thermal_is_not_a_power_path_fault() {
        assert!(!Faults::POWER_PATH.contains(Faults::OVER_TEMPERATURE));
        assert!(Faults::BLOCKS_SOURCE.contains(Faults::ENABLE_ERROR));
    }
}
