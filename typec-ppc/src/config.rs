//! Board configuration for typec-ppc.
//!
//! The board integration layer describes its Type-C ports with a static
//! table: which bus and strap each controller sits on, which variant it is,
//! and the limits to program at initialization. The table can be built in
//! code or loaded from JSON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::peripheral::nx20p348x::{AddressStrap, ChipVariant, CurrentLimit, OvpThreshold};

/// Whole-board configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BoardConfig {
    /// One entry per Type-C port, in port index order
    pub ports: Vec<PortConfig>,

    /// Mode-transition confirmation polling
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Capacity of the interrupt event queue
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

fn default_event_queue_depth() -> usize {
    8
}

/// Configuration of one port's power path controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortConfig {
    /// Bus number, used for identification in logs
    pub bus: u8,

    /// Address strap of the controller on that bus
    #[serde(default)]
    pub strap: AddressStrap,

    #[serde(default)]
    pub variant: ChipVariant,

    /// 5V source current limit in mA; must be one of the chip's steps
    #[serde(default = "default_current_limit_ma")]
    pub current_limit_ma: u32,

    /// HV over-voltage lockout in mV; must be one of the chip's levels
    #[serde(default = "default_ovp_threshold_mv")]
    pub ovp_threshold_mv: u32,

    /// Leave dead-battery mode during initialization
    #[serde(default = "default_true")]
    pub exit_dead_battery: bool,

    /// Arm the fast role swap detector at initialization
    #[serde(default)]
    pub frs_enable: bool,
}

fn default_current_limit_ma() -> u32 {
    3000
}

fn default_ovp_threshold_mv() -> u32 {
    23000
}

fn default_true() -> bool {
    true
}

impl PortConfig {
    /// A port on `bus` with strap `strap` and default limits.
    pub fn new(bus: u8, strap: AddressStrap) -> Self {
        Self {
            bus,
            strap,
            variant: ChipVariant::default(),
            current_limit_ma: default_current_limit_ma(),
            ovp_threshold_mv: default_ovp_threshold_mv(),
            exit_dead_battery: true,
            frs_enable: false,
        }
    }

    pub fn device_address(&self) -> u8 {
        self.strap.i2c_address()
    }

    pub fn current_limit(&self) -> Result<CurrentLimit> {
        CurrentLimit::from_milliamps(self.current_limit_ma).ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "current limit {} mA is not a supported step",
                self.current_limit_ma
            ))
        })
    }

    pub fn ovp_threshold(&self) -> Result<OvpThreshold> {
        OvpThreshold::from_millivolts(self.ovp_threshold_mv).ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "OVP threshold {} mV is not a supported level",
                self.ovp_threshold_mv
            ))
        })
    }
}

/// Bounded polling used while waiting for the chip to confirm a mode change.
///
/// The datasheet gives no confirmation latency; three attempts 10 ms apart
/// covers the switch turn-on time with margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Number of status reads before giving up; at least one is always made
    pub attempts: u32,

    /// Delay between status reads
    pub interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval_ms: 10,
        }
    }
}

impl RetryPolicy {
    /// Defaults, overridden by `PPC_POLL_ATTEMPTS` and `PPC_POLL_INTERVAL_MS`.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// This policy with `PPC_POLL_ATTEMPTS` and `PPC_POLL_INTERVAL_MS`
    /// applied on top.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Replace each field whose variable `lookup` returns and parses.
    /// Unset or unparsable values keep the current setting.
    pub fn with_overrides(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let attempts = lookup("PPC_POLL_ATTEMPTS")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(self.attempts);
        let interval_ms = lookup("PPC_POLL_INTERVAL_MS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(self.interval_ms);
        Self {
            attempts,
            interval_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

impl BoardConfig {
    /// Parse and validate a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BoardConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file. The polling variables in
    /// the environment take precedence over the file's `retry` section.
    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&json)?;
        config.retry = config.retry.with_env_overrides();
        Ok(config)
    }

    /// Check every port's parameters and that no two controllers share an
    /// address on the same bus.
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(Error::InvalidConfiguration("no ports configured".into()));
        }
        if self.event_queue_depth == 0 {
            return Err(Error::InvalidConfiguration(
                "event queue depth must be non-zero".into(),
            ));
        }
        for (index, port) in self.ports.iter().enumerate() {
            port.current_limit()?;
            port.ovp_threshold()?;
            let clash = self.ports.iter().skip(index + 1).any(|other| {
                other.bus == port.bus && other.device_address() == port.device_address()
            });
            if clash {
                return Err(Error::InvalidConfiguration(format!(
                    "two ports at address 0x{:02X} on bus {}",
                    port.device_address(),
                    port.bus
                )));
            }
        }
        Ok(())
    }
}
