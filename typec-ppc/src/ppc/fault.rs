//! Interrupt decoding and fault policy.
//!
//! Power-path faults (over-voltage, over-current, short circuit, reverse
//! current) on an active path open the switches before anything else is
//! done. Over-temperature is only recorded since the chip protects itself
//! thermally. In dead-battery mode the HV sink is the only thing powering
//! the system and the chip applies its fixed hardware limits, so faults
//! there are latched and reported but the path is left alone. Everything
//! observed is latched until acknowledged.

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::hw_trait::I2c;
use crate::peripheral::nx20p348x::{decode_interrupts, StatusDecoder};
use crate::ppc::port::{Port, PortIo, OVERCURRENT_EVENT_THRESHOLD};
use crate::ppc::types::{FaultEvent, Faults, Mode};
use crate::ppc::PortEvent;

/// Outcome of servicing one interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReport {
    pub events: Vec<FaultEvent>,
    /// Kinds seen on this interrupt
    pub observed: Faults,
    /// Everything latched on the port afterwards
    pub latched: Faults,
    /// Mode after policy was applied
    pub mode: Mode,
    /// Whether a protective Standby transition was made
    pub shutdown: bool,
}

impl<I2C: I2c> Port<I2C> {
    /// Read and clear both interrupt registers, apply fault policy and
    /// publish the outcome. Returns `None` for a spurious interrupt.
    ///
    /// `closing` is the mode whose switch is being closed when this runs in
    /// the middle of a transition; that path is treated as active.
    pub(crate) async fn service_interrupt(
        &self,
        io: &mut PortIo<I2C>,
        closing: Option<Mode>,
    ) -> Result<Option<FaultReport>> {
        let map = io.map;
        let int1 = io.read(map.interrupt1).await?;
        let int2 = io.read(map.interrupt2).await?;

        let events = decode_interrupts(int1, int2);
        if events.is_empty() {
            debug!(port = self.index, "spurious interrupt (0x{:02X}, 0x{:02X})", int1, int2);
            return Ok(None);
        }

        let desc: Vec<&str> = StatusDecoder::decode_interrupt1(int1)
            .into_iter()
            .chain(StatusDecoder::decode_interrupt2(int2))
            .collect();
        warn!(
            port = self.index,
            "INTERRUPT1=0x{:02X} INTERRUPT2=0x{:02X} ({})",
            int1,
            int2,
            desc.join(", ")
        );

        let observed: Faults = events.iter().copied().collect();
        let mode = closing.unwrap_or(self.status().mode);
        let power_path = observed.intersects(Faults::POWER_PATH);
        let shutdown = power_path && mode.is_active();
        if power_path && mode == Mode::DeadBattery {
            warn!(
                port = self.index,
                "{} in dead battery mode, left to hardware protection", observed
            );
        }

        // One protective write no matter how many power-path bits fired.
        let shutdown_result = if shutdown {
            error!(port = self.index, "protective shutdown of {} ({})", mode, observed);
            self.open_switches(io).await
        } else {
            Ok(())
        };

        let (latched, mode, overcurrent_events) = self.update_status(|s| {
            s.faults |= observed;
            if observed.contains(Faults::OVERCURRENT) {
                s.overcurrent_events = s.overcurrent_events.saturating_add(1);
            }
            (s.faults, s.mode, s.overcurrent_events)
        });
        shutdown_result?;

        if observed.contains(Faults::OVERCURRENT) {
            if overcurrent_events >= OVERCURRENT_EVENT_THRESHOLD {
                error!(
                    port = self.index,
                    "{} overcurrent events, port latched off", overcurrent_events
                );
            } else {
                info!(port = self.index, "overcurrent event {}", overcurrent_events);
            }
        }
        if observed.contains(Faults::DEAD_BATTERY_EXIT_ERROR) {
            error!(port = self.index, "chip reported dead battery exit error");
        }

        self.publish(PortEvent::Fault {
            port: self.index,
            mode,
            observed,
            latched,
            shutdown,
        });
        Ok(Some(FaultReport {
            events,
            observed,
            latched,
            mode,
            shutdown,
        }))
    }

    /// Clear latched faults. The interrupt registers are read again and
    /// anything still asserted stays latched; interrupt enables are
    /// re-armed. Returns the faults that remain.
    pub(crate) async fn acknowledge(&self, io: &mut PortIo<I2C>) -> Result<Faults> {
        let map = io.map;
        let int1 = io.read(map.interrupt1).await?;
        let int2 = io.read(map.interrupt2).await?;
        let remaining: Faults = decode_interrupts(int1, int2).into_iter().collect();
        io.unmask_interrupts().await?;

        let cleared = self.update_status(|s| {
            let cleared = s.faults - remaining;
            s.faults = remaining;
            cleared
        });
        info!(
            port = self.index,
            "acknowledged faults ({}), still asserted ({})", cleared, remaining
        );
        Ok(remaining)
    }
}
