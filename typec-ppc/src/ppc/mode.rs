//! Mode controller.
//!
//! Drives a port from its current mode to a requested one. Switches are only
//! ever closed from Standby; moving between two active paths goes through
//! Standby with interrupts masked so the intermediate state does not raise
//! faults. Every wait for the chip to confirm is bounded by the port's
//! [`RetryPolicy`].
//!
//! An interrupt that arrives while a switch is closing is serviced between
//! polls. Only a protective shutdown ends the transition early; thermal and
//! spurious interrupts let it run to completion.

use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::hw_trait::I2c;
use crate::peripheral::nx20p348x::{
    decode_mode, decode_switch_status, DeviceControl, SwitchControl,
};
use crate::ppc::port::{Port, PortIo};
use crate::ppc::types::{Faults, Mode, PowerPath};

impl<I2C: I2c> Port<I2C> {
    /// Move the port to `target`. Returns `false` when it was already there
    /// and nothing was written.
    pub(crate) async fn transition(
        &self,
        io: &mut PortIo<I2C>,
        target: Mode,
        retry: &RetryPolicy,
    ) -> Result<bool> {
        let current = self.status().mode;
        if current == target {
            trace!(port = self.index, "already in {}", target);
            return Ok(false);
        }
        if target == Mode::DeadBattery {
            return Err(Error::InvalidTransition {
                port: self.index,
                from: current,
                to: target,
            });
        }
        self.check_faults(target)?;

        debug!(port = self.index, "transition {} -> {}", current, target);

        let mut from = current;
        if from == Mode::DeadBattery {
            from = self.exit_dead_battery(io, target, retry).await?;
            if from == target {
                return Ok(true);
            }
        }

        match (from.path(), target.path()) {
            (Some(_), None) => self.open_switches(io).await?,
            (None, Some(path)) => self.close_path(io, path, target, retry).await?,
            (Some(_), Some(path)) => {
                io.mask_interrupts().await?;
                let swapped = self.swap_path(io, path, target, retry).await;
                io.unmask_interrupts().await?;
                swapped?;
            }
            (None, None) => {}
        }
        Ok(true)
    }

    /// Refuse transitions that would override hardware protection.
    fn check_faults(&self, target: Mode) -> Result<()> {
        let status = self.status();
        if target != Mode::Standby && status.faults.contains(Faults::DEAD_BATTERY_EXIT_ERROR) {
            return Err(Error::FaultPending {
                port: self.index,
                faults: status.faults,
            });
        }
        if target.is_source() {
            if status.faults.intersects(Faults::BLOCKS_SOURCE) {
                return Err(Error::FaultPending {
                    port: self.index,
                    faults: status.faults,
                });
            }
            if status.is_latched_off() {
                warn!(
                    port = self.index,
                    "port latched off after {} overcurrent events", status.overcurrent_events
                );
                return Err(Error::FaultPending {
                    port: self.index,
                    faults: status.faults | Faults::OVERCURRENT,
                });
            }
        }
        Ok(())
    }

    /// Set the dead-battery exit bit and wait for the mode field to change.
    /// Returns the mode the chip settled in.
    pub(crate) async fn exit_dead_battery(
        &self,
        io: &mut PortIo<I2C>,
        target: Mode,
        retry: &RetryPolicy,
    ) -> Result<Mode> {
        let map = io.map;
        io.update(
            map.device_control,
            DeviceControl::DB_EXIT.bits(),
            DeviceControl::DB_EXIT.bits(),
        )
        .await?;

        let attempts = retry.attempts();
        for attempt in 1..=attempts {
            let status = io.read(map.device_status).await?;
            let mode = decode_mode(status).map_err(Error::codec(self.index))?;
            if mode != Mode::DeadBattery {
                debug!(port = self.index, "left dead battery mode, now {}", mode);
                self.update_status(|s| s.set_mode(mode));
                return Ok(mode);
            }
            trace!(port = self.index, "dead battery exit pending ({}/{})", attempt, attempts);
            if attempt < attempts {
                time::sleep(retry.interval()).await;
            }
        }

        error!(port = self.index, "dead battery exit did not complete");
        Err(Error::TransitionTimeout {
            port: self.index,
            target,
        })
    }

    /// Open every switch. Always safe; no confirmation is awaited.
    pub(crate) async fn open_switches(&self, io: &mut PortIo<I2C>) -> Result<()> {
        let map = io.map;
        io.write(map.switch_control, SwitchControl::empty().bits()).await?;
        self.update_status(|s| s.set_mode(Mode::Standby));
        Ok(())
    }

    async fn swap_path(
        &self,
        io: &mut PortIo<I2C>,
        path: PowerPath,
        target: Mode,
        retry: &RetryPolicy,
    ) -> Result<()> {
        self.open_switches(io).await?;
        self.close_path(io, path, target, retry).await
    }

    /// Close `path` from Standby and poll until the chip reports it closed.
    /// On timeout or a protective shutdown the switches are open and the
    /// port stays in Standby.
    async fn close_path(
        &self,
        io: &mut PortIo<I2C>,
        path: PowerPath,
        target: Mode,
        retry: &RetryPolicy,
    ) -> Result<()> {
        let map = io.map;
        io.write(map.switch_control, SwitchControl::for_path(path).bits())
            .await?;

        let attempts = retry.attempts();
        for attempt in 1..=attempts {
            if self.interrupt_pending() {
                trace!(port = self.index, "servicing interrupt while closing {}", path);
                let report = self.service_interrupt(io, Some(target)).await?;
                if report.is_some_and(|r| r.shutdown) {
                    warn!(port = self.index, "transition to {} abandoned on fault", target);
                    return Err(Error::TransitionAborted {
                        port: self.index,
                        target,
                    });
                }
            }

            let raw = io.read(map.switch_status).await?;
            let state = match decode_switch_status(raw) {
                Ok(state) => state,
                Err(e) => {
                    error!(port = self.index, "{}", e);
                    self.open_switches(io).await?;
                    return Err(Error::codec(self.index)(e));
                }
            };
            if state.is_active(path) {
                debug!(port = self.index, "{} confirmed after {} poll(s)", target, attempt);
                self.update_status(|s| s.set_mode(target));
                return Ok(());
            }

            trace!(port = self.index, "waiting for {} ({}/{})", path, attempt, attempts);
            if attempt < attempts {
                time::sleep(retry.interval()).await;
            }
        }

        error!(port = self.index, "switch status never reported {}", path);
        self.open_switches(io).await?;
        Err(Error::TransitionTimeout {
            port: self.index,
            target,
        })
    }
}
