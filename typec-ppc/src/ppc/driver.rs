//! NX20P348x-family implementation of [`PpcDriver`].

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::{BoardConfig, PortConfig, RetryPolicy};
use crate::error::{Error, Result};
use crate::hw_trait::I2c;
use crate::peripheral::nx20p348x::{
    decode_interrupts, decode_mode, decode_switch_status, encode_current_limit,
    encode_ovp_threshold, CurrentLimit, DeviceControl, OvpThreshold, RegisterMap, StatusDecoder,
    ILIM_MASK, OVLO_THRESHOLD_MASK,
};
use crate::ppc::fault::FaultReport;
use crate::ppc::port::{Port, PortIo, PortStatus};
use crate::ppc::types::{Faults, Mode, Polarity};
use crate::ppc::{PortEvent, PpcDriver};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Everything needed to bring up one port.
pub struct PortSetup<I2C> {
    pub config: PortConfig,
    pub map: &'static RegisterMap,
    pub i2c: I2C,
}

impl<I2C> PortSetup<I2C> {
    /// Port using the register map of its configured variant.
    pub fn new(config: PortConfig, i2c: I2C) -> Self {
        let map = config.variant.register_map();
        Self { config, map, i2c }
    }

    pub fn with_register_map(mut self, map: &'static RegisterMap) -> Self {
        self.map = map;
        self
    }
}

/// One register read for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDump {
    pub name: &'static str,
    pub address: u8,
    pub value: u8,
}

/// Power path controllers for all Type-C ports of a board.
pub struct Ppc<I2C> {
    ports: Vec<Port<I2C>>,
    retry: RetryPolicy,
    events: broadcast::Sender<PortEvent>,
}

impl<I2C: I2c> Ppc<I2C> {
    /// Create a driver for `ports`, indexed in the order given.
    pub fn new(ports: Vec<PortSetup<I2C>>, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ports = ports
            .into_iter()
            .enumerate()
            .map(|(index, setup)| {
                Port::new(index, setup.config, setup.map, setup.i2c, events.clone())
            })
            .collect();
        Self {
            ports,
            retry,
            events,
        }
    }

    /// Create a driver from a board table and one bus handle per port.
    pub fn from_config(board: &BoardConfig, buses: Vec<I2C>) -> Result<Self> {
        board.validate()?;
        if buses.len() != board.ports.len() {
            return Err(Error::InvalidConfiguration(format!(
                "{} ports configured but {} bus handles given",
                board.ports.len(),
                buses.len()
            )));
        }
        let setups = board
            .ports
            .iter()
            .cloned()
            .zip(buses)
            .map(|(config, i2c)| PortSetup::new(config, i2c))
            .collect();
        Ok(Self::new(setups, board.retry))
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Initialize every port concurrently. Results are in port order.
    pub async fn initialize_all(&self) -> Vec<Result<()>>
    where
        I2C: 'static,
    {
        join_all((0..self.ports.len()).map(|port| self.initialize(port))).await
    }

    fn port(&self, port: usize) -> Result<&Port<I2C>> {
        self.ports.get(port).ok_or(Error::InvalidPort(port))
    }

    fn notify_if_changed(&self, port: usize, before: Mode, after: Mode) {
        if before != after {
            trace!(port, "mode changed: {:?}", after);
            if self.events.send(PortEvent::ModeChanged { port, mode: after }).is_err() {
                trace!(port, "no port event subscribers");
            }
        }
    }
}

/// Flip VCONN off and back on around a polarity change so it is re-routed to
/// the new VCONN pin.
async fn reroute_vconn<I2C: I2c>(
    port: &Port<I2C>,
    io: &mut PortIo<I2C>,
    polarity: Polarity,
) -> Result<()> {
    let vconn = port.status().vconn_enabled;
    let bit = if vconn { io.map.vconn_enable } else { None };
    if let Some(bit) = bit {
        io.update(bit.register, bit.mask, 0).await?;
    }
    port.update_status(|s| s.polarity = polarity);
    if let Some(bit) = bit {
        io.update(bit.register, bit.mask, bit.mask).await?;
    }
    Ok(())
}

#[async_trait]
impl<I2C: I2c + 'static> PpcDriver for Ppc<I2C> {
    fn port_count(&self) -> usize {
        self.ports.len()
    }

    async fn initialize(&self, port: usize) -> Result<()> {
        let p = self.port(port)?;
        let limit = p.config.current_limit()?;
        let ovp = p.config.ovp_threshold()?;
        let before = p.status().mode;

        let mut io = p.io.lock().await;
        let map = io.map;

        let id = io.read(map.device_id).await?;
        info!(
            port,
            "{} on bus {} at 0x{:02X}, device id 0x{:02X}",
            map.name,
            p.config.bus,
            p.config.device_address(),
            id
        );
        if let Some(expected) = map.expected_id {
            if id != expected {
                return Err(Error::UnexpectedDeviceId {
                    port,
                    expected,
                    found: id,
                });
            }
        }

        io.mask_interrupts().await?;
        io.update(map.ovlo_threshold, OVLO_THRESHOLD_MASK, encode_ovp_threshold(ovp))
            .await?;
        io.update(map.src_5v_ocp_threshold, ILIM_MASK, encode_current_limit(limit))
            .await?;
        let frs = DeviceControl::FRS_AT.bits();
        let control = io
            .update(map.device_control, frs, if p.config.frs_enable { frs } else { 0 })
            .await?;

        let mode = decode_mode(io.read(map.device_status).await?).map_err(Error::codec(port))?;
        p.update_status(|s| s.set_mode(mode));
        let exited = if mode == Mode::DeadBattery && p.config.exit_dead_battery {
            p.exit_dead_battery(&mut io, Mode::Standby, &self.retry)
                .await
                .map(|_| ())
        } else {
            Ok(())
        };

        // Whatever latched before firmware took over
        let int1 = io.read(map.interrupt1).await?;
        let int2 = io.read(map.interrupt2).await?;
        let stale: Faults = decode_interrupts(int1, int2).into_iter().collect();
        if !stale.is_empty() {
            let desc: Vec<&str> = StatusDecoder::decode_interrupt1(int1)
                .into_iter()
                .chain(StatusDecoder::decode_interrupt2(int2))
                .collect();
            debug!(port, "cleared stale interrupts ({})", desc.join(", "));
        }
        io.unmask_interrupts().await?;

        let mode = decode_mode(io.read(map.device_status).await?).map_err(Error::codec(port))?;
        let switches = decode_switch_status(io.read(map.switch_status).await?)
            .map_err(Error::codec(port))?;
        if switches.active_path() != mode.path() && mode != Mode::DeadBattery {
            warn!(
                port,
                "mode {} but switch status reports {:?}",
                mode,
                switches.active_path()
            );
        }
        drop(io);

        let db_exit_error = stale.contains(Faults::DEAD_BATTERY_EXIT_ERROR);
        p.update_status(|s| {
            s.set_mode(mode);
            s.current_limit = Some(limit);
            s.ovp_threshold = Some(ovp);
            s.frs_enabled = control & frs != 0;
            s.vbus_discharge = control & DeviceControl::VBUSDIS_EN.bits() != 0;
            if db_exit_error {
                s.faults |= Faults::DEAD_BATTERY_EXIT_ERROR;
            }
        });
        self.notify_if_changed(port, before, mode);

        exited?;
        if db_exit_error {
            return Err(Error::DeadBatteryExitError { port });
        }
        info!(
            port,
            "initialized in {} mode, {} mA, OVP {} mV",
            mode,
            limit.milliamps(),
            ovp.millivolts()
        );
        Ok(())
    }

    async fn set_mode(&self, port: usize, mode: Mode) -> Result<()> {
        let p = self.port(port)?;
        let mut io = p.io.lock().await;
        let before = p.status().mode;
        let result = p.transition(&mut io, mode, &self.retry).await;
        let after = p.status().mode;
        drop(io);

        self.notify_if_changed(port, before, after);
        result.map(|_| ())
    }

    async fn set_current_limit(&self, port: usize, step: u8) -> Result<CurrentLimit> {
        let p = self.port(port)?;
        let limit = CurrentLimit::from_step(step)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;

        let mut io = p.io.lock().await;
        let map = io.map;
        io.update(map.src_5v_ocp_threshold, ILIM_MASK, encode_current_limit(limit))
            .await?;
        p.update_status(|s| s.current_limit = Some(limit));
        debug!(port, "5V source current limit {} mA", limit.milliamps());
        Ok(limit)
    }

    async fn set_ovp_threshold(&self, port: usize, level: u8) -> Result<OvpThreshold> {
        let p = self.port(port)?;
        let threshold = OvpThreshold::from_level(level)
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;

        let mut io = p.io.lock().await;
        let map = io.map;
        io.update(map.ovlo_threshold, OVLO_THRESHOLD_MASK, encode_ovp_threshold(threshold))
            .await?;
        p.update_status(|s| s.ovp_threshold = Some(threshold));
        debug!(port, "HV OVP threshold {} mV", threshold.millivolts());
        Ok(threshold)
    }

    async fn enable_vconn(&self, port: usize, enable: bool) -> Result<()> {
        let p = self.port(port)?;
        let mut io = p.io.lock().await;
        let Some(bit) = io.map.vconn_enable else {
            return Err(Error::NotSupported {
                feature: "VCONN switch",
                chip: io.map.name,
            });
        };
        io.update(bit.register, bit.mask, if enable { bit.mask } else { 0 })
            .await?;
        p.update_status(|s| s.vconn_enabled = enable);
        debug!(port, "VCONN {}", if enable { "on" } else { "off" });
        Ok(())
    }

    async fn set_polarity(&self, port: usize, polarity: Polarity) -> Result<()> {
        let p = self.port(port)?;
        let mut io = p.io.lock().await;
        io.mask_interrupts().await?;
        let rerouted = reroute_vconn(p, &mut io, polarity).await;
        io.unmask_interrupts().await?;
        rerouted?;
        debug!(port, "polarity {}", polarity);
        Ok(())
    }

    async fn discharge_vbus(&self, port: usize, enable: bool) -> Result<()> {
        let p = self.port(port)?;
        let mut io = p.io.lock().await;
        let map = io.map;
        let bit = DeviceControl::VBUSDIS_EN.bits();
        io.update(map.device_control, bit, if enable { bit } else { 0 })
            .await?;
        p.update_status(|s| s.vbus_discharge = enable);
        debug!(port, "VBUS discharge {}", if enable { "on" } else { "off" });
        Ok(())
    }

    async fn set_frs_enable(&self, port: usize, enable: bool) -> Result<()> {
        let p = self.port(port)?;
        let mut io = p.io.lock().await;
        let map = io.map;
        let bit = DeviceControl::FRS_AT.bits();
        io.update(map.device_control, bit, if enable { bit } else { 0 })
            .await?;
        p.update_status(|s| s.frs_enabled = enable);
        debug!(port, "fast role swap {}", if enable { "armed" } else { "disarmed" });
        Ok(())
    }

    async fn handle_interrupt(&self, port: usize) -> Result<Option<FaultReport>> {
        let p = self.port(port)?;
        let mut io = p.lock_for_interrupt().await;
        p.service_interrupt(&mut io, None).await
    }

    async fn acknowledge_faults(&self, port: usize) -> Result<Faults> {
        let p = self.port(port)?;
        let mut io = p.io.lock().await;
        p.acknowledge(&mut io).await
    }

    async fn clear_overcurrent_events(&self, port: usize) -> Result<()> {
        let p = self.port(port)?;
        let _io = p.io.lock().await;
        p.update_status(|s| s.overcurrent_events = 0);
        debug!(port, "overcurrent event count cleared");
        Ok(())
    }

    async fn dump_registers(&self, port: usize) -> Result<Vec<RegisterDump>> {
        let p = self.port(port)?;
        let mut io = p.io.lock().await;
        let map = io.map;
        let mut dump = Vec::new();
        for (name, address) in map.named_registers() {
            // Reading these would clear latched faults
            if address == map.interrupt1 || address == map.interrupt2 {
                continue;
            }
            let value = io.read(address).await?;
            debug!(port, "{:<22} [0x{:02X}] = 0x{:02X}", name, address, value);
            dump.push(RegisterDump {
                name,
                address,
                value,
            });
        }
        Ok(dump)
    }

    fn is_sourcing_vbus(&self, port: usize) -> Result<bool> {
        Ok(self.port(port)?.status().sourcing_vbus)
    }

    fn is_sinking_vbus(&self, port: usize) -> Result<bool> {
        Ok(self.port(port)?.status().sinking_vbus)
    }

    fn is_vconn_enabled(&self, port: usize) -> Result<bool> {
        Ok(self.port(port)?.status().vconn_enabled)
    }

    fn current_mode(&self, port: usize) -> Result<Mode> {
        Ok(self.port(port)?.status().mode)
    }

    fn latched_faults(&self, port: usize) -> Result<Faults> {
        Ok(self.port(port)?.status().faults)
    }

    fn is_latched_off(&self, port: usize) -> Result<bool> {
        Ok(self.port(port)?.status().is_latched_off())
    }

    fn status(&self, port: usize) -> Result<PortStatus> {
        Ok(self.port(port)?.status())
    }

    fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::nx20p348x::{
        registers, AddressStrap, Interrupt1, Interrupt2, RegisterBit, SwitchControl,
        NX20P3483_MAP,
    };
    use crate::ppc::port::OVERCURRENT_EVENT_THRESHOLD;
    use crate::transport::sim::{SimBus, SimNx20p348x, SIM_DEVICE_ID};
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    const PORT0: u8 = 0x70;
    const PORT1: u8 = 0x71;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            interval_ms: 10,
        }
    }

    fn setup(bus: &SimBus, strap: AddressStrap) -> PortSetup<SimBus> {
        PortSetup::new(PortConfig::new(0, strap), bus.clone())
    }

    /// One port on a chip that powered up in `mode`, not yet initialized.
    fn single(chip: SimNx20p348x) -> (Ppc<SimBus>, SimBus) {
        let bus = SimBus::new();
        bus.attach(PORT0, chip);
        let ppc = Ppc::new(vec![setup(&bus, AddressStrap::A0)], retry());
        (ppc, bus)
    }

    /// One initialized port in Standby with the write log cleared.
    async fn standby() -> (Ppc<SimBus>, SimBus) {
        let (ppc, bus) = single(SimNx20p348x::new(Mode::Standby));
        ppc.initialize(0).await.unwrap();
        bus.with_device(PORT0, |chip| chip.clear_writes());
        (ppc, bus)
    }

    fn writes(bus: &SimBus, address: u8) -> Vec<(u8, u8)> {
        bus.with_device(address, |chip| chip.writes().to_vec())
            .unwrap()
    }

    fn writes_to(bus: &SimBus, address: u8, register: u8) -> Vec<u8> {
        bus.with_device(address, |chip| chip.writes_to(register))
            .unwrap()
    }

    fn raise(bus: &SimBus, address: u8, int1: Interrupt1, int2: Interrupt2) {
        bus.with_device(address, |chip| chip.raise(int1, int2));
    }

    fn vconn_map() -> &'static RegisterMap {
        Box::leak(Box::new(RegisterMap {
            name: "NX20P3483-VCONN",
            vconn_enable: Some(RegisterBit {
                register: registers::DEVICE_CONTROL,
                mask: 0x80,
            }),
            ..NX20P3483_MAP.clone()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_exits_dead_battery_and_programs_limits() {
        let (ppc, bus) = single(SimNx20p348x::default());
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::DeadBattery);
        assert!(ppc.is_sinking_vbus(0).unwrap());

        ppc.initialize(0).await.unwrap();

        assert_eq!(ppc.current_mode(0).unwrap(), Mode::Standby);
        assert!(!ppc.is_sinking_vbus(0).unwrap());
        assert!(!ppc.is_sourcing_vbus(0).unwrap());
        assert_eq!(writes_to(&bus, PORT0, registers::OVLO_THRESHOLD), vec![0x06]);
        assert_eq!(writes_to(&bus, PORT0, registers::SRC_5V_OCP_THRESHOLD), vec![0x0D]);
        assert_eq!(writes_to(&bus, PORT0, registers::INTERRUPT1_MASK), vec![0x00, 0xFF]);
        assert_eq!(writes_to(&bus, PORT0, registers::INTERRUPT2_MASK), vec![0x00, 0xFF]);

        let status = ppc.status(0).unwrap();
        assert_eq!(status.current_limit, Some(CurrentLimit::Ma3000));
        assert_eq!(status.ovp_threshold, Some(OvpThreshold::V23_0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_clears_stale_interrupts() {
        let (ppc, bus) = single(SimNx20p348x::new(Mode::Standby));
        raise(&bus, PORT0, Interrupt1::OTP, Interrupt2::empty());

        ppc.initialize(0).await.unwrap();

        assert!(ppc.latched_faults(0).unwrap().is_empty());
        assert_eq!(ppc.handle_interrupt(0).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_reports_stale_dead_battery_exit_error() {
        let (ppc, bus) = single(SimNx20p348x::new(Mode::Standby));
        raise(&bus, PORT0, Interrupt1::DBEXIT_ERR, Interrupt2::empty());

        let err = ppc.initialize(0).await.unwrap_err();
        assert!(matches!(err, Error::DeadBatteryExitError { port: 0 }));
        assert!(ppc
            .latched_faults(0)
            .unwrap()
            .contains(Faults::DEAD_BATTERY_EXIT_ERROR));
        assert!(matches!(
            ppc.set_mode(0, Mode::HvSink).await,
            Err(Error::FaultPending { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_rejects_bad_limits_without_io() {
        let bus = SimBus::new();
        bus.attach(PORT0, SimNx20p348x::new(Mode::Standby));
        let mut config = PortConfig::new(0, AddressStrap::A0);
        config.current_limit_ma = 3100;
        let ppc = Ppc::new(vec![PortSetup::new(config, bus.clone())], retry());

        assert!(matches!(
            ppc.initialize(0).await,
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(writes(&bus, PORT0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_mode_is_a_no_op() {
        let (ppc, bus) = standby().await;
        ppc.set_mode(0, Mode::Standby).await.unwrap();
        assert!(writes(&bus, PORT0).is_empty());

        ppc.set_mode(0, Mode::HvSink).await.unwrap();
        bus.with_device(PORT0, |chip| chip.clear_writes());
        ppc.set_mode(0, Mode::HvSink).await.unwrap();
        assert!(writes(&bus, PORT0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_volt_source_confirmed_on_first_poll() {
        let (ppc, bus) = standby().await;

        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();

        assert_eq!(ppc.current_mode(0).unwrap(), Mode::FiveVSource);
        assert!(ppc.is_sourcing_vbus(0).unwrap());
        assert!(!ppc.is_sinking_vbus(0).unwrap());
        assert_eq!(
            writes(&bus, PORT0),
            vec![(registers::SWITCH_CONTROL, SwitchControl::SRC_5V_EN.bits())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sourcing_and_sinking_never_both_set() {
        let (ppc, _bus) = standby().await;
        for mode in [
            Mode::HvSink,
            Mode::FiveVSource,
            Mode::HvSource,
            Mode::Standby,
            Mode::HvSink,
        ] {
            ppc.set_mode(0, mode).await.unwrap();
            let status = ppc.status(0).unwrap();
            assert_eq!(status.mode, mode);
            assert!(!(status.sourcing_vbus && status.sinking_vbus));
            assert_eq!(status.sourcing_vbus, mode.is_source());
            assert_eq!(status.sinking_vbus, mode.is_sink());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_latency_within_retry_budget() {
        let mut chip = SimNx20p348x::new(Mode::Standby);
        chip.switch_latency = 2;
        let (ppc, _bus) = single(chip);
        ppc.initialize(0).await.unwrap();

        ppc.set_mode(0, Mode::HvSink).await.unwrap();
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::HvSink);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_switch_times_out_in_standby() {
        let mut chip = SimNx20p348x::new(Mode::Standby);
        chip.stuck_switch = true;
        let (ppc, bus) = single(chip);
        ppc.initialize(0).await.unwrap();

        let err = ppc.set_mode(0, Mode::HvSource).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransitionTimeout {
                port: 0,
                target: Mode::HvSource
            }
        ));
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::Standby);
        assert!(!ppc.is_sourcing_vbus(0).unwrap());
        assert_eq!(
            writes_to(&bus, PORT0, registers::SWITCH_CONTROL),
            vec![SwitchControl::HVSRC_EN.bits(), 0x00]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_dead_battery_times_out() {
        let mut chip = SimNx20p348x::default();
        chip.stuck_dead_battery = true;
        let (ppc, _bus) = single(chip);

        let err = ppc.set_mode(0, Mode::HvSink).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TransitionTimeout {
                port: 0,
                target: Mode::HvSink
            }
        ));
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::DeadBattery);
        assert!(ppc.is_sinking_vbus(0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_battery_straight_to_sink() {
        let (ppc, bus) = single(SimNx20p348x::default());

        ppc.set_mode(0, Mode::HvSink).await.unwrap();

        assert_eq!(ppc.current_mode(0).unwrap(), Mode::HvSink);
        assert_eq!(
            writes_to(&bus, PORT0, registers::DEVICE_CONTROL),
            vec![DeviceControl::DB_EXIT.bits()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_battery_is_not_a_target() {
        let (ppc, bus) = standby().await;
        let err = ppc.set_mode(0, Mode::DeadBattery).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Mode::Standby,
                to: Mode::DeadBattery,
                ..
            }
        ));
        assert!(writes(&bus, PORT0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_swap_goes_through_standby_masked() {
        let (ppc, bus) = standby().await;
        ppc.set_mode(0, Mode::HvSink).await.unwrap();
        bus.with_device(PORT0, |chip| chip.clear_writes());

        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();

        assert_eq!(
            writes(&bus, PORT0),
            vec![
                (registers::INTERRUPT1_MASK, 0x00),
                (registers::INTERRUPT2_MASK, 0x00),
                (registers::SWITCH_CONTROL, 0x00),
                (registers::SWITCH_CONTROL, SwitchControl::SRC_5V_EN.bits()),
                (registers::INTERRUPT1_MASK, 0xFF),
                (registers::INTERRUPT2_MASK, 0xFF),
            ]
        );
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::FiveVSource);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overcurrent_interrupt_shuts_down_source() {
        let (ppc, bus) = standby().await;
        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();
        bus.with_device(PORT0, |chip| chip.clear_writes());
        raise(&bus, PORT0, Interrupt1::from_bits_truncate(0x02), Interrupt2::empty());

        let report = ppc.handle_interrupt(0).await.unwrap().unwrap();

        assert!(report.shutdown);
        assert_eq!(report.mode, Mode::Standby);
        assert_eq!(report.observed, Faults::OVERCURRENT);
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::Standby);
        assert_eq!(ppc.latched_faults(0).unwrap(), Faults::OVERCURRENT);
        assert_eq!(writes_to(&bus, PORT0, registers::SWITCH_CONTROL), vec![0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_faults_one_shutdown_write() {
        let (ppc, bus) = standby().await;
        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();
        bus.with_device(PORT0, |chip| chip.clear_writes());
        raise(
            &bus,
            PORT0,
            Interrupt1::OC_5VSRC,
            Interrupt2::OV_HVSRC,
        );

        let report = ppc.handle_interrupt(0).await.unwrap().unwrap();

        assert_eq!(report.events.len(), 2);
        assert_eq!(report.latched, Faults::OVERVOLTAGE | Faults::OVERCURRENT);
        assert_eq!(writes_to(&bus, PORT0, registers::SWITCH_CONTROL), vec![0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_temperature_is_recorded_only() {
        let (ppc, bus) = standby().await;
        ppc.set_mode(0, Mode::HvSink).await.unwrap();
        raise(&bus, PORT0, Interrupt1::OTP, Interrupt2::empty());

        let report = ppc.handle_interrupt(0).await.unwrap().unwrap();

        assert!(!report.shutdown);
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::HvSink);
        assert_eq!(ppc.latched_faults(0).unwrap(), Faults::OVER_TEMPERATURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spurious_interrupt() {
        let (ppc, bus) = standby().await;
        let mut events = ppc.subscribe();

        assert_eq!(ppc.handle_interrupt(0).await.unwrap(), None);
        assert!(ppc.latched_faults(0).unwrap().is_empty());
        assert!(writes(&bus, PORT0).is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_blocks_source_until_acknowledged() {
        let (ppc, bus) = standby().await;
        ppc.set_mode(0, Mode::HvSource).await.unwrap();
        raise(&bus, PORT0, Interrupt1::empty(), Interrupt2::SC_HVSRC);
        ppc.handle_interrupt(0).await.unwrap();
        bus.with_device(PORT0, |chip| chip.clear_writes());

        assert!(matches!(
            ppc.set_mode(0, Mode::FiveVSource).await,
            Err(Error::FaultPending { port: 0, .. })
        ));
        assert!(writes(&bus, PORT0).is_empty());
        // Sinking is still allowed
        ppc.set_mode(0, Mode::HvSink).await.unwrap();
        ppc.set_mode(0, Mode::Standby).await.unwrap();

        assert!(ppc.acknowledge_faults(0).await.unwrap().is_empty());
        assert!(ppc.latched_faults(0).unwrap().is_empty());
        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_keeps_asserted_faults() {
        let (ppc, bus) = standby().await;
        raise(&bus, PORT0, Interrupt1::OV_5VSRC, Interrupt2::empty());
        let report = ppc.handle_interrupt(0).await.unwrap().unwrap();
        // Nothing to shut down in Standby
        assert!(!report.shutdown);
        assert_eq!(report.mode, Mode::Standby);
        assert!(writes_to(&bus, PORT0, registers::SWITCH_CONTROL).is_empty());
        // Condition still present when acknowledged
        raise(&bus, PORT0, Interrupt1::OV_5VSRC, Interrupt2::empty());

        assert_eq!(ppc.acknowledge_faults(0).await.unwrap(), Faults::OVERVOLTAGE);
        assert_eq!(ppc.latched_faults(0).unwrap(), Faults::OVERVOLTAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_overcurrent_latches_port_off() {
        let (ppc, bus) = standby().await;
        for _ in 0..OVERCURRENT_EVENT_THRESHOLD {
            ppc.set_mode(0, Mode::FiveVSource).await.unwrap();
            raise(&bus, PORT0, Interrupt1::OC_5VSRC, Interrupt2::empty());
            ppc.handle_interrupt(0).await.unwrap();
            ppc.acknowledge_faults(0).await.unwrap();
        }

        assert!(ppc.is_latched_off(0).unwrap());
        assert!(ppc.latched_faults(0).unwrap().is_empty());
        assert!(matches!(
            ppc.set_mode(0, Mode::FiveVSource).await,
            Err(Error::FaultPending { .. })
        ));
        ppc.set_mode(0, Mode::HvSink).await.unwrap();

        ppc.clear_overcurrent_events(0).await.unwrap();
        assert!(!ppc.is_latched_off(0).unwrap());
        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();
    }

    /// Initialized Standby port whose switches take two polls to close.
    async fn slow_switch() -> (Arc<Ppc<SimBus>>, SimBus) {
        let mut chip = SimNx20p348x::new(Mode::Standby);
        chip.switch_latency = 2;
        let (ppc, bus) = single(chip);
        ppc.initialize(0).await.unwrap();
        bus.with_device(PORT0, |chip| chip.clear_writes());
        (Arc::new(ppc), bus)
    }

    /// Start a transition and return once its switch write is on the bus.
    async fn start_transition(
        ppc: &Arc<Ppc<SimBus>>,
        bus: &SimBus,
        mode: Mode,
    ) -> JoinHandle<Result<()>> {
        let transition = {
            let ppc = ppc.clone();
            tokio::spawn(async move { ppc.set_mode(0, mode).await })
        };
        while writes_to(bus, PORT0, registers::SWITCH_CONTROL).is_empty() {
            tokio::task::yield_now().await;
        }
        transition
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_path_fault_aborts_pending_transition() {
        let (ppc, bus) = slow_switch().await;
        let mut events = ppc.subscribe();
        let transition = start_transition(&ppc, &bus, Mode::FiveVSource).await;
        raise(&bus, PORT0, Interrupt1::OC_5VSRC, Interrupt2::empty());

        // Serviced by the transition before this handler gets the port
        assert_eq!(ppc.handle_interrupt(0).await.unwrap(), None);
        let result = transition.await.unwrap();

        assert!(matches!(
            result,
            Err(Error::TransitionAborted {
                port: 0,
                target: Mode::FiveVSource
            })
        ));
        assert_eq!(
            events.try_recv().unwrap(),
            PortEvent::Fault {
                port: 0,
                mode: Mode::Standby,
                observed: Faults::OVERCURRENT,
                latched: Faults::OVERCURRENT,
                shutdown: true,
            }
        );
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::Standby);
        assert_eq!(
            writes_to(&bus, PORT0, registers::SWITCH_CONTROL),
            vec![SwitchControl::SRC_5V_EN.bits(), 0x00]
        );
        assert!(matches!(
            ppc.set_mode(0, Mode::FiveVSource).await,
            Err(Error::FaultPending { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermal_interrupt_does_not_abort_transition() {
        let (ppc, bus) = slow_switch().await;
        let mut events = ppc.subscribe();
        let transition = start_transition(&ppc, &bus, Mode::FiveVSource).await;
        raise(&bus, PORT0, Interrupt1::OTP, Interrupt2::empty());

        assert_eq!(ppc.handle_interrupt(0).await.unwrap(), None);
        transition.await.unwrap().unwrap();

        assert_eq!(ppc.current_mode(0).unwrap(), Mode::FiveVSource);
        assert!(ppc.is_sourcing_vbus(0).unwrap());
        assert_eq!(ppc.latched_faults(0).unwrap(), Faults::OVER_TEMPERATURE);
        assert!(matches!(
            events.try_recv().unwrap(),
            PortEvent::Fault {
                observed: Faults::OVER_TEMPERATURE,
                shutdown: false,
                ..
            }
        ));
        assert_eq!(
            writes_to(&bus, PORT0, registers::SWITCH_CONTROL),
            vec![SwitchControl::SRC_5V_EN.bits()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_spurious_interrupt_does_not_abort_transition() {
        let (ppc, bus) = slow_switch().await;
        let transition = start_transition(&ppc, &bus, Mode::HvSink).await;

        assert_eq!(ppc.handle_interrupt(0).await.unwrap(), None);
        transition.await.unwrap().unwrap();

        assert_eq!(ppc.current_mode(0).unwrap(), Mode::HvSink);
        assert!(ppc.latched_faults(0).unwrap().is_empty());
        assert_eq!(
            writes_to(&bus, PORT0, registers::SWITCH_CONTROL),
            vec![SwitchControl::HVSNK_EN.bits()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_battery_fault_left_to_hardware() {
        let (ppc, bus) = single(SimNx20p348x::default());
        raise(&bus, PORT0, Interrupt1::empty(), Interrupt2::OV_HVSNK);

        let report = ppc.handle_interrupt(0).await.unwrap().unwrap();

        assert!(!report.shutdown);
        assert_eq!(report.mode, Mode::DeadBattery);
        assert_eq!(ppc.latched_faults(0).unwrap(), Faults::OVERVOLTAGE);
        assert!(ppc.is_sinking_vbus(0).unwrap());
        assert!(writes(&bus, PORT0).is_empty());
        assert_eq!(
            bus.with_device(PORT0, |chip| chip.mode()),
            Some(Mode::DeadBattery)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_checks_pinned_device_id() {
        let bus = SimBus::new();
        bus.attach(PORT0, SimNx20p348x::new(Mode::Standby));
        let wrong: &'static RegisterMap = Box::leak(Box::new(RegisterMap {
            expected_id: Some(SIM_DEVICE_ID + 1),
            ..NX20P3483_MAP.clone()
        }));
        let port = setup(&bus, AddressStrap::A0).with_register_map(wrong);
        let ppc = Ppc::new(vec![port], retry());

        assert!(matches!(
            ppc.initialize(0).await,
            Err(Error::UnexpectedDeviceId {
                port: 0,
                found: SIM_DEVICE_ID,
                ..
            })
        ));
        assert!(writes(&bus, PORT0).is_empty());

        let right: &'static RegisterMap = Box::leak(Box::new(RegisterMap {
            expected_id: Some(SIM_DEVICE_ID),
            ..NX20P3483_MAP.clone()
        }));
        let port = setup(&bus, AddressStrap::A0).with_register_map(right);
        let ppc = Ppc::new(vec![port], retry());
        ppc.initialize(0).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_limit_out_of_range_writes_nothing() {
        let (ppc, bus) = standby().await;

        assert!(matches!(
            ppc.set_current_limit(0, 16).await,
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(writes(&bus, PORT0).is_empty());
        assert_eq!(
            ppc.status(0).unwrap().current_limit,
            Some(CurrentLimit::Ma3000)
        );

        assert_eq!(ppc.set_current_limit(0, 5).await.unwrap(), CurrentLimit::Ma1400);
        assert_eq!(
            bus.with_device(PORT0, |chip| chip.register(registers::SRC_5V_OCP_THRESHOLD)),
            Some(0x05)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ovp_threshold() {
        let (ppc, bus) = standby().await;

        assert!(matches!(
            ppc.set_ovp_threshold(0, 7).await,
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(writes(&bus, PORT0).is_empty());

        assert_eq!(ppc.set_ovp_threshold(0, 2).await.unwrap(), OvpThreshold::V10_0);
        assert_eq!(writes_to(&bus, PORT0, registers::OVLO_THRESHOLD), vec![0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vconn_unsupported_on_reference_map() {
        let (ppc, bus) = standby().await;

        assert!(matches!(
            ppc.enable_vconn(0, true).await,
            Err(Error::NotSupported { .. })
        ));
        assert!(!ppc.is_vconn_enabled(0).unwrap());
        assert!(writes(&bus, PORT0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vconn_and_polarity_with_vconn_switch() {
        let bus = SimBus::new();
        bus.attach(PORT0, SimNx20p348x::new(Mode::Standby));
        let port = setup(&bus, AddressStrap::A0).with_register_map(vconn_map());
        let ppc = Ppc::new(vec![port], retry());
        ppc.initialize(0).await.unwrap();

        ppc.enable_vconn(0, true).await.unwrap();
        assert!(ppc.is_vconn_enabled(0).unwrap());
        bus.with_device(PORT0, |chip| chip.clear_writes());

        ppc.set_polarity(0, Polarity::Cc2).await.unwrap();

        assert_eq!(ppc.status(0).unwrap().polarity, Polarity::Cc2);
        assert!(ppc.is_vconn_enabled(0).unwrap());
        assert_eq!(
            writes(&bus, PORT0),
            vec![
                (registers::INTERRUPT1_MASK, 0x00),
                (registers::INTERRUPT2_MASK, 0x00),
                (registers::DEVICE_CONTROL, 0x00),
                (registers::DEVICE_CONTROL, 0x80),
                (registers::INTERRUPT1_MASK, 0xFF),
                (registers::INTERRUPT2_MASK, 0xFF),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discharge_and_fast_role_swap() {
        let (ppc, bus) = standby().await;

        ppc.discharge_vbus(0, true).await.unwrap();
        ppc.set_frs_enable(0, true).await.unwrap();
        let status = ppc.status(0).unwrap();
        assert!(status.vbus_discharge && status.frs_enabled);

        ppc.discharge_vbus(0, false).await.unwrap();
        assert!(!ppc.status(0).unwrap().vbus_discharge);
        let control = bus
            .with_device(PORT0, |chip| chip.register(registers::DEVICE_CONTROL))
            .unwrap();
        assert_eq!(control, DeviceControl::FRS_AT.bits());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_registers_leaves_interrupts_latched() {
        let (ppc, bus) = standby().await;
        raise(&bus, PORT0, Interrupt1::OTP, Interrupt2::empty());

        let dump = ppc.dump_registers(0).await.unwrap();

        assert_eq!(dump.len(), 10);
        assert!(dump.iter().all(|r| r.name != "INTERRUPT1" && r.name != "INTERRUPT2"));
        assert!(dump.contains(&RegisterDump {
            name: "DEVICE_ID",
            address: registers::DEVICE_ID,
            value: SIM_DEVICE_ID,
        }));
        assert!(ppc.handle_interrupt(0).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_communication_error_leaves_state() {
        let (ppc, bus) = standby().await;
        bus.with_device(PORT0, |chip| chip.offline = true);

        let err = ppc.set_mode(0, Mode::HvSink).await.unwrap_err();
        assert!(matches!(err, Error::Communication { port: 0, .. }));
        assert_eq!(ppc.current_mode(0).unwrap(), Mode::Standby);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ports_are_independent() {
        let bus = SimBus::new();
        bus.attach(PORT0, SimNx20p348x::new(Mode::Standby));
        bus.attach(PORT1, SimNx20p348x::new(Mode::Standby));
        let ppc = Ppc::new(
            vec![setup(&bus, AddressStrap::A0), setup(&bus, AddressStrap::A1)],
            retry(),
        );
        for result in ppc.initialize_all().await {
            result.unwrap();
        }
        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();
        ppc.set_mode(1, Mode::FiveVSource).await.unwrap();

        raise(&bus, PORT1, Interrupt1::SC_5VSRC, Interrupt2::empty());
        ppc.handle_interrupt(1).await.unwrap();

        assert_eq!(ppc.current_mode(0).unwrap(), Mode::FiveVSource);
        assert!(ppc.latched_faults(0).unwrap().is_empty());
        assert_eq!(ppc.current_mode(1).unwrap(), Mode::Standby);
        assert_eq!(ppc.latched_faults(1).unwrap(), Faults::SHORT_CIRCUIT);
        assert!(matches!(ppc.current_mode(2), Err(Error::InvalidPort(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_published() {
        let (ppc, bus) = standby().await;
        let mut events = ppc.subscribe();

        ppc.set_mode(0, Mode::FiveVSource).await.unwrap();
        raise(&bus, PORT0, Interrupt1::OC_5VSRC, Interrupt2::empty());
        ppc.handle_interrupt(0).await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            PortEvent::ModeChanged {
                port: 0,
                mode: Mode::FiveVSource
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PortEvent::Fault {
                port: 0,
                mode: Mode::Standby,
                observed: Faults::OVERCURRENT,
                latched: Faults::OVERCURRENT,
                shutdown: true,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_from_config_needs_a_bus_per_port() {
        let board = BoardConfig::from_json(
            r#"{"ports": [{"bus": 0, "strap": "A0"}, {"bus": 0, "strap": "A1"}]}"#,
        )
        .unwrap();
        let bus = SimBus::new();

        assert!(matches!(
            Ppc::from_config(&board, vec![bus.clone()]),
            Err(Error::InvalidConfiguration(_))
        ));
        let ppc = Ppc::from_config(&board, vec![bus.clone(), bus]).unwrap();
        assert_eq!(ppc.port_count(), 2);
    }
}
