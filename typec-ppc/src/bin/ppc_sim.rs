//! Run the power path controller driver against simulated NX20P348x chips.
//!
//! Usage: `ppc-sim [board.json]`. Without a board file, two ports on bus 0
//! are simulated. Every port powers up in dead-battery mode, is brought
//! under control, and then a short role sequence with one injected
//! overcurrent fault is played on port 0. Port events are logged until
//! SIGINT or SIGTERM.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use typec_ppc::config::{BoardConfig, PortConfig, RetryPolicy};
use typec_ppc::peripheral::nx20p348x::{AddressStrap, Interrupt1, Interrupt2};
use typec_ppc::ppc::task::{interrupt_channel, interrupt_task, InterruptSender};
use typec_ppc::ppc::{Mode, PortEvent, Ppc, PpcDriver};
use typec_ppc::tracing::{self, prelude::*};
use typec_ppc::transport::sim::{SimBus, SimNx20p348x};

fn default_board() -> BoardConfig {
    BoardConfig {
        ports: vec![
            PortConfig::new(0, AddressStrap::A0),
            PortConfig::new(0, AddressStrap::A1),
        ],
        retry: RetryPolicy::from_env(),
        event_queue_depth: 8,
    }
}

fn load_board() -> Result<BoardConfig> {
    match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => BoardConfig::load_from(&path)
            .with_context(|| format!("loading board config {}", path.display())),
        None => {
            let board = default_board();
            board.validate().context("default board config")?;
            Ok(board)
        }
    }
}

/// One simulated bus per configured bus number, with a chip at every port's
/// address.
fn simulated_buses(board: &BoardConfig) -> (Vec<SimBus>, Vec<(SimBus, u8)>) {
    let mut buses: HashMap<u8, SimBus> = HashMap::new();
    let mut handles = Vec::new();
    let mut chips = Vec::new();
    for port in &board.ports {
        let bus = buses.entry(port.bus).or_default().clone();
        let mut chip = SimNx20p348x::default();
        chip.switch_latency = 1;
        bus.attach(port.device_address(), chip);
        chips.push((bus.clone(), port.device_address()));
        handles.push(bus);
    }
    (handles, chips)
}

async fn log_events(mut events: broadcast::Receiver<PortEvent>, running: CancellationToken) {
    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            event = events.recv() => {
                match event {
                    Ok(PortEvent::ModeChanged { port, mode }) => {
                        info!(port, %mode, "Mode changed");
                    }
                    Ok(PortEvent::Fault { port, mode, observed, latched, shutdown }) => {
                        warn!(port, %mode, %observed, %latched, shutdown, "Fault");
                    }
                    Err(RecvError::Lagged(n)) => warn!("Missed {} port events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Source, fault, recover and sink on port 0.
async fn demo(driver: Arc<dyn PpcDriver>, chip: (SimBus, u8), irq: InterruptSender) {
    let (bus, address) = chip;
    let pause = Duration::from_millis(500);

    if let Err(e) = driver.set_mode(0, Mode::FiveVSource).await {
        error!(error = %e, "Failed to source 5V");
        return;
    }
    tokio::time::sleep(pause).await;

    info!("Injecting 5V source overcurrent on port 0");
    bus.with_device(address, |chip| chip.raise(Interrupt1::OC_5VSRC, Interrupt2::empty()));
    irq.notify(0);
    tokio::time::sleep(pause).await;

    match driver.set_mode(0, Mode::FiveVSource).await {
        Err(e) => info!(error = %e, "Source refused as expected"),
        Ok(()) => warn!("Source allowed with a fault latched"),
    }
    match driver.acknowledge_faults(0).await {
        Ok(remaining) => info!(%remaining, "Faults acknowledged"),
        Err(e) => error!(error = %e, "Failed to acknowledge faults"),
    }

    for mode in [Mode::FiveVSource, Mode::HvSink] {
        if let Err(e) = driver.set_mode(0, mode).await {
            error!(error = %e, %mode, "Transition failed");
        }
        tokio::time::sleep(pause).await;
    }

    match driver.dump_registers(0).await {
        Ok(dump) => {
            for reg in dump {
                debug!("{:<22} [0x{:02X}] = 0x{:02X}", reg.name, reg.address, reg.value);
            }
        }
        Err(e) => error!(error = %e, "Failed to dump registers"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let board = load_board()?;
    let (buses, chips) = simulated_buses(&board);
    let ppc = Ppc::from_config(&board, buses).context("creating driver")?;

    for (port, result) in ppc.initialize_all().await.into_iter().enumerate() {
        if let Err(e) = result {
            error!(port, error = %e, "Initialization failed");
        }
    }
    let driver: Arc<dyn PpcDriver> = Arc::new(ppc);

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (irq, rx) = interrupt_channel(board.event_queue_depth);
    tracker.spawn(interrupt_task(driver.clone(), rx, running.clone()));
    tracker.spawn(log_events(driver.subscribe(), running.clone()));
    if let Some(chip) = chips.into_iter().next() {
        tracker.spawn(demo(driver.clone(), chip, irq.clone()));
    }
    tracker.close();
    info!(ports = driver.port_count(), "Started.");

    let mut sigint = unix::signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm =
        unix::signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    drop(irq);

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
