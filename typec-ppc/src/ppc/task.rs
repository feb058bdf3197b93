//! Interrupt bottom half.
//!
//! The interrupt line handler only records which port fired through an
//! [`InterruptSender`]; [`interrupt_task`] does the bus work in task context.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::ppc::PpcDriver;
use crate::tracing::prelude::*;

/// Cheap handle for signalling that a port's interrupt line fired.
#[derive(Debug, Clone)]
pub struct InterruptSender {
    tx: mpsc::Sender<usize>,
}

impl InterruptSender {
    /// Queue `port` for servicing. Never blocks; when the queue is full the
    /// port is already pending and the next service pass will see its
    /// latched bits.
    pub fn notify(&self, port: usize) {
        match self.tx.try_send(port) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(port, "interrupt queue full, dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                trace!(port, "interrupt task gone");
            }
        }
    }
}

/// Create a bounded interrupt queue holding up to `depth` notifications.
pub fn interrupt_channel(depth: usize) -> (InterruptSender, mpsc::Receiver<usize>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (InterruptSender { tx }, rx)
}

/// Service queued interrupts until `running` is cancelled or every sender
/// is dropped.
pub async fn interrupt_task(
    driver: Arc<dyn PpcDriver>,
    mut rx: mpsc::Receiver<usize>,
    running: CancellationToken,
) {
    trace!("Task started.");

    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            port = rx.recv() => {
                let Some(port) = port else { break };
                match driver.handle_interrupt(port).await {
                    Ok(Some(report)) => {
                        debug!(
                            port,
                            latched = %report.latched,
                            shutdown = report.shutdown,
                            "Interrupt serviced"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => error!(port, error = %e, "Failed to service interrupt"),
                }
            }
        }
    }

    trace!("Task stopped.");
}
