//! Logging setup for programs built on the driver.
//!
//! A program calls [`init_journald_or_stdout`] once at startup to install a
//! subscriber. Modules can `use crate::tracing::prelude::*` for the
//! `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()` macros.
//!
//! Levels used by the driver:
//!
//! - TRACE: every register read and write, poll progress and event sends.
//!   `RUST_LOG=typec_ppc=trace` shows each bus transaction.
//! - DEBUG: confirmed mode transitions, limit and threshold changes,
//!   spurious interrupts.
//! - INFO: port initialization, fault acknowledgement and overcurrent
//!   events below the latch-off count.
//! - WARN: decoded interrupt registers, transitions given up on a fault,
//!   faults left to hardware in dead-battery mode.
//! - ERROR: protective shutdowns, latch-off, dead-battery exit errors and
//!   switch timeouts.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout();
    }
}

// Log to stdout, filtered by RUST_LOG with INFO as the default level.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Local time to the millisecond; interrupt and switch timing is easier to
// read than with the default UTC timestamps.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
