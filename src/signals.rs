//! Signal handling (§4.7, §7). Wraps `signal_hook`'s self-pipe backed
//! iterator so the main loop can `poll()` the same way it polls the
//! event transport, draining whichever signals arrived between
//! iterations rather than doing any work from signal context — the
//! same no-work-in-handler discipline as the teacher's
//! `core::env::install_signal_handlers`.
//!
//! BSD's `SIGINFO` (dump-registry) has no Linux equivalent; `SIGUSR2` is
//! used in its place, a deliberate platform substitution (SPEC_FULL §7).

use crate::error::{self, StartupError};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use snafu::ResultExt;
use std::os::unix::io::{AsRawFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Rescan,
    DumpRegistry,
    Terminate,
}

pub struct SignalHandler {
    signals: Signals,
}

impl SignalHandler {
    pub fn install() -> Result<Self, StartupError> {
        let signals =
            Signals::new(&[SIGHUP, SIGUSR1, SIGUSR2, SIGINT, SIGTERM]).context(error::SignalInstall)?;
        Ok(Self { signals })
    }

    /// Drain every signal delivered since the last call, without
    /// blocking.
    pub fn drain(&mut self) -> Vec<SignalKind> {
        self.signals
            .pending()
            .filter_map(|signo| match signo {
                SIGHUP | SIGUSR1 => Some(SignalKind::Rescan),
                SIGUSR2 => Some(SignalKind::DumpRegistry),
                SIGINT | SIGTERM => Some(SignalKind::Terminate),
                _ => None,
            })
            .collect()
    }
}

impl AsRawFd for SignalHandler {
    fn as_raw_fd(&self) -> RawFd {
        self.signals.as_raw_fd()
    }
}
