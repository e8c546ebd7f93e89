use crate::error::NapError;
use log::{info, warn};
use std::fmt;
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeReason {
    MaxDuration,
    PostRem,
}

impl fmt::Display for WakeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeReason::MaxDuration => f.write_str("max duration"),
            WakeReason::PostRem => f.write_str("post-REM"),
        }
    }
}

/// Something that can get the sleeper's attention.
///
/// Called at most once per session and never retried. Implementations
/// should return quickly; the controller holds its state lock while waking.
pub trait WakeSink: Send + Sync {
    fn wake(&self, reason: WakeReason) -> Result<(), NapError>;
}

/// Rings the terminal bell and prints the wake reason.
pub struct TerminalAlarm<W: Write + Send> {
    out: Mutex<W>,
    bells: u32,
}

impl TerminalAlarm<std::io::Stdout> {
    pub fn stdout(bells: u32) -> Self {
        Self::new(std::io::stdout(), bells)
    }
}

impl<W: Write + Send> TerminalAlarm<W> {
    pub fn new(out: W, bells: u32) -> Self {
        Self {
            out: Mutex::new(out),
            bells,
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> WakeSink for TerminalAlarm<W> {
    fn wake(&self, reason: WakeReason) -> Result<(), NapError> {
        info!("Alarm triggered: {}", reason);
        let mut out = self
            .out
            .lock()
            .map_err(|_| NapError::SinkFailure("alarm output lock poisoned".to_string()))?;

        let bells = "\x07".repeat(self.bells as usize);
        writeln!(out, "{}Wake up! ({})", bells, reason)
            .and_then(|_| out.flush())
            .map_err(|e| {
                warn!("Failed to sound alarm: {}", e);
                NapError::SinkFailure(e.to_string())
            })
    }
}
