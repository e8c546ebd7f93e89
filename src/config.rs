use crate::error::NapError;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MAX_MINUTES: i64 = 30;
pub const DEFAULT_REM_MINUTES: i64 = 10;

/// Durations that drive one nap session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NapConfig {
    /// Hard cap: wake no later than this after the session starts.
    pub max_duration: Duration,
    /// How long to let the sleeper stay in REM before waking them.
    pub rem_followup: Duration,
    /// Skip observations that ended before the session started.
    pub ignore_stale: bool,
}

impl NapConfig {
    pub fn new(max_duration: Duration, rem_followup: Duration) -> Self {
        Self {
            max_duration,
            rem_followup,
            ignore_stale: false,
        }
    }

    /// Builds a config from user-entered minute counts.
    pub fn from_minutes(max_minutes: i64, rem_minutes: i64) -> Result<Self, NapError> {
        let minutes = |value: i64, name: &str| {
            if value <= 0 {
                Err(NapError::InvalidConfig(format!(
                    "{} must be a positive number of minutes, got {}",
                    name, value
                )))
            } else {
                (value as u64)
                    .checked_mul(60)
                    .map(Duration::from_secs)
                    .ok_or_else(|| {
                        NapError::InvalidConfig(format!("{} of {} minutes is too long", name, value))
                    })
            }
        };
        Ok(Self::new(
            minutes(max_minutes, "max nap duration")?,
            minutes(rem_minutes, "alarm after REM")?,
        ))
    }

    pub fn with_ignore_stale(mut self, ignore_stale: bool) -> Self {
        self.ignore_stale = ignore_stale;
        self
    }

    /// Divides both durations by `factor`, for replaying a recording faster
    /// than real time.
    pub fn compressed(mut self, factor: u32) -> Self {
        let factor = factor.max(1);
        self.max_duration /= factor;
        self.rem_followup /= factor;
        self
    }

    pub fn validate(&self) -> Result<(), NapError> {
        if self.max_duration.is_zero() {
            return Err(NapError::InvalidConfig(
                "max nap duration must be positive".to_string(),
            ));
        }
        if self.rem_followup.is_zero() {
            return Err(NapError::InvalidConfig(
                "alarm after REM must be positive".to_string(),
            ));
        }
        deadline_after(self.max_duration)?;
        deadline_after(self.rem_followup)?;
        Ok(())
    }
}

/// The instant `after` from now, or `InvalidConfig` if the clock cannot
/// represent it.
pub fn deadline_after(after: Duration) -> Result<Instant, NapError> {
    Instant::now().checked_add(after).ok_or_else(|| {
        NapError::InvalidConfig(format!("{}s is beyond the timer range", after.as_secs()))
    })
}

impl Default for NapConfig {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_MAX_MINUTES as u64 * 60),
            Duration::from_secs(DEFAULT_REM_MINUTES as u64 * 60),
        )
    }
}

/// List sleep stages and take REM-aware naps
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the sleep stages found in a recording
    Stages(StagesArgs),
    /// Run a nap against a replay of a recording
    Nap(NapArgs),
}

#[derive(Args, Debug)]
pub struct StagesArgs {
    /// CSV (stage,start,end) or JSON file of sleep observations
    pub input_path: PathBuf,

    /// Start time (format: YYYY-MM-DD HH:MM), defaults to start of today
    #[arg(long)]
    pub start_time: Option<String>,

    /// End time (format: YYYY-MM-DD HH:MM), defaults to now
    #[arg(long)]
    pub end_time: Option<String>,

    /// Write the stage list to this CSV file
    #[arg(long)]
    pub csv_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct NapArgs {
    /// CSV (stage,start,end) or JSON file of sleep observations to replay
    pub input_path: PathBuf,

    /// Maximum nap duration in minutes
    #[arg(long, env = "NAP_MAX_MINUTES", default_value_t = DEFAULT_MAX_MINUTES)]
    pub max_minutes: i64,

    /// Minutes to keep sleeping after REM is detected
    #[arg(long, env = "NAP_REM_MINUTES", default_value_t = DEFAULT_REM_MINUTES)]
    pub rem_minutes: i64,

    /// Replay and timers run this many times faster than real time
    #[arg(long, default_value = "1")]
    pub speedup: u32,

    /// Point in the recording mapped onto "now" (format: YYYY-MM-DD HH:MM),
    /// defaults to the first observation's start
    #[arg(long)]
    pub replay_from: Option<String>,

    /// Ignore observations that ended before the nap started
    #[arg(long)]
    pub ignore_stale: bool,

    /// Number of terminal bells rung on wake
    #[arg(long, default_value = "3")]
    pub bells: u32,
}
