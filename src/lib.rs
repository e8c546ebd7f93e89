pub mod config;
pub mod data_loading;
pub mod error;
pub mod nap;
pub mod output;
pub mod sink;
pub mod source;
pub mod stages;

pub use config::NapConfig;
pub use error::NapError;
pub use nap::{NapController, NapEvent, NapSession, NapTimer, SessionStatus};
pub use sink::{TerminalAlarm, WakeReason, WakeSink};
pub use source::{ChannelSource, ReplaySource, SampleSource, Subscription};
pub use stages::{SleepObservation, StageKind};
