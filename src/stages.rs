use crate::error::NapError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, Serialize)]
pub enum StageKind {
    #[serde(rename = "REM")]
    Rem,
    Deep,
    Light,
    Unspecified,
}

impl StageKind {
    /// Maps a HealthKit `HKCategoryValueSleepAnalysis` raw value.
    ///
    /// In bed (0), awake (2) and core (3) all collapse into `Light`, the
    /// same bucketing the phone app used when charting a night.
    pub fn from_healthkit(value: i64) -> StageKind {
        match value {
            5 => StageKind::Rem,
            4 => StageKind::Deep,
            1 => StageKind::Unspecified,
            _ => StageKind::Light,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Rem => "REM",
            StageKind::Deep => "Deep",
            StageKind::Light => "Light",
            StageKind::Unspecified => "Unspecified",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = NapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i64>() {
            return Ok(StageKind::from_healthkit(code));
        }
        match s.to_ascii_lowercase().as_str() {
            "rem" => Ok(StageKind::Rem),
            "deep" => Ok(StageKind::Deep),
            "light" | "core" => Ok(StageKind::Light),
            "unspecified" => Ok(StageKind::Unspecified),
            _ => Err(NapError::Load(format!(
                "Invalid stage: {}. Use REM, Deep, Light, Unspecified or a HealthKit value",
                s
            ))),
        }
    }
}

/// One classified sleep interval as reported by the health data store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepObservation {
    pub stage: StageKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SleepObservation {
    pub fn new(stage: StageKind, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { stage, start, end }
    }

    pub fn is_rem(&self) -> bool {
        self.stage == StageKind::Rem
    }

    /// Whole minutes covered, never negative even for inverted ranges.
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes().max(0)
    }
}

/// Row shown in the stage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub start: String,
    pub end: String,
    pub duration_minutes: i64,
}

impl From<&SleepObservation> for StageRecord {
    fn from(obs: &SleepObservation) -> Self {
        StageRecord {
            stage: obs.stage,
            start: obs.start.format("%H:%M").to_string(),
            end: obs.end.format("%H:%M").to_string(),
            duration_minutes: obs.duration_minutes(),
        }
    }
}

pub fn to_records(observations: &[SleepObservation]) -> Vec<StageRecord> {
    observations.iter().map(StageRecord::from).collect()
}

/// Observations that end inside `(start, end]`. A sample that began before
/// `start` still counts, so the segment crossing midnight stays in today's
/// list.
pub fn observations_in_window(
    observations: &[SleepObservation],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<SleepObservation> {
    observations
        .iter()
        .filter(|obs| obs.end > start && obs.end <= end)
        .cloned()
        .collect()
}

/// Total minutes spent in each stage.
pub fn summarize_stages(observations: &[SleepObservation]) -> BTreeMap<StageKind, i64> {
    let mut total_minutes = BTreeMap::new();
    for obs in observations {
        *total_minutes.entry(obs.stage).or_insert(0) += obs.duration_minutes();
    }
    total_minutes
}

pub fn print_stage_summary(observations: &[SleepObservation]) {
    if observations.is_empty() {
        println!("No sleep stages to summarize");
        return;
    }

    println!("\nSleep Stages:");
    println!("-------------");
    for record in to_records(observations) {
        println!(
            "{:<12} {} - {} ({} min)",
            format!("{} Sleep", record.stage),
            record.start,
            record.end,
            record.duration_minutes
        );
    }

    println!("\nTotal Time in Each Stage:");
    println!("------------------------");
    for (stage, minutes) in summarize_stages(observations) {
        let hours = minutes / 60;
        let remaining_minutes = minutes % 60;
        println!("{}: {}h {}min", stage, hours, remaining_minutes);
    }
}
