use crate::stages::{SleepObservation, StageKind};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Stage as it appears in a JSON recording: a name or a HealthKit value.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStage {
    Code(i64),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    #[serde(alias = "type", alias = "value")]
    stage: RawStage,
    #[serde(alias = "startDate")]
    start: String,
    #[serde(alias = "endDate")]
    end: String,
}

impl TryFrom<RawObservation> for SleepObservation {
    type Error = anyhow::Error;

    fn try_from(raw: RawObservation) -> Result<Self> {
        let stage = match raw.stage {
            RawStage::Code(code) => StageKind::from_healthkit(code),
            RawStage::Name(name) => name.parse()?,
        };
        Ok(SleepObservation::new(
            stage,
            parse_timestamp(&raw.start)?,
            parse_timestamp(&raw.end)?,
        ))
    }
}

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM[:SS]` interpreted as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .map(|dt| dt.and_utc())
        .with_context(|| format!("Invalid timestamp: {}", s))
}

/// Reads `stage,start,end` rows. A header row is expected.
pub fn read_csv<R: Read>(reader: R) -> Result<Vec<SleepObservation>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut data = Vec::new();

    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let field = |idx: usize, name: &'static str| {
            record
                .get(idx)
                .with_context(|| format!("Row {}: missing {} column", line + 1, name))
        };

        let stage: StageKind = field(0, "stage")?.parse()?;
        let start = parse_timestamp(field(1, "start")?)?;
        let end = parse_timestamp(field(2, "end")?)?;
        data.push(SleepObservation::new(stage, start, end));
    }

    Ok(data)
}

pub fn read_json<R: Read>(reader: R) -> Result<Vec<SleepObservation>> {
    let raw: Vec<RawObservation> = serde_json::from_reader(reader)?;
    raw.into_iter().map(SleepObservation::try_from).collect()
}

/// Loads a recording, picking the format from the file extension.
/// Observations come back sorted by start time.
pub fn load_observations(path: &Path) -> Result<Vec<SleepObservation>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut observations = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => read_json(reader),
        _ => read_csv(reader),
    }
    .with_context(|| format!("Failed to parse {}", path.display()))?;

    observations.sort_by_key(|obs| (obs.start, obs.end));
    debug!(
        "Loaded {} observations from {}",
        observations.len(),
        path.display()
    );
    Ok(observations)
}
