use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use clap::Parser;
use log::{info, warn};
use nap_alarm::config::{Cli, Command, NapArgs, StagesArgs};
use nap_alarm::data_loading::{load_observations, parse_timestamp};
use nap_alarm::output::write_records_to_csv;
use nap_alarm::stages::{observations_in_window, print_stage_summary, to_records};
use nap_alarm::{NapConfig, NapController, NapEvent, ReplaySource, TerminalAlarm};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

fn time_arg(value: Option<&str>, default: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match value {
        Some(s) => parse_timestamp(s),
        None => Ok(default),
    }
}

fn run_stages(args: StagesArgs) -> Result<()> {
    let observations = load_observations(&args.input_path)?;

    let now = Utc::now();
    let start_of_today = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let start = time_arg(args.start_time.as_deref(), start_of_today)?;
    let end = time_arg(args.end_time.as_deref(), now)?;

    let windowed = observations_in_window(&observations, start, end);
    println!(
        "Found {} of {} observations between {} and {}",
        windowed.len(),
        observations.len(),
        start.format("%Y-%m-%d %H:%M"),
        end.format("%Y-%m-%d %H:%M")
    );
    print_stage_summary(&windowed);

    if let Some(path) = args.csv_output {
        write_records_to_csv(&path, &to_records(&windowed))?;
    }

    Ok(())
}

async fn run_nap(args: NapArgs) -> Result<()> {
    let observations = load_observations(&args.input_path)?;
    let replay_from = match args.replay_from.as_deref() {
        Some(s) => parse_timestamp(s)?,
        None => observations
            .first()
            .map(|obs| obs.start)
            .context("Recording has no observations to replay")?,
    };

    let config = NapConfig::from_minutes(args.max_minutes, args.rem_minutes)?
        .with_ignore_stale(args.ignore_stale)
        .compressed(args.speedup);
    let source = ReplaySource::new(observations, replay_from).with_speedup(args.speedup);
    let controller = NapController::new(
        Arc::new(source),
        Arc::new(TerminalAlarm::stdout(args.bells)),
    );

    let mut events = controller.events();
    controller.start(config)?;
    info!("Replaying from {}", replay_from.format("%Y-%m-%d %H:%M"));
    println!(
        "Nap started ({} min max, {} min after REM). Press Ctrl-C to stop.",
        args.max_minutes, args.rem_minutes
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(NapEvent::RemDetected { at, .. }) => {
                    println!("REM detected at {}", at.format("%H:%M:%S"));
                }
                Ok(NapEvent::Error { error, .. }) => warn!("{}", error),
                Ok(NapEvent::Woken { reason, .. }) => {
                    println!("Nap over: {}", reason);
                    break;
                }
                Ok(NapEvent::Stopped { .. }) | Err(RecvError::Closed) => break,
                Ok(NapEvent::Started { .. }) => {}
                Err(RecvError::Lagged(missed)) => warn!("Missed {} nap events", missed),
            },
            _ = tokio::signal::ctrl_c() => {
                if controller.stop().is_some() {
                    println!("Nap stopped, no alarm");
                }
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Stages(args) => run_stages(args),
        Command::Nap(args) => run_nap(args).await,
    }
}
