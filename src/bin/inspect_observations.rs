use anyhow::Result;
use nap_alarm::data_loading::load_observations;
use nap_alarm::stages::summarize_stages;
use std::path::Path;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} <observations.csv|observations.json>", args[0]);
        std::process::exit(1);
    }

    let observations = load_observations(Path::new(&args[1]))?;
    println!("\nObservations: {}", observations.len());

    if let (Some(first), Some(last)) = (observations.first(), observations.last()) {
        let latest_end = observations.iter().map(|obs| obs.end).max().unwrap_or(last.end);
        println!(
            "Range: {} to {}",
            first.start.format("%Y-%m-%d %H:%M:%S"),
            latest_end.format("%Y-%m-%d %H:%M:%S")
        );
    }

    for (stage, minutes) in summarize_stages(&observations) {
        let count = observations.iter().filter(|obs| obs.stage == stage).count();
        println!("  {:<12} {:>3} samples {:>5} min", stage.as_str(), count, minutes);
    }

    Ok(())
}
