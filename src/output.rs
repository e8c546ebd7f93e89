use crate::stages::StageRecord;
use anyhow::Result;
use std::io::Write;
use std::path::Path;

pub fn write_records<W: Write>(writer: W, records: &[StageRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);

    // Header comes from the first serialized record
    for record in records {
        writer.serialize(record)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_records_to_csv(path: &Path, records: &[StageRecord]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));

    // Create directory if it doesn't exist
    if !dir.as_os_str().is_empty() {
        std::fs::create_dir_all(dir)?;
    }

    println!("Writing stages to {}", path.display());
    let file = std::fs::File::create(path)?;
    write_records(file, records)
}
