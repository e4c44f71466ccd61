use std::collections::BTreeSet;
use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use harvest_core::TaskResult;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line
    #[default]
    Jsonl,
    /// Header row from the union of top-level keys
    Csv,
}

pub fn write_results<W: Write>(writer: W, results: &[TaskResult], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Jsonl => write_jsonl(writer, results),
        OutputFormat::Csv => write_csv(writer, results),
    }
}

fn write_jsonl<W: Write>(mut writer: W, results: &[TaskResult]) -> Result<()> {
    for result in results {
        serde_json::to_writer(&mut writer, &result.data)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn write_csv<W: Write>(writer: W, results: &[TaskResult]) -> Result<()> {
    let columns: BTreeSet<&str> = results
        .iter()
        .filter_map(|r| r.data.as_object())
        .flat_map(|object| object.keys().map(String::as_str))
        .collect();

    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(&columns)?;
    for result in results {
        let row = columns.iter().map(|column| match result.data.get(*column) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        });
        csv.write_record(row)?;
    }
    csv.flush()?;
    Ok(())
}
