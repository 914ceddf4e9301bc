//! CSV export of per-interval charging commands.
//!
//! One row per interval with the connector supply breakdown and every
//! charging-station command, the layout the cost post-processor consumes.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::SimResult;
use crate::sim::StepOutput;

/// Exports step outputs to a CSV file at the given path.
///
/// # Errors
///
/// Returns an error if file creation or writing fails.
pub fn export_csv(results: &[StepOutput], path: &Path) -> SimResult<()> {
    let file = File::create(path)?;
    write_csv(results, BufWriter::new(file))
}

/// Writes step outputs as CSV to any writer.
///
/// Columns: `time`, then `<gc>_grid_supply_kw`, `<gc>_fixed_load_kw`,
/// `<gc>_window` per connector, then `<cs>_kw` per charging station that
/// received a command anywhere in the run. Stations without a command in a
/// given interval report 0. Output is deterministic for identical inputs.
pub fn write_csv(results: &[StepOutput], writer: impl Write) -> SimResult<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);

    let connector_ids: BTreeSet<&String> = results
        .iter()
        .flat_map(|r| r.connectors.keys())
        .collect();
    let station_ids: BTreeSet<&String> = results.iter().flat_map(|r| r.commands.keys()).collect();

    let mut header = vec!["time".to_owned()];
    for gc_id in &connector_ids {
        header.push(format!("{gc_id}_grid_supply_kw"));
        header.push(format!("{gc_id}_fixed_load_kw"));
        header.push(format!("{gc_id}_window"));
    }
    for cs_id in &station_ids {
        header.push(format!("{cs_id}_kw"));
    }
    wtr.write_record(&header)?;

    for result in results {
        let mut row = vec![result.current_time.format("%Y-%m-%dT%H:%M:%S").to_string()];
        for gc_id in &connector_ids {
            match result.connectors.get(gc_id.as_str()) {
                Some(snapshot) => {
                    row.push(format!("{:.4}", snapshot.grid_supply));
                    row.push(format!("{:.4}", snapshot.fixed_load));
                    row.push(match snapshot.window {
                        Some(window) => u8::from(window).to_string(),
                        None => String::new(),
                    });
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        for cs_id in &station_ids {
            let command = result.commands.get(cs_id.as_str()).copied().unwrap_or(0.0);
            row.push(format!("{command:.4}"));
        }
        wtr.write_record(&row)?;
    }

    wtr.flush().map_err(io::Error::from)?;
    Ok(())
}
