use std::io;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::pipeline::StageReport;

/// One counter of one stage, as written to the statistics file.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatRow<'a> {
    stage: &'a str,
    passes: usize,
    counter: &'static str,
    value: usize,
}

/// Flattens stage reports into rows. A stage without counters still gets a
/// row, so its pass count is recorded.
pub fn rows(reports: &[StageReport]) -> Vec<StatRow<'_>> {
    let mut rows = Vec::new();
    for report in reports {
        let before = rows.len();
        rows.extend(report.counters().map(|(counter, value)| StatRow {
            stage: &report.stage,
            passes: report.passes,
            counter,
            value,
        }));
        if rows.len() == before {
            rows.push(StatRow {
                stage: &report.stage,
                passes: report.passes,
                counter: "",
                value: 0,
            });
        }
    }
    rows
}

pub fn write_csv<W: io::Write>(writer: W, reports: &[StageReport]) -> csv::Result<()> {
    let mut writer = csv::WriterBuilder::new().from_writer(writer);
    for row in rows(reports) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the statistics of a run to `path` as CSV.
pub fn write_stats(path: &Path, reports: &[StageReport]) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|err| Error::io(path, err))?;
    write_csv(file, reports).map_err(|err| Error::io(path, err.into()))
}
