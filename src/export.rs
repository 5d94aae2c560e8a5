//! CSV export of recorded samples.
//!
//! Output is a header line `X,Y` followed by one `x,y` row per sample in recording order.
//! An absent measurement is written as `None`.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::error::DaqResult;
use crate::measurement::MeasurementSample;

/// Text written for an absent measurement.
pub const ABSENT_VALUE: &str = "None";

fn format_value(value: f64) -> String {
    format!("{value:?}")
}

/// Write `samples` as CSV to `writer`.
pub fn write_samples<W: Write>(writer: W, samples: &[MeasurementSample]) -> DaqResult<()> {
    let mut csv = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer);
    csv.write_record(["X", "Y"])?;
    for sample in samples {
        let y = sample
            .y
            .map(format_value)
            .unwrap_or_else(|| ABSENT_VALUE.to_string());
        csv.write_record([format_value(sample.x), y])?;
    }
    csv.flush()?;
    Ok(())
}

/// Write `samples` as CSV to the file at `path`, replacing it.
pub fn save_csv(path: impl AsRef<Path>, samples: &[MeasurementSample]) -> DaqResult<()> {
    let path = path.as_ref();
    let file = File::create(path)?;
    write_samples(file, samples)?;
    info!(path = %path.display(), samples = samples.len(), "samples exported");
    Ok(())
}
