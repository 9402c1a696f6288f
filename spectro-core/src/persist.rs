//! CSV files for spectra, recorded sessions and prediction results.
//!
//! Three formats:
//! * a single spectrum as one comma-separated row, used for exported
//!   references;
//! * a record table, one processed spectrum per row, with a header of
//!   `index,label,time,length,minVal,maxVal,moisture` followed by one
//!   column per wavelength (two decimals, nm);
//! * an append-only prediction log.
//!
//! Values are written in Rust's shortest round-trip form, so reading a
//! file back reproduces the values exactly.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};

use crate::config::wavelength_axis;
use crate::log_context::LogContext;
use crate::predictor::{LimitMonitor, MonitorStatus};
use crate::spectrum::AveragedSpectrum;

const RECORD_COLUMNS: [&str; 7] = ["index", "label", "time", "length", "minVal", "maxVal", "moisture"];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const SOURCE: &str = "persist";

pub fn save_spectrum_csv(path: &Path, spectrum: &[f64]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(spectrum.iter().map(f64::to_string))
        .context("writing spectrum row")?;
    writer.flush().context("flushing spectrum CSV")?;
    Ok(())
}

/// Reads the first row of `path`. Cells that are not numbers are skipped.
pub fn load_spectrum_csv(path: &Path, log: &LogContext) -> Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let Some(row) = reader.records().next() else {
        bail!("{} is empty", path.display());
    };
    let row = row.context("reading spectrum row")?;

    let mut values = Vec::with_capacity(row.len());
    for cell in row.iter().map(str::trim).filter(|c| !c.is_empty()) {
        match cell.parse::<f64>() {
            Ok(v) => values.push(v),
            Err(_) => log.warn(
                SOURCE,
                format!("{}: skipping non-numeric value {cell:?}", path.display()),
            ),
        }
    }
    Ok(values)
}

/// One processed spectrum in a recorded session.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumRecord {
    pub index: i64,
    pub label: String,
    pub time: String,
    pub length: usize,
    pub min: f64,
    pub max: f64,
    /// Prediction attached to the spectrum; 0 when there was none.
    pub moisture: f64,
    pub spectrum: Vec<f64>,
}

impl SpectrumRecord {
    pub fn new(
        index: i64,
        label: impl Into<String>,
        time: DateTime<Local>,
        spectrum: &AveragedSpectrum,
        moisture: f64,
    ) -> Self {
        Self {
            index,
            label: label.into(),
            time: time.format(TIME_FORMAT).to_string(),
            length: spectrum.len(),
            min: spectrum.min,
            max: spectrum.max,
            moisture,
            spectrum: spectrum.samples().to_vec(),
        }
    }
}

/// Writes `records` as a table whose wavelength columns span
/// `wavelength_range` (nm) over the longest spectrum.
pub fn save_records_csv(path: &Path, records: &[SpectrumRecord], wavelength_range: (f64, f64)) -> Result<()> {
    let columns = records.iter().map(|r| r.spectrum.len()).max().unwrap_or(0);
    let (start, end) = wavelength_range;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;

    let header = RECORD_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(wavelength_axis(start, end, columns).into_iter().map(|l| format!("{l:.2}")));
    writer.write_record(header).context("writing header")?;

    for record in records {
        let fixed = [
            record.index.to_string(),
            record.label.clone(),
            record.time.clone(),
            record.length.to_string(),
            record.min.to_string(),
            record.max.to_string(),
            record.moisture.to_string(),
        ];
        let samples = (0..columns).map(|i| record.spectrum.get(i).map(f64::to_string).unwrap_or_default());
        writer
            .write_record(fixed.into_iter().chain(samples))
            .with_context(|| format!("writing record {}", record.index))?;
    }
    writer.flush().context("flushing record table")?;
    Ok(())
}

/// Reads a record table. Rows with an unreadable index, length, min, max or
/// spectrum value are skipped; an unreadable moisture becomes 0.
pub fn load_records_csv(path: &Path, log: &LogContext) -> Result<Vec<SpectrumRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers().context("reading header")?;
    if headers.len() < RECORD_COLUMNS.len() {
        bail!(
            "{}: header has {} columns, expected at least {}",
            path.display(),
            headers.len(),
            RECORD_COLUMNS.len()
        );
    }

    let mut records = Vec::new();
    for (row_no, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("CSV row {row_no}"))?;
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        match parse_record(&row, log) {
            Ok(record) => records.push(record),
            Err(e) => log.warn(SOURCE, format!("{}: skipping row {row_no}: {e:#}", path.display())),
        }
    }
    Ok(records)
}

fn parse_record(row: &csv::StringRecord, log: &LogContext) -> Result<SpectrumRecord> {
    if row.len() < RECORD_COLUMNS.len() {
        bail!("only {} columns", row.len());
    }
    let cell = |i: usize| row.get(i).unwrap_or("").trim();
    let index: i64 = cell(0).parse().with_context(|| format!("bad index {:?}", cell(0)))?;
    let length = cell(3).parse().with_context(|| format!("bad length {:?}", cell(3)))?;
    let min = cell(4).parse().with_context(|| format!("bad minVal {:?}", cell(4)))?;
    let max = cell(5).parse().with_context(|| format!("bad maxVal {:?}", cell(5)))?;
    let moisture = cell(6).parse().unwrap_or_else(|_| {
        log.warn(SOURCE, format!("index {index}: bad moisture {:?}, using 0", cell(6)));
        0.0
    });

    // Shorter spectra leave their trailing cells empty.
    let cells: Vec<&str> = row.iter().skip(RECORD_COLUMNS.len()).map(str::trim).collect();
    let used = cells.iter().rposition(|c| !c.is_empty()).map_or(0, |last| last + 1);
    let spectrum = cells[..used]
        .iter()
        .enumerate()
        .map(|(i, value)| {
            value
                .parse::<f64>()
                .with_context(|| format!("bad spectrum value {value:?} at sample {i}"))
        })
        .collect::<Result<Vec<f64>>>()?;

    Ok(SpectrumRecord {
        index,
        label: cell(1).to_string(),
        time: cell(2).to_string(),
        length,
        min,
        max,
        moisture,
        spectrum,
    })
}

/// One line of the prediction log.
#[derive(Debug, Clone)]
pub struct PredictionEntry<'a> {
    pub time: DateTime<Local>,
    pub predictor: usize,
    pub value: f64,
    pub monitor: LimitMonitor,
    pub spectrum: &'a [f64],
}

impl PredictionEntry<'_> {
    pub fn status(&self) -> MonitorStatus {
        self.monitor.classify(self.value)
    }
}

/// Append-only CSV of prediction results.
pub struct PredictionLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl PredictionLog {
    /// Opens `path` for appending. A new or empty file gets a header with
    /// `spectrum_len` wavelength columns spread over `wavelength_range`.
    pub fn open(path: &Path, spectrum_len: usize, wavelength_range: (f64, f64)) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let fresh = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        if fresh {
            let (start, end) = wavelength_range;
            let header = [
                "timestamp",
                "predictorIndex",
                "value",
                "status",
                "monitorEnabled",
                "lowerLimit",
                "upperLimit",
            ]
            .into_iter()
            .map(str::to_string)
            .chain(
                wavelength_axis(start, end, spectrum_len)
                    .into_iter()
                    .map(|l| format!("{l:.2}")),
            );
            writer.write_record(header).context("writing prediction log header")?;
            writer.flush().context("flushing prediction log")?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &PredictionEntry<'_>) -> Result<()> {
        let fixed = [
            entry.time.format(TIME_FORMAT).to_string(),
            entry.predictor.to_string(),
            entry.value.to_string(),
            entry.status().to_string(),
            entry.monitor.enabled.to_string(),
            entry.monitor.lower.to_string(),
            entry.monitor.upper.to_string(),
        ];
        self.writer
            .write_record(fixed.into_iter().chain(entry.spectrum.iter().map(f64::to_string)))
            .context("writing prediction")?;
        self.writer.flush().context("flushing prediction log")?;
        Ok(())
    }
}
