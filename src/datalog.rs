use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::ControlError;
use crate::types::{RunState, TelemetrySample};

pub const HEADER: [&str; 8] = [
    "Time",
    "System State",
    "Stack Voltage (V)",
    "Stack Current (mA)",
    "Stack Power (W)",
    "Water Resistivity (MΩ)",
    "Flow Rate (mL/min)",
    "Temperature (°C)",
];

/// One CSV row; unavailable readings are empty cells.
#[derive(Debug, Serialize)]
struct LogRecord {
    time: String,
    state: String,
    voltage: String,
    current: String,
    power: String,
    resistivity: String,
    flow: String,
    temperature: String,
}

fn cell(value: Option<f64>, decimals: usize) -> String {
    value.map(|v| format!("{v:.decimals$}")).unwrap_or_default()
}

impl LogRecord {
    fn new(time: DateTime<Local>, state: RunState, sample: &TelemetrySample) -> Self {
        Self {
            time: time.format("%Y-%m-%d %H:%M:%S").to_string(),
            state: state.to_string(),
            voltage: cell(sample.voltage, 2),
            current: cell(sample.current, 2),
            power: cell(sample.power, 4),
            resistivity: cell(sample.resistivity, 2),
            flow: cell(sample.flow, 0),
            temperature: cell(sample.temperature, 1),
        }
    }
}

/// Append-only CSV telemetry log.
///
/// The file is recreated at startup; previous runs are not kept.
#[derive(Debug)]
pub struct DataLogger {
    path: PathBuf,
    records_written: u64,
    consecutive_failures: usize,
}

impl DataLogger {
    /// Truncate (or create) the log and write the header row.
    pub fn create<P: Into<PathBuf>>(path: P) -> Result<Self, ControlError> {
        let path = path.into();
        let file = File::create(&path).map_err(|source| ControlError::SinkWrite {
            source,
            context: format!("Could not create data log at {:?}", path),
        })?;

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(HEADER)
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .map_err(|e| ControlError::SinkWrite {
                source: std::io::Error::other(e.to_string()),
                context: format!("Could not write header to {:?}", path),
            })?;

        info!("Data log created at {:?}", path);
        Ok(Self {
            path,
            records_written: 0,
            consecutive_failures: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    /// Append one record for `sample` stamped with the current wall-clock time.
    ///
    /// A failure is counted and returned; the next call retries from scratch.
    pub fn append(&mut self, sample: &TelemetrySample, state: RunState) -> Result<(), ControlError> {
        let record = LogRecord::new(Local::now(), state, sample);

        match self.write_record(&record) {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.records_written += 1;
                info!("Data logged");
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                error!("Data log failure {}: {}", self.consecutive_failures, e);

                // Periodic warning
                if self.consecutive_failures % 3 == 0 {
                    warn!(
                        "Data log has failed {} times in a row; instruments keep running",
                        self.consecutive_failures
                    );
                }
                Err(e)
            }
        }
    }

    fn write_record(&self, record: &LogRecord) -> Result<(), ControlError> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| ControlError::SinkWrite {
                source,
                context: format!("Could not open data log at {:?}", self.path),
            })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .serialize(record)
            .and_then(|_| writer.flush().map_err(csv::Error::from))
            .map_err(|e| ControlError::SinkWrite {
                source: std::io::Error::other(e.to_string()),
                context: format!("Could not append to {:?}", self.path),
            })
    }
}
