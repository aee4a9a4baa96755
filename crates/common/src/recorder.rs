use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::RecorderError;

pub const DEFAULT_COLUMNS: [&str; 10] = [
    "timestamp",
    "frame",
    "force_n",
    "target_force",
    "error",
    "compensated_error",
    "phase",
    "condition",
    "trial_num",
    "feedback_gain",
];

/// Every column a [`SessionRow`] can fill.
pub const AVAILABLE_COLUMNS: [&str; 13] = [
    "timestamp",
    "frame",
    "force_n",
    "target_force",
    "error",
    "compensated_error",
    "phase",
    "condition",
    "trial_num",
    "feedback_gain",
    "sample_time",
    "display_force",
    "feedback",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    RangeCal,
    Baseline,
    Countdown,
    Tracking,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::RangeCal => "range_cal",
            Phase::Baseline => "baseline",
            Phase::Countdown => "countdown",
            Phase::Tracking => "tracking",
        };
        f.write_str(label)
    }
}

/// One logged belt sample. Tracking-only fields stay `None` elsewhere.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionRow {
    /// Seconds since the phase began.
    pub timestamp: f64,
    pub frame: u64,
    pub force_n: f64,
    pub target_force: Option<f64>,
    pub error: Option<f64>,
    pub compensated_error: Option<f64>,
    pub phase: Option<Phase>,
    pub condition: String,
    pub trial_num: u32,
    pub feedback_gain: f64,
    /// Belt clock timestamp of the sample.
    pub sample_time: Option<f64>,
    pub display_force: Option<f64>,
    pub feedback: Option<String>,
}

fn rounded(value: f64) -> String {
    ((value * 1e4).round() / 1e4).to_string()
}

fn rounded_opt(value: Option<f64>) -> String {
    value.map(rounded).unwrap_or_default()
}

impl SessionRow {
    /// Cell text for `column`, or `None` for an unknown column.
    pub fn field(&self, column: &str) -> Option<String> {
        let cell = match column {
            "timestamp" => rounded(self.timestamp),
            "frame" => self.frame.to_string(),
            "force_n" => rounded(self.force_n),
            "target_force" => rounded_opt(self.target_force),
            "error" => rounded_opt(self.error),
            "compensated_error" => rounded_opt(self.compensated_error),
            "phase" => self.phase.map(|p| p.to_string()).unwrap_or_default(),
            "condition" => self.condition.clone(),
            "trial_num" => self.trial_num.to_string(),
            "feedback_gain" => self.feedback_gain.to_string(),
            "sample_time" => rounded_opt(self.sample_time),
            "display_force" => rounded_opt(self.display_force),
            "feedback" => self.feedback.clone().unwrap_or_default(),
            _ => return None,
        };
        Some(cell)
    }
}

/// `<dir>/sub-<id>_ses-<session>_<YYYY-mm-dd_HHMMSS>.csv`, creating `dir`.
///
/// Bare numeric participant ids are zero-padded to two digits.
pub fn create_session_path(
    participant: &str,
    session: &str,
    output_dir: impl AsRef<Path>,
) -> Result<PathBuf, RecorderError> {
    let output_dir = output_dir.as_ref();
    fs::create_dir_all(output_dir)?;

    let participant = if !participant.is_empty() && participant.chars().all(|c| c.is_ascii_digit()) {
        format!("{participant:0>2}")
    } else {
        participant.to_string()
    };
    let stamp = Local::now().format("%Y-%m-%d_%H%M%S");
    Ok(output_dir.join(format!("sub-{participant}_ses-{session}_{stamp}.csv")))
}

/// Incremental CSV writer; every row is flushed so a crash loses nothing
/// already recorded.
pub struct SessionRecorder {
    writer: csv::Writer<File>,
    columns: Vec<String>,
    path: PathBuf,
    rows_written: u64,
}

impl SessionRecorder {
    pub fn create(path: impl AsRef<Path>, columns: &[String]) -> Result<Self, RecorderError> {
        if let Some(unknown) = columns
            .iter()
            .find(|c| !AVAILABLE_COLUMNS.contains(&c.as_str()))
        {
            return Err(RecorderError::UnknownColumn(unknown.clone()));
        }

        let path = path.as_ref().to_path_buf();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(columns)?;
        writer.flush()?;
        log::info!("Recording session data to {}", path.display());

        Ok(Self {
            writer,
            columns: columns.to_vec(),
            path,
            rows_written: 0,
        })
    }

    pub fn record(&mut self, row: &SessionRow) -> Result<(), RecorderError> {
        let cells: Vec<String> = self
            .columns
            .iter()
            .map(|c| row.field(c).unwrap_or_default())
            .collect();
        self.writer.write_record(&cells)?;
        self.writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(mut self) -> Result<PathBuf, RecorderError> {
        self.writer.flush()?;
        log::info!("Saved {} rows to {}", self.rows_written, self.path.display());
        Ok(self.path)
    }
}

/// Reads the `force_n` column of a recorded session, skipping empty cells.
pub fn read_forces(path: impl AsRef<Path>) -> Result<Vec<f64>, RecorderError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let index = headers
        .iter()
        .position(|h| h == "force_n")
        .ok_or_else(|| RecorderError::UnknownColumn("force_n".to_string()))?;

    let mut forces = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(value) = record.get(index).and_then(|cell| cell.parse::<f64>().ok()) {
            forces.push(value);
        }
    }
    Ok(forces)
}
