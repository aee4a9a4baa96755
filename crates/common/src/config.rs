use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::feedback::{ErrorSource, Feedback, FeedbackLevel, FeedbackMode};
use crate::presets;
use crate::recorder::AVAILABLE_COLUMNS;
use crate::schedule::TrialMethod;
use crate::waveform::Condition;

/// Go Direct hardware cannot sample faster than this.
pub const MIN_PERIOD_MS: u64 = 10;
const MAX_EXTENDS_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ble,
    Usb,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Ble => write!(f, "BLE"),
            Transport::Usb => write!(f, "USB"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeltConfig {
    pub transport: Transport,
    /// `None` auto-connects to the only device on the transport.
    pub device: Option<String>,
    pub period_ms: u64,
    pub channels: Vec<u32>,
    /// Retry over USB when the BLE connection fails.
    pub fallback_to_usb: bool,
    pub queue_capacity: usize,
}

impl Default for BeltConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Ble,
            device: Some("proximity_pairing".to_string()),
            period_ms: 100,
            channels: vec![1],
            fallback_to_usb: true,
            queue_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackModeKind {
    Graded,
    Binary,
    Trinary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DotConfig {
    pub feedback_mode: FeedbackModeKind,
    pub error_source: ErrorSource,
    pub error_threshold_n: f64,
    pub error_threshold_mid_n: f64,
    pub graded_max_error_n: f64,
    pub color_good: String,
    pub color_mid: String,
    pub color_bad: String,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            feedback_mode: FeedbackModeKind::Graded,
            error_source: ErrorSource::Visual,
            error_threshold_n: 1.0,
            error_threshold_mid_n: 2.0,
            graded_max_error_n: 3.0,
            color_good: "yellow".to_string(),
            color_mid: "orange".to_string(),
            color_bad: "red".to_string(),
        }
    }
}

impl DotConfig {
    /// Palette colour for discrete feedback, hex for graded.
    pub fn color_for(&self, feedback: &Feedback) -> String {
        match feedback {
            Feedback::Level(FeedbackLevel::Good) => self.color_good.clone(),
            Feedback::Level(FeedbackLevel::Moderate) => self.color_mid.clone(),
            Feedback::Level(FeedbackLevel::Bad) => self.color_bad.clone(),
            graded => graded.hex().unwrap_or_default(),
        }
    }

    pub fn feedback_mode(&self) -> FeedbackMode {
        match self.feedback_mode {
            FeedbackModeKind::Graded => FeedbackMode::Graded {
                max_error: self.graded_max_error_n,
            },
            FeedbackModeKind::Binary => FeedbackMode::Binary {
                threshold: self.error_threshold_n,
            },
            FeedbackModeKind::Trinary => FeedbackMode::Trinary {
                threshold_low: self.error_threshold_n,
                threshold_mid: self.error_threshold_mid_n,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub range_cal_duration_sec: f64,
    pub baseline_duration_sec: f64,
    pub countdown_duration_sec: f64,
    /// `None` tracks for exactly the condition's duration.
    pub tracking_duration_sec: Option<f64>,
    pub frame_period_ms: u64,
    /// Seconds of history kept in the rolling display trace.
    pub trace_window_sec: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            range_cal_duration_sec: 15.0,
            baseline_duration_sec: 10.0,
            countdown_duration_sec: 3.0,
            tracking_duration_sec: None,
            frame_period_ms: 16,
            trace_window_sec: 5.0,
        }
    }
}

impl TimingConfig {
    pub fn tracking_duration(&self, condition: &Condition) -> f64 {
        self.tracking_duration_sec
            .unwrap_or_else(|| condition.total_duration())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeCalConfig {
    pub scale: f64,
    pub percentile_lo: u32,
    pub percentile_hi: u32,
    pub saturation_lo: f64,
    pub saturation_hi: f64,
    pub min_amplitude: f64,
}

impl Default for RangeCalConfig {
    fn default() -> Self {
        Self {
            scale: 0.80,
            percentile_lo: 5,
            percentile_hi: 95,
            saturation_lo: 0.0,
            saturation_hi: 40.0,
            min_amplitude: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialConfig {
    /// Condition names in block order; each must exist in `conditions`.
    pub conditions: Vec<String>,
    pub n_reps: u32,
    pub method: TrialMethod,
    /// Even-numbered sessions run the block order reversed.
    pub counterbalance: bool,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            conditions: vec!["slow_steady".to_string()],
            n_reps: 1,
            method: TrialMethod::Sequential,
            counterbalance: false,
        }
    }
}

/// Complete configuration of a breath tracking experiment.
///
/// Records are treated as immutable; use the `with_*` methods (or struct
/// update syntax) to derive a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub belt: BeltConfig,
    pub dot: DotConfig,
    pub timing: TimingConfig,
    pub range_cal: RangeCalConfig,
    pub trial: TrialConfig,
    pub conditions: Vec<Condition>,
    pub output_dir: PathBuf,
    pub data_columns: Vec<String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "Breath Tracking Task".to_string(),
            belt: BeltConfig::default(),
            dot: DotConfig::default(),
            timing: TimingConfig::default(),
            range_cal: RangeCalConfig::default(),
            trial: TrialConfig::default(),
            conditions: presets::stock(),
            output_dir: PathBuf::from("data"),
            data_columns: crate::recorder::DEFAULT_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<ExperimentConfig, ConfigError> {
    ExperimentConfig::from_file(path)
}

impl ExperimentConfig {
    /// Loads and validates a TOML config.
    ///
    /// A top-level `extends = "base.toml"` (relative to the file) loads the
    /// base first and overlays this file's tables onto it key by key.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let table = load_table(path.as_ref(), 0)?;
        let config: ExperimentConfig = toml::Value::Table(table).try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ExperimentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_belt(&self, belt: BeltConfig) -> Self {
        Self { belt, ..self.clone() }
    }

    pub fn with_dot(&self, dot: DotConfig) -> Self {
        Self { dot, ..self.clone() }
    }

    pub fn with_timing(&self, timing: TimingConfig) -> Self {
        Self { timing, ..self.clone() }
    }

    pub fn with_range_cal(&self, range_cal: RangeCalConfig) -> Self {
        Self { range_cal, ..self.clone() }
    }

    pub fn with_trial(&self, trial: TrialConfig) -> Self {
        Self { trial, ..self.clone() }
    }

    pub fn with_conditions(&self, conditions: Vec<Condition>) -> Self {
        Self { conditions, ..self.clone() }
    }

    pub fn with_output_dir(&self, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..self.clone()
        }
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }

    /// Samples that fit in the visible trace window.
    pub fn trace_buffer_size(&self, trace_seconds: f64) -> usize {
        (trace_seconds * 1000.0 / self.belt.period_ms as f64) as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.belt.period_ms < MIN_PERIOD_MS {
            return invalid(format!(
                "belt.period_ms={} is below the {MIN_PERIOD_MS} ms minimum",
                self.belt.period_ms
            ));
        }
        if self.belt.channels.is_empty() {
            return invalid("belt.channels must list at least one channel".to_string());
        }
        if self.belt.queue_capacity == 0 {
            return invalid("belt.queue_capacity must be positive".to_string());
        }
        if self.timing.frame_period_ms == 0 {
            return invalid("timing.frame_period_ms must be positive".to_string());
        }
        let timing = &self.timing;
        let durations = [
            timing.range_cal_duration_sec,
            timing.baseline_duration_sec,
            timing.countdown_duration_sec,
            timing.tracking_duration_sec.unwrap_or(0.0),
        ];
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return invalid("timing durations must be finite and non-negative".to_string());
        }
        if !(timing.trace_window_sec.is_finite() && timing.trace_window_sec > 0.0) {
            return invalid("timing.trace_window_sec must be positive".to_string());
        }
        if self.dot.error_threshold_n > self.dot.error_threshold_mid_n {
            return invalid(format!(
                "dot.error_threshold_n ({}) exceeds dot.error_threshold_mid_n ({})",
                self.dot.error_threshold_n, self.dot.error_threshold_mid_n
            ));
        }
        if self.dot.graded_max_error_n <= 0.0 {
            return invalid("dot.graded_max_error_n must be positive".to_string());
        }
        let rc = &self.range_cal;
        if rc.percentile_lo >= rc.percentile_hi || rc.percentile_hi > 100 {
            return invalid(format!(
                "range_cal percentiles must satisfy lo < hi <= 100, got {}/{}",
                rc.percentile_lo, rc.percentile_hi
            ));
        }

        let mut seen: Vec<&Condition> = Vec::new();
        for condition in &self.conditions {
            condition.validate()?;
            if let Some(existing) = seen.iter().find(|c| c.name == condition.name) {
                if *existing != condition {
                    return invalid(format!(
                        "duplicate condition name '{}' with different parameters",
                        condition.name
                    ));
                }
            }
            seen.push(condition);
        }
        if self.trial.conditions.is_empty() {
            return invalid("trial.conditions is empty; nothing to run".to_string());
        }
        for name in &self.trial.conditions {
            if self.condition(name).is_none() {
                return invalid(format!("trial references unknown condition '{name}'"));
            }
        }

        let known: HashSet<&str> = AVAILABLE_COLUMNS.iter().copied().collect();
        for column in &self.data_columns {
            if !known.contains(column.as_str()) {
                return invalid(format!("unknown data column '{column}'"));
            }
        }
        Ok(())
    }
}

fn load_table(path: &Path, depth: usize) -> Result<toml::Table, ConfigError> {
    if depth > MAX_EXTENDS_DEPTH {
        return Err(ConfigError::Invalid(format!(
            "config 'extends' chain deeper than {MAX_EXTENDS_DEPTH} at {}",
            path.display()
        )));
    }
    let content = fs::read_to_string(path)?;
    let mut table: toml::Table = toml::from_str(&content)?;

    match table.remove("extends") {
        None => Ok(table),
        Some(toml::Value::String(base)) => {
            let base_path = path.parent().unwrap_or_else(|| Path::new(".")).join(base);
            log::debug!("{} extends {}", path.display(), base_path.display());
            let mut merged = load_table(&base_path, depth + 1)?;
            merge_tables(&mut merged, table);
            Ok(merged)
        }
        Some(other) => Err(ConfigError::Invalid(format!(
            "'extends' must be a file path string, got {}",
            other.type_str()
        ))),
    }
}

/// Overlays `overlay` onto `base`: nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.trace_buffer_size(5.0), 50);
        assert_eq!(config.belt.transport, Transport::Ble);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ExperimentConfig::from_toml_str(
            r#"
            name = "Short"

            [timing]
            baseline_duration_sec = 4.0

            [dot]
            feedback_mode = "trinary"
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "Short");
        assert_eq!(config.timing.baseline_duration_sec, 4.0);
        assert_eq!(config.timing.countdown_duration_sec, 3.0);
        assert_eq!(
            config.dot.feedback_mode(),
            FeedbackMode::Trinary {
                threshold_low: 1.0,
                threshold_mid: 2.0
            }
        );
    }

    #[test]
    fn conditions_parse_from_toml() {
        let config = ExperimentConfig::from_toml_str(
            r#"
            [trial]
            conditions = ["wavy"]

            [[conditions]]
            name = "wavy"
            feedback_gain = 2.0
            segments = [
                { frequency_hz = 0.1, cycles = 2 },
                { frequency_hz = 0.25, cycles = 1 },
            ]
            "#,
        )
        .unwrap();
        let wavy = config.condition("wavy").unwrap();
        assert_eq!(wavy.segments.len(), 2);
        assert_eq!(wavy.feedback_gain, 2.0);
        assert!((wavy.total_duration() - 24.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_segment_is_a_parse_error() {
        let result = ExperimentConfig::from_toml_str(
            r#"
            [[conditions]]
            name = "broken"
            segments = [{ frequency_hz = 0.0, cycles = 2 }]
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_fast_period_and_unknown_references() {
        let fast = ExperimentConfig::default().with_belt(BeltConfig {
            period_ms: 5,
            ..BeltConfig::default()
        });
        assert!(matches!(fast.validate(), Err(ConfigError::Invalid(_))));

        let dangling = ExperimentConfig::default().with_trial(TrialConfig {
            conditions: vec!["nope".to_string()],
            ..TrialConfig::default()
        });
        assert!(matches!(dangling.validate(), Err(ConfigError::Invalid(_))));

        let mut columns = ExperimentConfig::default();
        columns.data_columns.push("heart_rate".to_string());
        assert!(columns.validate().is_err());
    }

    #[test]
    fn duplicate_names_must_agree() {
        let base = ExperimentConfig::default();
        let mut conditions = base.conditions.clone();
        conditions.push(presets::slow_steady(0.1, 3).unwrap());
        base.with_conditions(conditions.clone()).validate().unwrap();

        conditions.push(presets::slow_steady(0.2, 3).unwrap());
        assert!(base.with_conditions(conditions).validate().is_err());
    }

    #[test]
    fn with_overrides_leave_the_original_untouched() {
        let base = ExperimentConfig::default();
        let derived = base.with_timing(TimingConfig {
            baseline_duration_sec: 15.0,
            ..base.timing.clone()
        });
        assert_eq!(base.timing.baseline_duration_sec, 10.0);
        assert_eq!(derived.timing.baseline_duration_sec, 15.0);
        assert_eq!(derived.belt, base.belt);
    }

    #[test]
    fn extends_merges_onto_base() {
        let dir = tempfile::tempdir().unwrap();
        let mut base = fs::File::create(dir.path().join("defaults.toml")).unwrap();
        writeln!(
            base,
            r#"
            name = "Defaults"
            [belt]
            period_ms = 50
            transport = "usb"
            [timing]
            baseline_duration_sec = 8.0
            countdown_duration_sec = 2.0
            "#
        )
        .unwrap();
        let child_path = dir.path().join("study.toml");
        fs::write(
            &child_path,
            r#"
            extends = "defaults.toml"
            name = "Study"
            [timing]
            baseline_duration_sec = 12.0
            "#,
        )
        .unwrap();

        let config = ExperimentConfig::from_file(&child_path).unwrap();
        assert_eq!(config.name, "Study");
        assert_eq!(config.belt.period_ms, 50);
        assert_eq!(config.belt.transport, Transport::Usb);
        assert_eq!(config.timing.baseline_duration_sec, 12.0);
        assert_eq!(config.timing.countdown_duration_sec, 2.0);
    }

    #[test]
    fn extends_cycle_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.toml");
        fs::write(&path, "extends = \"loop.toml\"\n").unwrap();
        assert!(matches!(
            ExperimentConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
