use thiserror::Error;

/// Precondition violations in the waveform layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WaveformError {
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    #[error("condition '{0}' has no segments")]
    EmptyCondition(String),

    #[error("invalid feedback gain {gain} for condition '{name}'")]
    InvalidGain { name: String, gain: f64 },

    #[error("elapsed time must be finite and non-negative, got {0}")]
    InvalidTime(f64),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Waveform(#[from] WaveformError),
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("unknown data column: {0}")]
    UnknownColumn(String),
}
