use serde::{Deserialize, Serialize};

pub mod calibration;
pub mod clock;
pub mod config;
pub mod error;
pub mod feedback;
pub mod presets;
pub mod recorder;
pub mod schedule;
pub mod waveform;

pub use calibration::{BaselineEstimate, CalibrationRange};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ExperimentConfig, Transport};
pub use error::{ConfigError, RecorderError, WaveformError};
pub use feedback::{
    ErrorSource, Evaluation, Feedback, FeedbackEvaluator, FeedbackLevel, FeedbackMode,
};
pub use recorder::{Phase, SessionRecorder, SessionRow};
pub use schedule::{ScheduledTrial, TrialMethod, TrialSchedule};
pub use waveform::{Condition, Segment, TargetGenerator};

/// One belt reading, stamped when the blocking read returned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds on the acquiring bridge's clock.
    pub timestamp: f64,
    /// Primary channel value in newtons.
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}
