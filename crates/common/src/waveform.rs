//! Sinusoidal breathing targets built from frequency/cycle segments.
//!
//! A [`Condition`] is an ordered list of [`Segment`]s. The
//! [`TargetGenerator`] lays the segments end to end and accumulates phase
//! across boundaries, so a change of frequency bends the curve without
//! making it jump.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::error::WaveformError;

/// A fixed-frequency run of whole sinusoidal cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSegment", into = "RawSegment")]
pub struct Segment {
    frequency_hz: f64,
    cycles: u32,
}

#[derive(Serialize, Deserialize)]
struct RawSegment {
    frequency_hz: f64,
    cycles: u32,
}

impl TryFrom<RawSegment> for Segment {
    type Error = WaveformError;

    fn try_from(raw: RawSegment) -> Result<Self, Self::Error> {
        Segment::new(raw.frequency_hz, raw.cycles)
    }
}

impl From<Segment> for RawSegment {
    fn from(segment: Segment) -> Self {
        RawSegment {
            frequency_hz: segment.frequency_hz,
            cycles: segment.cycles,
        }
    }
}

impl Segment {
    pub fn new(frequency_hz: f64, cycles: u32) -> Result<Self, WaveformError> {
        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(WaveformError::InvalidSegment(format!(
                "frequency must be positive, got {frequency_hz} Hz"
            )));
        }
        if cycles == 0 {
            return Err(WaveformError::InvalidSegment(
                "cycle count must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            frequency_hz,
            cycles,
        })
    }

    /// For compile-time-known parameters that are valid by construction.
    pub(crate) const fn from_parts(frequency_hz: f64, cycles: u32) -> Self {
        Self {
            frequency_hz,
            cycles,
        }
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// `cycles / frequency_hz` seconds.
    pub fn duration(&self) -> f64 {
        self.cycles as f64 / self.frequency_hz
    }
}

fn default_gain() -> f64 {
    1.0
}

/// Named trial definition: target segments plus the visual feedback gain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default = "default_gain")]
    pub feedback_gain: f64,
}

impl Condition {
    pub fn new(name: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            name: name.into(),
            segments,
            feedback_gain: 1.0,
        }
    }

    pub fn with_gain(mut self, feedback_gain: f64) -> Self {
        self.feedback_gain = feedback_gain;
        self
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(Segment::duration).sum()
    }

    pub fn is_perturbed(&self) -> bool {
        self.feedback_gain != 1.0
    }

    pub fn validate(&self) -> Result<(), WaveformError> {
        if self.segments.is_empty() {
            return Err(WaveformError::EmptyCondition(self.name.clone()));
        }
        if !self.feedback_gain.is_finite() || self.feedback_gain <= 0.0 {
            return Err(WaveformError::InvalidGain {
                name: self.name.clone(),
                gain: self.feedback_gain,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PlacedSegment {
    frequency_hz: f64,
    start: f64,
    duration: f64,
    phase_offset: f64,
}

impl PlacedSegment {
    fn value_at(&self, local_t: f64) -> f64 {
        (TAU * self.frequency_hz * local_t + self.phase_offset).sin()
    }
}

/// Maps elapsed tracking time to the target force.
///
/// Evaluation has no side effects, so the same generator may be queried
/// out of order (e.g. to redraw a history window). Times past
/// [`total_duration`](Self::total_duration) hold the value at the end of
/// the last segment.
#[derive(Debug, Clone)]
pub struct TargetGenerator {
    segments: Vec<PlacedSegment>,
    center: f64,
    amplitude: f64,
    initial_phase: f64,
    total_duration: f64,
}

impl TargetGenerator {
    pub fn new(segments: &[Segment], center: f64, amplitude: f64) -> Result<Self, WaveformError> {
        Self::with_initial_phase(segments, center, amplitude, 0.0)
    }

    pub fn for_condition(
        condition: &Condition,
        center: f64,
        amplitude: f64,
    ) -> Result<Self, WaveformError> {
        if condition.segments.is_empty() {
            return Err(WaveformError::EmptyCondition(condition.name.clone()));
        }
        Self::new(&condition.segments, center, amplitude)
    }

    /// Like [`new`](Self::new), with the first segment starting at
    /// `initial_phase` radians instead of zero.
    pub fn with_initial_phase(
        segments: &[Segment],
        center: f64,
        amplitude: f64,
        initial_phase: f64,
    ) -> Result<Self, WaveformError> {
        if segments.is_empty() {
            return Err(WaveformError::EmptyCondition(String::from("<anonymous>")));
        }

        let mut placed = Vec::with_capacity(segments.len());
        let mut start = 0.0;
        let mut phase = initial_phase.rem_euclid(TAU);
        for segment in segments {
            let duration = segment.duration();
            placed.push(PlacedSegment {
                frequency_hz: segment.frequency_hz(),
                start,
                duration,
                phase_offset: phase,
            });
            // Carry the phase reached at the end of this segment into the next one.
            phase = (phase + TAU * segment.frequency_hz() * duration).rem_euclid(TAU);
            start += duration;
        }

        Ok(Self {
            segments: placed,
            center,
            amplitude,
            initial_phase,
            total_duration: start,
        })
    }

    pub fn total_duration(&self) -> f64 {
        self.total_duration
    }

    pub fn center(&self) -> f64 {
        self.center
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn initial_phase(&self) -> f64 {
        self.initial_phase
    }

    /// Index of the segment active at `t`; a boundary belongs to the
    /// segment that starts there.
    pub fn segment_index(&self, t: f64) -> usize {
        self.segments
            .partition_point(|segment| segment.start <= t)
            .saturating_sub(1)
    }

    pub fn get_target(&self, t: f64) -> Result<f64, WaveformError> {
        if !t.is_finite() || t < 0.0 {
            return Err(WaveformError::InvalidTime(t));
        }

        let unit = if t >= self.total_duration {
            match self.segments.last() {
                Some(last) => last.value_at(last.duration),
                None => 0.0,
            }
        } else {
            let segment = &self.segments[self.segment_index(t)];
            segment.value_at(t - segment.start)
        };

        Ok(self.center + self.amplitude * unit)
    }
}
