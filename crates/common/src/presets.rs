//! Stock conditions for common breathing paradigms.

use crate::error::WaveformError;
use crate::waveform::{Condition, Segment};

/// Single slow frequency, veridical feedback.
pub fn slow_steady(frequency_hz: f64, cycles: u32) -> Result<Condition, WaveformError> {
    Ok(Condition::new("slow_steady", vec![Segment::new(frequency_hz, cycles)?]))
}

/// Slow breathing with the trace amplified by `feedback_gain` around the
/// participant's center.
pub fn perturbed_slow(
    frequency_hz: f64,
    cycles: u32,
    feedback_gain: f64,
) -> Result<Condition, WaveformError> {
    let condition = Condition::new("perturbed_slow", vec![Segment::new(frequency_hz, cycles)?])
        .with_gain(feedback_gain);
    condition.validate()?;
    Ok(condition)
}

/// A slow block followed by a fast one.
pub fn mixed_rhythm(
    slow_hz: f64,
    slow_cycles: u32,
    fast_hz: f64,
    fast_cycles: u32,
) -> Result<Condition, WaveformError> {
    Ok(Condition::new(
        "mixed_rhythm",
        vec![
            Segment::new(slow_hz, slow_cycles)?,
            Segment::new(fast_hz, fast_cycles)?,
        ],
    ))
}

/// `slow_steady` (0.1 Hz x 3), `perturbed_slow` (same, gain 1.5) and
/// `mixed_rhythm` (0.1 Hz x 3 then 0.3 Hz x 1).
pub fn stock() -> Vec<Condition> {
    let slow = Segment::from_parts(0.1, 3);
    let fast = Segment::from_parts(0.3, 1);
    vec![
        Condition::new("slow_steady", vec![slow]),
        Condition::new("perturbed_slow", vec![slow]).with_gain(1.5),
        Condition::new("mixed_rhythm", vec![slow, fast]),
    ]
}
