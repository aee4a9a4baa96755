//! Gain perturbation, tracking errors and dot colour feedback.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Sample;

/// How the target dot's colour reacts to tracking error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedbackMode {
    /// Continuous green-to-red ramp, saturating at `max_error`.
    Graded { max_error: f64 },
    Binary { threshold: f64 },
    Trinary { threshold_low: f64, threshold_mid: f64 },
}

/// Which error drives the colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Error as seen through the (possibly perturbed) trace.
    #[default]
    Visual,
    /// Error of the unperturbed physical signal.
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLevel {
    Good,
    Moderate,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Feedback {
    Level(FeedbackLevel),
    /// `severity` in `[0, 1]`; `rgb` components in `[0, 1]`.
    Graded { severity: f64, rgb: [f64; 3] },
}

impl fmt::Display for FeedbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeedbackLevel::Good => "good",
            FeedbackLevel::Moderate => "moderate",
            FeedbackLevel::Bad => "bad",
        })
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feedback::Level(level) => level.fmt(f),
            Feedback::Graded { severity, .. } => write!(f, "graded:{severity:.3}"),
        }
    }
}

impl Feedback {
    /// `#rrggbb` for graded feedback.
    pub fn hex(&self) -> Option<String> {
        match self {
            Feedback::Graded { rgb, .. } => {
                let [r, g, b] = rgb.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
                Some(format!("#{r:02x}{g:02x}{b:02x}"))
            }
            Feedback::Level(_) => None,
        }
    }
}

/// Everything the frame loop needs for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub display_value: f64,
    pub true_error: f64,
    pub visual_error: f64,
    pub feedback: Feedback,
}

#[derive(Debug, Clone, Copy)]
pub struct FeedbackEvaluator {
    gain: f64,
    center: f64,
    mode: FeedbackMode,
    source: ErrorSource,
}

impl FeedbackEvaluator {
    pub fn new(gain: f64, center: f64, mode: FeedbackMode) -> Self {
        Self {
            gain,
            center,
            mode,
            source: ErrorSource::Visual,
        }
    }

    pub fn with_error_source(mut self, source: ErrorSource) -> Self {
        self.source = source;
        self
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn center(&self) -> f64 {
        self.center
    }

    /// `center + gain * (value - center)`; the identity at unit gain.
    pub fn display_value(&self, value: f64) -> f64 {
        if self.gain == 1.0 {
            return value;
        }
        self.center + self.gain * (value - self.center)
    }

    /// Perturbed copy of a trace history for drawing.
    pub fn apply_gain<'a>(&self, values: impl IntoIterator<Item = &'a f64>) -> Vec<f64> {
        values.into_iter().map(|&v| self.display_value(v)).collect()
    }

    pub fn evaluate(&self, sample: &Sample, target: f64) -> Evaluation {
        let display_value = self.display_value(sample.value);
        let true_error = target - sample.value;
        let visual_error = target - display_value;
        let driving_error = match self.source {
            ErrorSource::Visual => visual_error,
            ErrorSource::True => true_error,
        };

        Evaluation {
            display_value,
            true_error,
            visual_error,
            feedback: self.classify(driving_error),
        }
    }

    pub fn classify(&self, error: f64) -> Feedback {
        let magnitude = error.abs();
        match self.mode {
            FeedbackMode::Graded { max_error } => {
                let severity = graded_severity(magnitude, max_error);
                Feedback::Graded {
                    severity,
                    rgb: severity_to_rgb(severity),
                }
            }
            FeedbackMode::Binary { threshold } => {
                if magnitude <= threshold {
                    Feedback::Level(FeedbackLevel::Good)
                } else {
                    Feedback::Level(FeedbackLevel::Bad)
                }
            }
            FeedbackMode::Trinary {
                threshold_low,
                threshold_mid,
            } => {
                if magnitude <= threshold_low {
                    Feedback::Level(FeedbackLevel::Good)
                } else if magnitude <= threshold_mid {
                    Feedback::Level(FeedbackLevel::Moderate)
                } else {
                    Feedback::Level(FeedbackLevel::Bad)
                }
            }
        }
    }
}

/// Square-root ramp so small errors already move away from green.
fn graded_severity(magnitude: f64, max_error: f64) -> f64 {
    if max_error <= 0.0 {
        return if magnitude > 0.0 { 1.0 } else { 0.0 };
    }
    (magnitude / max_error).min(1.0).sqrt()
}

/// Hue runs from 120° (green) at severity 0 to 0° (red) at severity 1.
pub fn severity_to_rgb(severity: f64) -> [f64; 3] {
    let hue = (1.0 - severity.clamp(0.0, 1.0)) / 3.0;
    hsv_to_rgb(hue, 1.0, 1.0)
}

fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [f64; 3] {
    if s == 0.0 {
        return [v, v, v];
    }
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match (sector as i64).rem_euclid(6) {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const GRADED: FeedbackMode = FeedbackMode::Graded { max_error: 3.0 };

    #[test]
    fn feedback_labels() {
        assert_eq!(Feedback::Level(FeedbackLevel::Moderate).to_string(), "moderate");
        let evaluator = FeedbackEvaluator::new(1.0, 0.0, GRADED);
        let zero = evaluator.classify(0.0);
        assert_eq!(zero.to_string(), "graded:0.000");
        assert_eq!(zero.hex().as_deref(), Some("#00ff00"));
        assert_eq!(evaluator.classify(10.0).hex().as_deref(), Some("#ff0000"));
        assert_eq!(Feedback::Level(FeedbackLevel::Good).hex(), None);
    }

    #[test]
    fn unit_gain_is_exact_identity() {
        for &center in &[0.0, 5.0, 15.0, -3.25, 1e6] {
            let evaluator = FeedbackEvaluator::new(1.0, center, GRADED);
            for &value in &[0.1, 17.0, 3.3333333333, -0.7, 12345.678] {
                let sample = Sample::new(0.0, value);
                let eval = evaluator.evaluate(&sample, 16.0);
                assert_eq!(eval.display_value, value);
                assert_eq!(eval.visual_error, eval.true_error);
            }
        }
    }

    #[test]
    fn doubled_gain_worked_example() {
        let evaluator = FeedbackEvaluator::new(2.0, 15.0, GRADED);
        let eval = evaluator.evaluate(&Sample::new(1.0, 17.0), 16.0);
        assert_abs_diff_eq!(eval.display_value, 19.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eval.true_error, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eval.visual_error, -3.0, epsilon = 1e-12);
    }

    #[test]
    fn true_error_ignores_gain() {
        let sample = Sample::new(0.0, 7.5);
        let plain = FeedbackEvaluator::new(1.0, 5.0, GRADED).evaluate(&sample, 6.0);
        let perturbed = FeedbackEvaluator::new(1.8, 5.0, GRADED).evaluate(&sample, 6.0);
        assert_eq!(plain.true_error, perturbed.true_error);
        assert_abs_diff_eq!(
            perturbed.visual_error,
            6.0 - 5.0 - 1.8 * (7.5 - 5.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn binary_threshold_is_inclusive() {
        let evaluator = FeedbackEvaluator::new(1.0, 0.0, FeedbackMode::Binary { threshold: 1.0 });
        assert_eq!(evaluator.classify(1.0), Feedback::Level(FeedbackLevel::Good));
        assert_eq!(evaluator.classify(-1.0), Feedback::Level(FeedbackLevel::Good));
        assert_eq!(evaluator.classify(1.01), Feedback::Level(FeedbackLevel::Bad));
    }

    #[test]
    fn trinary_bands() {
        let evaluator = FeedbackEvaluator::new(
            1.0,
            0.0,
            FeedbackMode::Trinary {
                threshold_low: 1.0,
                threshold_mid: 2.0,
            },
        );
        assert_eq!(evaluator.classify(0.5), Feedback::Level(FeedbackLevel::Good));
        assert_eq!(evaluator.classify(-1.5), Feedback::Level(FeedbackLevel::Moderate));
        assert_eq!(evaluator.classify(2.0), Feedback::Level(FeedbackLevel::Moderate));
        assert_eq!(evaluator.classify(2.5), Feedback::Level(FeedbackLevel::Bad));
    }

    #[test]
    fn graded_runs_green_to_red_and_saturates() {
        let evaluator = FeedbackEvaluator::new(1.0, 0.0, GRADED);
        match evaluator.classify(0.0) {
            Feedback::Graded { severity, rgb } => {
                assert_eq!(severity, 0.0);
                assert_abs_diff_eq!(rgb[0], 0.0, epsilon = 1e-12);
                assert_abs_diff_eq!(rgb[1], 1.0, epsilon = 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
        let at_max = evaluator.classify(3.0);
        assert_eq!(evaluator.classify(30.0), at_max);
        match at_max {
            Feedback::Graded { severity, rgb } => {
                assert_eq!(severity, 1.0);
                assert_abs_diff_eq!(rgb[0], 1.0, epsilon = 1e-12);
                assert_abs_diff_eq!(rgb[1], 0.0, epsilon = 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_source_selects_what_drives_colour() {
        let mode = FeedbackMode::Binary { threshold: 1.5 };
        let sample = Sample::new(0.0, 17.0);
        let visual = FeedbackEvaluator::new(2.0, 15.0, mode).evaluate(&sample, 16.0);
        let physical = FeedbackEvaluator::new(2.0, 15.0, mode)
            .with_error_source(ErrorSource::True)
            .evaluate(&sample, 16.0);
        assert_eq!(visual.feedback, Feedback::Level(FeedbackLevel::Bad));
        assert_eq!(physical.feedback, Feedback::Level(FeedbackLevel::Good));
    }

    #[test]
    fn apply_gain_scales_about_center() {
        let evaluator = FeedbackEvaluator::new(1.5, 5.0, GRADED);
        let shown = evaluator.apply_gain(&[5.0, 7.0, 3.0]);
        assert_eq!(shown, vec![5.0, 8.0, 2.0]);
    }
}
