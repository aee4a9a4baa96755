//! Breathing range estimation from a window of raw belt forces.

use crate::config::RangeCalConfig;

/// Center/amplitude used when calibration saw no data at all.
pub const FALLBACK_CENTER: f64 = 5.0;
pub const FALLBACK_AMPLITUDE: f64 = 2.0;

const BASELINE_MIN_AMPLITUDE: f64 = 0.5;
const Y_RANGE_PADDING: f64 = 0.2;

/// Percentile-clipped breathing range for one calibration window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRange {
    pub low: f64,
    pub high: f64,
    pub center: f64,
    pub amplitude: f64,
    /// Display y-range: the clipped span padded on both sides.
    pub y_min: f64,
    pub y_max: f64,
    pub raw_min: f64,
    pub raw_max: f64,
    /// Samples at or beyond the sensor's saturation limits.
    pub saturated: usize,
    pub sample_count: usize,
}

impl CalibrationRange {
    pub fn fallback() -> Self {
        let low = FALLBACK_CENTER - FALLBACK_AMPLITUDE;
        let high = FALLBACK_CENTER + FALLBACK_AMPLITUDE;
        Self {
            low,
            high,
            center: FALLBACK_CENTER,
            amplitude: FALLBACK_AMPLITUDE,
            y_min: 0.0,
            y_max: 10.0,
            raw_min: low,
            raw_max: high,
            saturated: 0,
            sample_count: 0,
        }
    }

    pub fn from_samples(forces: &[f64], config: &RangeCalConfig) -> Self {
        let mut sorted: Vec<f64> = forces.iter().copied().filter(|f| f.is_finite()).collect();
        if sorted.is_empty() {
            return Self::fallback();
        }
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len();
        let lo_idx = (n * config.percentile_lo as usize / 100).min(n - 1);
        let hi_idx = (n * config.percentile_hi as usize / 100)
            .saturating_sub(1)
            .min(n - 1)
            .max(lo_idx);

        let low = sorted[lo_idx];
        let high = sorted[hi_idx];
        let span = high - low;
        let saturated = sorted
            .iter()
            .filter(|&&f| f <= config.saturation_lo || f >= config.saturation_hi)
            .count();

        Self {
            low,
            high,
            center: (high + low) / 2.0,
            amplitude: (span / 2.0 * config.scale).max(config.min_amplitude),
            y_min: low - span * Y_RANGE_PADDING,
            y_max: high + span * Y_RANGE_PADDING,
            raw_min: sorted[0],
            raw_max: sorted[n - 1],
            saturated,
            sample_count: n,
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated > 0
    }
}

/// Min/max estimate from a per-trial baseline window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineEstimate {
    pub center: f64,
    pub amplitude: f64,
}

impl BaselineEstimate {
    pub fn from_samples(forces: &[f64]) -> Self {
        let (lo, hi) = forces
            .iter()
            .copied()
            .filter(|f| f.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), f| {
                (lo.min(f), hi.max(f))
            });
        if lo > hi {
            return Self {
                center: FALLBACK_CENTER,
                amplitude: FALLBACK_AMPLITUDE,
            };
        }
        Self {
            center: (hi + lo) / 2.0,
            amplitude: ((hi - lo) / 2.0).max(BASELINE_MIN_AMPLITUDE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 / 10.0).collect()
    }

    #[test]
    fn clips_at_percentiles() {
        let config = RangeCalConfig::default();
        // 0.0 ..= 9.9 in 0.1 steps, shuffled order must not matter.
        let mut forces = ramp(100);
        forces.reverse();
        let range = CalibrationRange::from_samples(&forces, &config);
        assert_abs_diff_eq!(range.low, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(range.high, 9.4, epsilon = 1e-12);
        assert_abs_diff_eq!(range.center, 4.95, epsilon = 1e-12);
        assert_abs_diff_eq!(range.amplitude, (9.4 - 0.5) / 2.0 * 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(range.y_min, 0.5 - 8.9 * 0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(range.raw_max, 9.9, epsilon = 1e-12);
        assert_eq!(range.sample_count, 100);
        // 0.0 sits on the lower saturation limit.
        assert_eq!(range.saturated, 1);
    }

    #[test]
    fn narrow_range_is_floored() {
        let config = RangeCalConfig::default();
        let range = CalibrationRange::from_samples(&[5.0, 5.01, 5.02, 4.99], &config);
        assert_eq!(range.amplitude, config.min_amplitude);
    }

    #[test]
    fn single_sample_does_not_panic() {
        let range = CalibrationRange::from_samples(&[3.0], &RangeCalConfig::default());
        assert_eq!(range.low, 3.0);
        assert_eq!(range.high, 3.0);
        assert_eq!(range.center, 3.0);
    }

    #[test]
    fn empty_window_uses_fallback() {
        let range = CalibrationRange::from_samples(&[], &RangeCalConfig::default());
        assert_eq!(range.center, FALLBACK_CENTER);
        assert_eq!(range.amplitude, FALLBACK_AMPLITUDE);
    }

    #[test]
    fn baseline_estimate() {
        let estimate = BaselineEstimate::from_samples(&[2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_abs_diff_eq!(estimate.center, 6.0);
        assert_abs_diff_eq!(estimate.amplitude, 4.0);

        let flat = BaselineEstimate::from_samples(&[5.0, 5.0]);
        assert_abs_diff_eq!(flat.amplitude, 0.5);

        let empty = BaselineEstimate::from_samples(&[]);
        assert_abs_diff_eq!(empty.center, 5.0);
        assert_abs_diff_eq!(empty.amplitude, 2.0);
    }
}
