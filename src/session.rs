//! Headless breath tracking session: range calibration, then for every
//! scheduled trial a baseline, a countdown and a tracking phase.

use std::collections::VecDeque;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acquisition::{connect_with_fallback, AcquisitionBridge, BeltSettings, SampleSource};
use common::recorder::create_session_path;
use common::{
    BaselineEstimate, CalibrationRange, Clock, ExperimentConfig, FeedbackEvaluator, Phase, Sample,
    ScheduledTrial, SessionRecorder, SessionRow, TargetGenerator, TrialSchedule, Transport,
};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

pub type SessionResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub participant: String,
    pub session: u32,
    /// Fixes the trial order for `random`/`full_random` schedules.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TrialSummary {
    pub trial_num: u32,
    pub condition: String,
    pub feedback_gain: f64,
    pub baseline: BaselineEstimate,
    pub samples: usize,
    pub mean_abs_visual_error: f64,
    pub mean_abs_true_error: f64,
    /// Lowest and highest value left in the display trace.
    pub trace_span: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub transport: Transport,
    pub calibration: CalibrationRange,
    pub trials: Vec<TrialSummary>,
    pub rows_written: u64,
    pub ended_early: bool,
    pub fault: Option<String>,
    pub gaps: u64,
    pub overflowed: u64,
}

enum PhaseEnd {
    Completed,
    Faulted,
}

/// Frame-paced consumer of a running bridge.
///
/// Phases are laid end to end on the bridge clock; a sample belongs to the
/// phase whose window contains its timestamp.
struct FrameLoop {
    bridge: AcquisitionBridge,
    clock: Arc<dyn Clock>,
    frame_period: Duration,
    phase_start: f64,
    pending: VecDeque<Sample>,
    frame: u64,
}

impl FrameLoop {
    fn new(bridge: AcquisitionBridge, clock: Arc<dyn Clock>, frame_period: Duration) -> Self {
        let phase_start = bridge.started_at().unwrap_or_else(|| clock.now());
        Self {
            bridge,
            clock,
            frame_period,
            phase_start,
            pending: VecDeque::new(),
            frame: 0,
        }
    }

    /// Feeds every sample in `[phase_start, phase_start + duration)` to
    /// `on_sample` as `(frame, sample, seconds into phase)`.
    fn run_phase<F>(&mut self, phase: Phase, duration: f64, mut on_sample: F) -> SessionResult<PhaseEnd>
    where
        F: FnMut(u64, Sample, f64) -> SessionResult<()>,
    {
        let start = self.phase_start;
        let end = start + duration;
        info!("Phase {phase} for {duration:.1}s");

        loop {
            let now = self.clock.now();
            self.frame += 1;
            let mut arrived: Vec<Sample> = self.pending.drain(..).collect();
            arrived.extend(self.bridge.get_all());

            for sample in arrived {
                if sample.timestamp < start {
                    debug!("Dropping sample at {:.3}s from an earlier phase", sample.timestamp);
                } else if sample.timestamp >= end {
                    self.pending.push_back(sample);
                } else {
                    on_sample(self.frame, sample, sample.timestamp - start)?;
                }
            }

            if now >= end {
                self.phase_start = end;
                return Ok(PhaseEnd::Completed);
            }
            if !self.bridge.is_running() {
                return Ok(PhaseEnd::Faulted);
            }
            thread::sleep(self.frame_period);
        }
    }
}

/// Fixed-length history of displayed values.
struct RollingTrace {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingTrace {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn span(&self) -> Option<(f64, f64)> {
        self.values.iter().fold(None, |span, &v| match span {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

pub fn run_session<F>(
    config: &ExperimentConfig,
    options: &SessionOptions,
    clock: Arc<dyn Clock>,
    make_source: F,
) -> SessionResult<SessionSummary>
where
    F: FnMut(Transport) -> Box<dyn SampleSource>,
{
    config.validate()?;
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let schedule = TrialSchedule::build(config, options.session, &mut rng)?;
    info!(
        "Session {} for participant {}: {} trials",
        options.session,
        options.participant,
        schedule.len()
    );

    let settings = BeltSettings::from_config(&config.belt);
    let bridge = connect_with_fallback(
        &settings,
        config.belt.fallback_to_usb,
        Arc::clone(&clock),
        make_source,
    )?;
    let transport = bridge.settings().transport;
    info!("Belt connected via {transport}");

    // No data file until a belt is connected.
    let session_label = format!("{:03}", options.session);
    let path = create_session_path(&options.participant, &session_label, &config.output_dir)?;
    let mut recorder = SessionRecorder::create(&path, &config.data_columns)?;

    let frame_period = Duration::from_millis(config.timing.frame_period_ms);
    let mut frames = FrameLoop::new(bridge, clock, frame_period);

    let mut summary = SessionSummary {
        path: path.clone(),
        transport,
        calibration: CalibrationRange::fallback(),
        trials: Vec::new(),
        rows_written: 0,
        ended_early: false,
        fault: None,
        gaps: 0,
        overflowed: 0,
    };

    let outcome = run_trials(config, &schedule, &mut frames, &mut recorder, &mut summary);

    frames.bridge.stop();
    summary.gaps = frames.bridge.gap_count();
    summary.overflowed = frames.bridge.overflow_count();
    summary.rows_written = recorder.rows_written();
    recorder.close()?;
    outcome?;

    if summary.ended_early {
        warn!(
            "Session ended early after {} trials; partial data kept in {}",
            summary.trials.len(),
            path.display()
        );
    }
    Ok(summary)
}

fn run_trials(
    config: &ExperimentConfig,
    schedule: &TrialSchedule,
    frames: &mut FrameLoop,
    recorder: &mut SessionRecorder,
    summary: &mut SessionSummary,
) -> SessionResult<()> {
    let mut forces = Vec::new();
    let end = frames.run_phase(
        Phase::RangeCal,
        config.timing.range_cal_duration_sec,
        |frame, sample, t| {
            forces.push(sample.value);
            recorder.record(&SessionRow {
                timestamp: t,
                frame,
                force_n: sample.value,
                phase: Some(Phase::RangeCal),
                feedback_gain: 1.0,
                sample_time: Some(sample.timestamp),
                display_force: Some(sample.value),
                ..SessionRow::default()
            })?;
            Ok(())
        },
    )?;
    summary.calibration = CalibrationRange::from_samples(&forces, &config.range_cal);
    let range = &summary.calibration;
    info!(
        "Range calibration: {} samples, center {:.2} N, amplitude {:.2} N",
        range.sample_count, range.center, range.amplitude
    );
    if range.sample_count == 0 {
        warn!("No data during range calibration; using fallback range");
    }
    if range.is_saturated() {
        warn!("{} calibration samples at the sensor limits", range.saturated);
    }
    if let PhaseEnd::Faulted = end {
        return record_fault(frames, summary);
    }

    for trial in schedule.iter() {
        match run_trial(config, trial, frames, recorder, summary.calibration)? {
            Some(trial_summary) => {
                info!(
                    "Trial {} ({}, gain {}): mean |visual error| {:.3} N over {} samples",
                    trial_summary.trial_num,
                    trial_summary.condition,
                    trial_summary.feedback_gain,
                    trial_summary.mean_abs_visual_error,
                    trial_summary.samples
                );
                summary.trials.push(trial_summary);
            }
            None => return record_fault(frames, summary),
        }
    }
    Ok(())
}

fn record_fault(frames: &FrameLoop, summary: &mut SessionSummary) -> SessionResult<()> {
    summary.ended_early = true;
    summary.fault = frames.bridge.last_fault();
    warn!(
        "Belt stopped mid-session: {}",
        summary.fault.as_deref().unwrap_or("reader exited")
    );
    Ok(())
}

/// Runs one trial; `None` when the belt faulted part way through.
fn run_trial(
    config: &ExperimentConfig,
    trial: &ScheduledTrial,
    frames: &mut FrameLoop,
    recorder: &mut SessionRecorder,
    range: CalibrationRange,
) -> SessionResult<Option<TrialSummary>> {
    let condition = &trial.condition;
    let base_row = SessionRow {
        condition: condition.name.clone(),
        trial_num: trial.trial_num,
        feedback_gain: 1.0,
        ..SessionRow::default()
    };

    let mut baseline_forces = Vec::new();
    let end = frames.run_phase(
        Phase::Baseline,
        config.timing.baseline_duration_sec,
        |frame, sample, t| {
            baseline_forces.push(sample.value);
            recorder.record(&SessionRow {
                timestamp: t,
                frame,
                force_n: sample.value,
                phase: Some(Phase::Baseline),
                sample_time: Some(sample.timestamp),
                display_force: Some(sample.value),
                ..base_row.clone()
            })?;
            Ok(())
        },
    )?;
    let baseline = BaselineEstimate::from_samples(&baseline_forces);
    debug!(
        "Trial {} baseline: center {:.2} N, amplitude {:.2} N",
        trial.trial_num, baseline.center, baseline.amplitude
    );
    if let PhaseEnd::Faulted = end {
        return Ok(None);
    }

    let end = frames.run_phase(
        Phase::Countdown,
        config.timing.countdown_duration_sec,
        |frame, sample, t| {
            recorder.record(&SessionRow {
                timestamp: t,
                frame,
                force_n: sample.value,
                phase: Some(Phase::Countdown),
                sample_time: Some(sample.timestamp),
                display_force: Some(sample.value),
                ..base_row.clone()
            })?;
            Ok(())
        },
    )?;
    if let PhaseEnd::Faulted = end {
        return Ok(None);
    }

    let generator = TargetGenerator::for_condition(condition, range.center, range.amplitude)?;
    let evaluator = FeedbackEvaluator::new(condition.feedback_gain, range.center, config.dot.feedback_mode())
        .with_error_source(config.dot.error_source);
    let trace_len = config.trace_buffer_size(config.timing.trace_window_sec);
    let mut trace = RollingTrace::new(trace_len);
    let mut visual_total = 0.0;
    let mut true_total = 0.0;
    let mut samples = 0usize;

    let end = frames.run_phase(
        Phase::Tracking,
        config.timing.tracking_duration(condition),
        |frame, sample, t| {
            let target = generator.get_target(t)?;
            let eval = evaluator.evaluate(&sample, target);
            trace.push(eval.display_value);
            visual_total += eval.visual_error.abs();
            true_total += eval.true_error.abs();
            samples += 1;

            recorder.record(&SessionRow {
                timestamp: t,
                frame,
                force_n: sample.value,
                target_force: Some(target),
                error: Some(eval.true_error),
                compensated_error: Some(eval.visual_error),
                phase: Some(Phase::Tracking),
                feedback_gain: condition.feedback_gain,
                sample_time: Some(sample.timestamp),
                display_force: Some(eval.display_value),
                feedback: Some(config.dot.color_for(&eval.feedback)),
                ..base_row.clone()
            })?;
            Ok(())
        },
    )?;
    if let PhaseEnd::Faulted = end {
        return Ok(None);
    }

    let mean = |total: f64| if samples == 0 { 0.0 } else { total / samples as f64 };
    Ok(Some(TrialSummary {
        trial_num: trial.trial_num,
        condition: condition.name.clone(),
        feedback_gain: condition.feedback_gain,
        baseline,
        samples,
        mean_abs_visual_error: mean(visual_total),
        mean_abs_true_error: mean(true_total),
        trace_span: trace.span(),
    }))
}
