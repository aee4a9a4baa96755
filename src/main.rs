mod cli;
mod menu;
mod session;

use std::error::Error;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use acquisition::{
    connect_with_fallback, BeltSettings, ReplaySource, SampleSource, SimulatedBelt,
};
use clap::Parser;
use common::{Clock, ExperimentConfig, MonotonicClock, Sample, TargetGenerator, Transport};
use log::{info, warn};

use cli::{Cli, Command, PreviewArgs, RunArgs, SourceArgs, StreamArgs, DEFAULT_CONFIG};
use session::{run_session, SessionOptions, SessionSummary};

type CliResult = Result<(), Box<dyn Error>>;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    let config = match load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Some(Command::Run(args)) => run(&config, args),
        Some(Command::Stream(args)) => stream(&config, args),
        Some(Command::Preview(args)) => preview(&config, args),
        Some(Command::Validate) => validate(&config),
        None => interactive(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn load(path: Option<&Path>) -> Result<ExperimentConfig, Box<dyn Error>> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).is_file() => Path::new(DEFAULT_CONFIG),
        None => {
            info!("No config given; using built-in defaults");
            return Ok(ExperimentConfig::default());
        }
    };
    info!("Loading config from {}", path.display());
    Ok(ExperimentConfig::from_file(path)?)
}

/// Builds a fresh source per connection attempt.
fn source_factory(
    args: &SourceArgs,
) -> Result<impl FnMut(Transport) -> Box<dyn SampleSource>, Box<dyn Error>> {
    let replay = match &args.replay {
        Some(path) => {
            let replay = ReplaySource::from_session_file(path)?;
            info!("Replaying {} samples from {}", replay.remaining(), path.display());
            Some(replay)
        }
        None => None,
    };
    let ble_unavailable = args.ble_unavailable;
    Ok(move |_transport: Transport| -> Box<dyn SampleSource> {
        match &replay {
            Some(replay) => Box::new(replay.clone()),
            None if ble_unavailable => Box::new(SimulatedBelt::new().refusing(Transport::Ble)),
            None => Box::new(SimulatedBelt::new()),
        }
    })
}

fn run(config: &ExperimentConfig, args: RunArgs) -> CliResult {
    let config = match &args.output_dir {
        Some(dir) => config.with_output_dir(dir),
        None => config.clone(),
    };
    let options = SessionOptions {
        participant: args.participant,
        session: args.session,
        seed: args.seed,
    };
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let summary = run_session(&config, &options, clock, source_factory(&args.source)?)?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &SessionSummary) {
    println!("\n=== Session Summary ===");
    println!("Data file: {}", summary.path.display());
    println!("Transport: {}", summary.transport);
    println!(
        "Range: center {:.2} N, amplitude {:.2} N ({} samples)",
        summary.calibration.center, summary.calibration.amplitude, summary.calibration.sample_count
    );
    for trial in &summary.trials {
        println!(
            "Trial {:>2} {:<16} gain {:<4} mean |visual error| {:.3} N, |true error| {:.3} N",
            trial.trial_num,
            trial.condition,
            trial.feedback_gain,
            trial.mean_abs_visual_error,
            trial.mean_abs_true_error
        );
        print!(
            "         baseline {:.2} ± {:.2} N",
            trial.baseline.center, trial.baseline.amplitude
        );
        match trial.trace_span {
            Some((lo, hi)) => println!(", trace {lo:.2}..{hi:.2} N"),
            None => println!(),
        }
    }
    println!("Rows written: {}", summary.rows_written);
    println!("Gaps: {}, overflowed: {}", summary.gaps, summary.overflowed);
    if summary.ended_early {
        println!(
            "Session ended early: {}",
            summary.fault.as_deref().unwrap_or("belt stopped")
        );
    }
}

fn print_sample(sample: &Sample) {
    println!("{:>9.3} s  {:>8.3} N", sample.timestamp, sample.value);
}

fn stream(config: &ExperimentConfig, args: StreamArgs) -> CliResult {
    if args.use_async {
        let runtime = tokio::runtime::Runtime::new()?;
        return runtime.block_on(stream_async(config, args));
    }

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let settings = BeltSettings::from_config(&config.belt);
    let mut bridge = connect_with_fallback(
        &settings,
        config.belt.fallback_to_usb,
        Arc::clone(&clock),
        source_factory(&args.source)?,
    )?;
    let frame = Duration::from_millis(config.timing.frame_period_ms);
    let mut shown = 0usize;

    {
        // Stop runs when the guard drops, on every return path below.
        let acquisition = bridge.guard();
        while clock.now() < args.seconds {
            if args.latest {
                if let Some(sample) = acquisition.get_latest() {
                    print_sample(&sample);
                    shown += 1;
                }
            } else {
                for sample in acquisition.get_all() {
                    print_sample(&sample);
                    shown += 1;
                }
            }
            if !acquisition.is_running() {
                warn!("Belt stopped: {}", acquisition.last_fault().unwrap_or_default());
                break;
            }
            thread::sleep(frame);
        }
    }

    println!(
        "{shown} samples shown, {} read, {} gaps, {} overflowed",
        bridge.read_count(),
        bridge.gap_count(),
        bridge.overflow_count()
    );
    Ok(())
}

async fn stream_async(config: &ExperimentConfig, args: StreamArgs) -> CliResult {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let settings = BeltSettings::from_config(&config.belt);
    let mut acquisition = async_acquisition::connect_with_fallback(
        &settings,
        config.belt.fallback_to_usb,
        Arc::clone(&clock),
        source_factory(&args.source)?,
    )
    .await?;

    let frame = Duration::from_millis(config.timing.frame_period_ms);
    let mut shown = 0usize;
    while clock.now() < args.seconds && acquisition.is_running() {
        if args.latest {
            if let Some(sample) = acquisition.get_latest() {
                print_sample(&sample);
                shown += 1;
            }
        } else {
            for sample in acquisition.get_all() {
                print_sample(&sample);
                shown += 1;
            }
        }
        tokio::time::sleep(frame).await;
    }
    if let Some(fault) = acquisition.last_fault() {
        warn!("Belt stopped: {fault}");
    }
    acquisition.stop().await;

    println!(
        "{shown} samples shown, {} read, {} gaps, {} dropped",
        acquisition.read_count(),
        acquisition.gap_count(),
        acquisition.dropped_count()
    );
    Ok(())
}

fn preview(config: &ExperimentConfig, args: PreviewArgs) -> CliResult {
    if !(args.step.is_finite() && args.step > 0.0) {
        return Err(format!("--step must be positive, got {}", args.step).into());
    }
    let condition = config
        .condition(&args.condition)
        .ok_or_else(|| format!("unknown condition '{}'", args.condition))?;
    let generator = TargetGenerator::for_condition(condition, args.center, args.amplitude)?;
    let duration = generator.total_duration();

    println!(
        "{} ({} segments, gain {}, {:.1} s)",
        condition.name,
        condition.segments.len(),
        condition.feedback_gain,
        duration
    );
    let steps = (duration / args.step).floor() as u64;
    for i in 0..=steps {
        let t = i as f64 * args.step;
        let target = generator.get_target(t)?;
        println!(
            "{t:>8.2} s  seg {}  {target:>8.3} N",
            generator.segment_index(t)
        );
    }
    Ok(())
}

fn validate(config: &ExperimentConfig) -> CliResult {
    config.validate()?;
    println!("Config '{}' is valid", config.name);
    println!(
        "Belt: {} at {} ms (fallback to USB: {})",
        config.belt.transport, config.belt.period_ms, config.belt.fallback_to_usb
    );
    let mut total = config.timing.range_cal_duration_sec;
    for name in &config.trial.conditions {
        if let Some(condition) = config.condition(name) {
            let tracking = config.timing.tracking_duration(condition);
            println!(
                "  {:<16} {:>6.1} s  gain {}",
                condition.name, tracking, condition.feedback_gain
            );
            total += (config.timing.baseline_duration_sec
                + config.timing.countdown_duration_sec
                + tracking)
                * config.trial.n_reps as f64;
        }
    }
    println!(
        "{} trials ({:?}), about {:.0} s per session",
        config.trial.conditions.len() * config.trial.n_reps as usize,
        config.trial.method,
        total
    );
    Ok(())
}

fn interactive(config: &ExperimentConfig) -> CliResult {
    println!("===========================================");
    println!("Welcome to the Breath Tracking Toolbox");
    println!("===========================================");

    loop {
        menu::show_menu()?;

        let outcome = match menu::get_user_choice()? {
            Some(1) => {
                let participant = menu::prompt("Participant id: ")?;
                let session = menu::prompt("Session number [1]: ")?;
                run(
                    config,
                    RunArgs {
                        participant,
                        session: session.parse().unwrap_or(1),
                        seed: None,
                        output_dir: None,
                        source: SourceArgs {
                            replay: None,
                            ble_unavailable: false,
                        },
                    },
                )
            }
            Some(2) => stream(
                config,
                StreamArgs {
                    seconds: 5.0,
                    latest: true,
                    use_async: false,
                    source: SourceArgs {
                        replay: None,
                        ble_unavailable: false,
                    },
                },
            ),
            Some(3) => {
                let name = menu::prompt("Condition [slow_steady]: ")?;
                preview(
                    config,
                    PreviewArgs {
                        condition: if name.is_empty() { "slow_steady".to_string() } else { name },
                        step: 1.0,
                        center: common::calibration::FALLBACK_CENTER,
                        amplitude: common::calibration::FALLBACK_AMPLITUDE,
                    },
                )
            }
            Some(4) => validate(config),
            Some(menu::EXIT) | None => {
                println!("Goodbye!");
                return Ok(());
            }
            _ => {
                println!("Invalid choice. Please select 1-5.");
                continue;
            }
        };

        if let Err(err) = outcome {
            println!("error: {err}");
        }
        menu::wait_for_enter()?;
    }
}
