use std::env;
use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use acquisition::{AcquisitionBridge, BeltSettings, SampleQueue, SimulatedBelt};
use async_acquisition::AsyncAcquisition;
use common::config::{load_config, ExperimentConfig};
use common::{Clock, FeedbackEvaluator, MonotonicClock, Sample, TargetGenerator};
use criterion::{black_box, Criterion};
use log::info;
use serde::Serialize;

/// One sample as seen by the consumer.
#[derive(Debug, Clone, Serialize)]
struct HandoffRecord {
    bridge: &'static str,
    index: usize,
    timestamp: f64,
    value: f64,
    /// Delay between the read returning and the consumer draining it.
    handoff_latency_us: f64,
}

struct RunStats {
    records: Vec<HandoffRecord>,
    gaps: u64,
    lost: u64,
    elapsed: Duration,
}

fn drain_into(records: &mut Vec<HandoffRecord>, bridge: &'static str, samples: Vec<Sample>, now: f64) {
    for sample in samples {
        records.push(HandoffRecord {
            bridge,
            index: records.len(),
            timestamp: sample.timestamp,
            value: sample.value,
            handoff_latency_us: (now - sample.timestamp) * 1e6,
        });
    }
}

fn run_threaded(settings: &BeltSettings, seconds: f64, frame: Duration) -> Result<RunStats, Box<dyn Error>> {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let mut bridge =
        AcquisitionBridge::new(Box::new(SimulatedBelt::new()), settings.clone()).with_clock(Arc::clone(&clock));
    let started = Instant::now();
    let mut records = Vec::new();

    {
        let acquisition = bridge.scoped()?;
        while clock.now() < seconds && acquisition.is_running() {
            let samples = acquisition.get_all();
            drain_into(&mut records, "threaded", samples, clock.now());
            thread::sleep(frame);
        }
        let samples = acquisition.get_all();
        drain_into(&mut records, "threaded", samples, clock.now());
    }

    Ok(RunStats {
        records,
        gaps: bridge.gap_count(),
        lost: bridge.overflow_count(),
        elapsed: started.elapsed(),
    })
}

async fn run_async(settings: &BeltSettings, seconds: f64, frame: Duration) -> Result<RunStats, Box<dyn Error>> {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let mut acquisition =
        AsyncAcquisition::new(Box::new(SimulatedBelt::new()), settings.clone()).with_clock(Arc::clone(&clock));
    let started = Instant::now();
    let mut records = Vec::new();

    acquisition.start().await?;
    while clock.now() < seconds && acquisition.is_running() {
        let samples = acquisition.get_all();
        drain_into(&mut records, "async", samples, clock.now());
        tokio::time::sleep(frame).await;
    }
    let samples = acquisition.get_all();
    drain_into(&mut records, "async", samples, clock.now());
    acquisition.stop().await;

    Ok(RunStats {
        records,
        gaps: acquisition.gap_count(),
        lost: acquisition.dropped_count(),
        elapsed: started.elapsed(),
    })
}

fn analyze(stats: &RunStats, name: &str, expected_hz: f64) {
    let records = &stats.records;
    println!("\n=== {name} Analysis ===");
    println!("Wall time: {:.2}s", stats.elapsed.as_secs_f64());
    if records.len() < 2 {
        println!("Too few samples to analyze ({})", records.len());
        return;
    }

    let first = records[0].timestamp;
    let last = records[records.len() - 1].timestamp;
    let rate = (records.len() - 1) as f64 / (last - first);
    let rate_error = (rate - expected_hz).abs() / expected_hz * 100.0;

    let latencies: Vec<f64> = records.iter().map(|r| r.handoff_latency_us).collect();
    let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
    let min = latencies.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = latencies.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let ordered = records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp);

    println!("Samples: {}", records.len());
    println!("Effective rate: {rate:.2} Hz ({rate_error:.1}% from {expected_hz:.1} Hz)");
    println!("Hand-off latency (μs): avg={avg:.1}, min={min:.1}, max={max:.1}");
    println!("Chronological: {ordered}");
    println!("Gaps: {}, lost to a full hand-off: {}", stats.gaps, stats.lost);
}

fn save_to_csv(records: &[HandoffRecord], path: &str) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn benchmark_handoff(c: &mut Criterion, capacity: usize) {
    let queue = SampleQueue::new(capacity);
    c.bench_function("queue_fill_and_drain", |b| {
        b.iter(|| {
            for i in 0..capacity {
                queue.push(Sample::new(i as f64, i as f64));
            }
            black_box(queue.drain());
        });
    });
    c.bench_function("queue_take_latest", |b| {
        b.iter(|| {
            for i in 0..64 {
                queue.push(Sample::new(i as f64, i as f64));
            }
            black_box(queue.take_latest());
        });
    });
}

fn benchmark_frame(c: &mut Criterion, config: &ExperimentConfig) -> Result<(), Box<dyn Error>> {
    let condition = config
        .conditions
        .first()
        .ok_or("config defines no conditions")?;
    let generator = TargetGenerator::for_condition(condition, 5.0, 2.0)?;
    let evaluator = FeedbackEvaluator::new(condition.feedback_gain, 5.0, config.dot.feedback_mode());
    let duration = generator.total_duration();

    c.bench_function("frame_target_and_feedback", |b| {
        let mut t = 0.0;
        b.iter(|| {
            t = (t + 0.016) % duration;
            let target = generator.get_target(black_box(t)).unwrap_or_default();
            black_box(evaluator.evaluate(&Sample::new(t, 5.5), target));
        });
    });
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: benchmark_runner <config_file> [threaded|async|both] [--seconds N] [--criterion]");
        eprintln!("Example: benchmark_runner configs/breath_tracking.toml both --seconds 10");
        eprintln!("Example: benchmark_runner configs/breath_tracking.toml both --criterion");
        std::process::exit(1);
    }

    let config_path = &args[1];
    let mode = args.get(2).map(|s| s.as_str()).unwrap_or("both");
    let use_criterion = args.iter().any(|a| a == "--criterion");
    let seconds = args
        .iter()
        .position(|a| a == "--seconds")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.parse::<f64>())
        .transpose()?
        .unwrap_or(10.0);

    let config = load_config(config_path)?;
    let settings = BeltSettings::from_config(&config.belt);
    let frame = Duration::from_millis(config.timing.frame_period_ms);
    let expected_hz = 1000.0 / settings.period_ms as f64;

    println!("========================================");
    println!("Belt Acquisition Benchmark");
    println!("========================================");
    println!("Config: {config_path}");
    println!("Experiment: {}", config.name);
    println!("Belt period: {} ms, frame period: {} ms", settings.period_ms, config.timing.frame_period_ms);
    println!("Mode: {mode}");
    println!("========================================\n");

    if use_criterion {
        let mut criterion = Criterion::default()
            .sample_size(20)
            .measurement_time(Duration::from_secs(5));
        benchmark_handoff(&mut criterion, settings.queue_capacity);
        benchmark_frame(&mut criterion, &config)?;
        criterion.final_summary();
        println!("\nCheck the target/criterion directory for detailed HTML reports.");
        return Ok(());
    }

    if mode == "threaded" || mode == "both" {
        println!("Streaming {seconds:.1}s through the THREADED bridge...");
        let stats = run_threaded(&settings, seconds, frame)?;
        analyze(&stats, "THREADED", expected_hz);
        save_to_csv(&stats.records, "threaded_handoff.csv")?;
        info!("Saved {} records to threaded_handoff.csv", stats.records.len());
        println!("Results saved to threaded_handoff.csv");
    }

    if mode == "async" || mode == "both" {
        println!("\nStreaming {seconds:.1}s through the ASYNC bridge...");
        let runtime = tokio::runtime::Runtime::new()?;
        let stats = runtime.block_on(run_async(&settings, seconds, frame))?;
        analyze(&stats, "ASYNC", expected_hz);
        save_to_csv(&stats.records, "async_handoff.csv")?;
        info!("Saved {} records to async_handoff.csv", stats.records.len());
        println!("Results saved to async_handoff.csv");
    }

    println!("\n========================================");
    println!("Benchmark complete!");
    println!("========================================");
    Ok(())
}
