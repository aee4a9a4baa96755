use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use acquisition::{
    connect_with_fallback, AcquisitionBridge, AcquisitionError, BeltSettings, SampleSource,
    SimulatedBelt, SourceError,
};
use approx::assert_relative_eq;
use common::{ManualClock, Transport};

fn settings() -> BeltSettings {
    BeltSettings {
        transport: Transport::Usb,
        device: None,
        period_ms: 100,
        channels: vec![1],
        queue_capacity: 4096,
    }
}

fn simulated(clock: &Arc<ManualClock>) -> SimulatedBelt {
    SimulatedBelt::new().with_clock(Arc::clone(clock))
}

fn bridge_over(belt: SimulatedBelt, clock: &Arc<ManualClock>) -> AcquisitionBridge {
    AcquisitionBridge::new(Box::new(belt), settings()).with_clock(clock.clone())
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Counts lifecycle calls on a wrapped belt.
struct Counting {
    inner: SimulatedBelt,
    closes: Arc<AtomicUsize>,
    /// The first read blocks this long before returning.
    stall: Option<Duration>,
}

impl Counting {
    fn new(inner: SimulatedBelt, closes: &Arc<AtomicUsize>) -> Self {
        Self {
            inner,
            closes: Arc::clone(closes),
            stall: None,
        }
    }

    fn stalling_first_read(mut self, stall: Duration) -> Self {
        self.stall = Some(stall);
        self
    }
}

impl SampleSource for Counting {
    fn open(&mut self, transport: Transport, device: Option<&str>) -> Result<(), SourceError> {
        self.inner.open(transport, device)
    }
    fn configure(&mut self, channels: &[u32]) -> Result<(), SourceError> {
        self.inner.configure(channels)
    }
    fn start(&mut self, period_ms: u64) -> Result<(), SourceError> {
        self.inner.start(period_ms)
    }
    fn read(&mut self) -> Result<Option<Vec<f64>>, SourceError> {
        if let Some(stall) = self.stall.take() {
            thread::sleep(stall);
        }
        self.inner.read()
    }
    fn stop(&mut self) -> Result<(), SourceError> {
        self.inner.stop()
    }
    fn close(&mut self) -> Result<(), SourceError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

#[test]
fn hundred_reads_arrive_complete_and_in_order() {
    let clock = Arc::new(ManualClock::new());
    let mut bridge = bridge_over(simulated(&clock).limited_to(100), &clock);
    bridge.start().unwrap();
    wait_until("100 reads", || bridge.read_count() == 100);

    let samples = bridge.get_all();
    bridge.stop();

    assert_eq!(samples.len(), 100);
    assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    let first = samples[0].timestamp;
    let last = samples[99].timestamp;
    assert_relative_eq!(first, 0.1, epsilon = 1e-9);
    assert_relative_eq!(last, 10.0, epsilon = 1e-9);
    let rate = 99.0 / (last - first);
    assert!((rate - 10.0).abs() / 10.0 < 0.05, "rate {rate}");
    assert!(bridge.get_all().is_empty());
}

#[test]
fn get_latest_never_repeats_and_moves_forward() {
    // Wall-clock pacing so the consumer polls faster than the producer.
    let belt = SimulatedBelt::new().limited_to(15);
    let mut bridge = AcquisitionBridge::new(
        Box::new(belt),
        BeltSettings {
            period_ms: 10,
            ..settings()
        },
    );
    bridge.start().unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while bridge.read_count() < 15 && Instant::now() < deadline {
        if let Some(sample) = bridge.get_latest() {
            seen.push(sample);
        }
        thread::sleep(Duration::from_millis(2));
    }
    if let Some(sample) = bridge.get_latest() {
        seen.push(sample);
    }
    bridge.stop();

    assert!(seen.len() > 1);
    assert!(seen.len() <= 15);
    assert!(seen.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert_eq!(bridge.get_latest(), None);
}

#[test]
fn empty_polls_do_not_block() {
    let clock = Arc::new(ManualClock::new());
    let mut bridge = bridge_over(simulated(&clock).limited_to(0), &clock);
    bridge.start().unwrap();

    for _ in 0..100 {
        let started = Instant::now();
        assert_eq!(bridge.get_latest(), None);
        assert!(bridge.get_all().is_empty());
        assert!(started.elapsed() < Duration::from_millis(1));
    }
    bridge.stop();
}

#[test]
fn stop_is_idempotent() {
    let clock = Arc::new(ManualClock::new());
    let mut never_started = bridge_over(simulated(&clock), &clock);
    never_started.stop();
    never_started.stop();
    assert!(!never_started.is_running());

    let mut bridge = bridge_over(simulated(&clock), &clock);
    bridge.start().unwrap();
    assert!(bridge.is_running());
    bridge.stop();
    bridge.stop();
    assert!(!bridge.is_running());
}

#[test]
fn starting_twice_is_rejected() {
    let clock = Arc::new(ManualClock::new());
    let mut bridge = bridge_over(simulated(&clock), &clock);
    bridge.start().unwrap();
    assert!(matches!(bridge.start(), Err(AcquisitionError::AlreadyStarted)));
    bridge.stop();
    bridge.start().unwrap();
    bridge.stop();
}

#[test]
fn open_failure_is_reported_synchronously() {
    let clock = Arc::new(ManualClock::new());
    let mut bridge = bridge_over(simulated(&clock).refusing(Transport::Usb), &clock);
    let err = bridge.start().unwrap_err();
    assert!(err.is_connection_failure());
    assert!(!bridge.is_running());
}

#[test]
fn device_fault_surfaces_through_is_running() {
    let clock = Arc::new(ManualClock::new());
    let mut bridge = bridge_over(simulated(&clock).faulting_after(5), &clock);
    bridge.start().unwrap();
    wait_until("fault", || !bridge.is_running());

    assert!(bridge.last_fault().unwrap().contains("transport loss"));
    // Samples read before the fault are still delivered.
    assert_eq!(bridge.get_all().len(), 5);
    bridge.stop();
}

#[test]
fn gaps_are_tolerated() {
    let clock = Arc::new(ManualClock::new());
    let belt = simulated(&clock).with_gaps_at([2, 3, 7]).limited_to(10);
    let mut bridge = bridge_over(belt, &clock);
    bridge.start().unwrap();
    wait_until("7 samples", || bridge.read_count() == 7);

    assert!(bridge.is_running());
    assert!(bridge.gap_count() >= 3);
    assert_eq!(bridge.get_all().len(), 7);
    bridge.stop();
}

#[test]
fn scoped_acquisition_closes_once_on_early_exit() {
    let clock = Arc::new(ManualClock::new());
    let closes = Arc::new(AtomicUsize::new(0));
    let source = Counting::new(simulated(&clock), &closes);
    let mut bridge = AcquisitionBridge::new(Box::new(source), settings()).with_clock(clock.clone());

    let first_sample = (|| {
        let acquisition = bridge.scoped()?;
        loop {
            if let Some(sample) = acquisition.get_latest() {
                return Ok::<_, AcquisitionError>(sample);
            }
            thread::sleep(Duration::from_millis(1));
        }
    })()
    .unwrap();

    assert!(first_sample.timestamp > 0.0);
    assert!(!bridge.is_running());
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    drop(bridge);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn scoped_acquisition_closes_once_on_panic() {
    let clock = Arc::new(ManualClock::new());
    let closes = Arc::new(AtomicUsize::new(0));
    let source = Counting::new(simulated(&clock), &closes);
    let mut bridge = AcquisitionBridge::new(Box::new(source), settings()).with_clock(clock.clone());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let acquisition = bridge.scoped().unwrap();
        wait_until("three reads", || acquisition.read_count() >= 3);
        panic!("consumer failed mid-trial");
    }));

    assert!(outcome.is_err());
    assert!(!bridge.is_running());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    drop(bridge);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

/// Period 10 ms gives a join timeout of 1.02 s, shorter than the stall.
fn stalling_bridge(closes: &Arc<AtomicUsize>) -> AcquisitionBridge {
    let source = Counting::new(SimulatedBelt::new(), closes).stalling_first_read(Duration::from_millis(1500));
    let settings = BeltSettings {
        period_ms: 10,
        ..settings()
    };
    AcquisitionBridge::new(Box::new(source), settings)
}

#[test]
fn stop_abandons_a_stalled_reader_and_closes_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let mut bridge = stalling_bridge(&closes);
    bridge.start().unwrap();
    thread::sleep(Duration::from_millis(50));

    let began = Instant::now();
    bridge.stop();
    let waited = began.elapsed();

    assert!(waited >= Duration::from_secs(1), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(1400), "returned after {waited:?}");
    assert!(!bridge.is_running());
    // The read still holds the device; the reader closes it once it returns.
    assert_eq!(closes.load(Ordering::SeqCst), 0);
    wait_until("deferred close", || closes.load(Ordering::SeqCst) == 1);

    bridge.stop();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.get_all(), Vec::new());
}

#[test]
fn restart_after_abandoned_reader_keeps_new_device_open() {
    let closes = Arc::new(AtomicUsize::new(0));
    let mut bridge = stalling_bridge(&closes);
    bridge.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    bridge.stop();

    bridge.start().unwrap();
    wait_until("reads after restart", || bridge.read_count() >= 5);
    thread::sleep(Duration::from_millis(100));

    assert!(bridge.is_running());
    assert_eq!(bridge.last_fault(), None);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    bridge.stop();
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[test]
fn ble_failure_falls_back_to_usb() {
    let clock = Arc::new(ManualClock::new());
    let mut attempts = Vec::new();
    let ble = BeltSettings {
        transport: Transport::Ble,
        device: Some("proximity_pairing".to_string()),
        ..settings()
    };

    let mut bridge = connect_with_fallback(&ble, true, clock.clone(), |transport| {
        attempts.push(transport);
        Box::new(
            SimulatedBelt::new()
                .with_clock(clock.clone())
                .refusing(Transport::Ble),
        )
    })
    .unwrap();

    assert_eq!(attempts, vec![Transport::Ble, Transport::Usb]);
    assert_eq!(bridge.settings().transport, Transport::Usb);
    assert!(bridge.is_running());
    bridge.stop();
}

#[test]
fn fallback_disabled_surfaces_ble_failure() {
    let clock = Arc::new(ManualClock::new());
    let ble = BeltSettings {
        transport: Transport::Ble,
        ..settings()
    };
    let result = connect_with_fallback(&ble, false, clock.clone(), |_| {
        Box::new(SimulatedBelt::new().refusing(Transport::Ble))
    });
    match result {
        Err(AcquisitionError::ConnectionFailure { transport, .. }) => {
            assert_eq!(transport, Transport::Ble)
        }
        other => panic!("expected connection failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn replayed_session_streams_recorded_forces() {
    use acquisition::ReplaySource;
    use common::{SessionRecorder, SessionRow};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recorded.csv");
    let columns = vec!["frame".to_string(), "force_n".to_string()];
    let mut recorder = SessionRecorder::create(&path, &columns).unwrap();
    for (frame, force) in [(1, 4.0), (2, 4.5), (3, 5.25)] {
        recorder
            .record(&SessionRow {
                frame,
                force_n: force,
                ..SessionRow::default()
            })
            .unwrap();
    }
    recorder.close().unwrap();

    let clock = Arc::new(ManualClock::new());
    let replay = ReplaySource::from_session_file(&path).unwrap().with_clock(clock.clone());
    let mut bridge = AcquisitionBridge::new(Box::new(replay), settings()).with_clock(clock);
    bridge.start().unwrap();
    wait_until("replay", || bridge.read_count() == 3);

    let values: Vec<f64> = bridge.get_all().iter().map(|s| s.value).collect();
    assert_eq!(values, vec![4.0, 4.5, 5.25]);
    assert!(bridge.is_running());
    bridge.stop();
}
