use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use common::config::{BeltConfig, MIN_PERIOD_MS};
use common::{Clock, MonotonicClock, Sample, Transport};
use log::{debug, error, info, trace, warn};

use crate::error::AcquisitionError;
use crate::source::{open_device, release_device, SampleSource};

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Consecutive empty reads before the reader logs a warning.
const GAP_WARN_STREAK: u64 = 20;
const JOIN_POLL: Duration = Duration::from_millis(1);

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the bridge hands the device on `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct BeltSettings {
    pub transport: Transport,
    pub device: Option<String>,
    pub period_ms: u64,
    pub channels: Vec<u32>,
    pub queue_capacity: usize,
}

impl Default for BeltSettings {
    fn default() -> Self {
        Self::from_config(&BeltConfig::default())
    }
}

impl BeltSettings {
    pub fn from_config(belt: &BeltConfig) -> Self {
        Self {
            transport: belt.transport,
            device: belt.device.clone(),
            period_ms: belt.period_ms,
            channels: belt.channels.clone(),
            queue_capacity: belt.queue_capacity,
        }
    }

    /// Same settings over `transport`, auto-selecting the device.
    pub fn over(&self, transport: Transport) -> Self {
        Self {
            transport,
            device: None,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if self.period_ms < MIN_PERIOD_MS {
            return Err(AcquisitionError::InvalidSettings(format!(
                "period_ms must be at least {MIN_PERIOD_MS}, got {}",
                self.period_ms
            )));
        }
        if self.channels.is_empty() {
            return Err(AcquisitionError::InvalidSettings(
                "at least one channel must be enabled".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(AcquisitionError::InvalidSettings(
                "queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// How long `stop` waits for the reader: two periods plus a second.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.period_ms * 2) + Duration::from_secs(1)
    }
}

/// Bounded single-producer/single-consumer hand-off.
///
/// When full, the oldest sample is dropped and counted.
#[derive(Clone)]
pub struct SampleQueue {
    samples: Arc<Mutex<VecDeque<Sample>>>,
    capacity: usize,
    overflowed: Arc<AtomicU64>,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
            overflowed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn push(&self, sample: Sample) {
        let mut samples = lock(&self.samples);
        if samples.len() >= self.capacity {
            samples.pop_front();
            self.overflowed.fetch_add(1, Ordering::Relaxed);
        }
        samples.push_back(sample);
    }

    /// Newest pending sample; everything older is discarded.
    pub fn take_latest(&self) -> Option<Sample> {
        let mut samples = lock(&self.samples);
        let latest = samples.pop_back();
        samples.clear();
        latest
    }

    /// Every pending sample, oldest first.
    pub fn drain(&self) -> Vec<Sample> {
        lock(&self.samples).drain(..).collect()
    }

    pub fn clear(&self) {
        lock(&self.samples).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

/// State shared between the bridge and its reader thread.
#[derive(Default)]
struct Shared {
    stop: AtomicBool,
    alive: AtomicBool,
    fault: Mutex<Option<String>>,
    reads: AtomicU64,
    gaps: AtomicU64,
    /// Set when `stop` gave up on the reader; it then closes the device itself.
    release_on_exit: AtomicBool,
    released: AtomicBool,
}

impl Shared {
    /// State of a bridge that has no device to release.
    fn idle() -> Self {
        Self {
            released: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn has_fault(&self) -> bool {
        lock(&self.fault).is_some()
    }

    /// Releases the device at most once per `start`.
    fn release_once(&self, source: &mut dyn SampleSource) {
        if !self.released.swap(true, Ordering::AcqRel) {
            release_device(source);
            debug!("Belt device released");
        }
    }
}

type SharedSource = Arc<Mutex<Box<dyn SampleSource>>>;

/// Runs a blocking [`SampleSource`] on a background thread and hands its
/// samples to a consumer that must never block.
pub struct AcquisitionBridge {
    source: SharedSource,
    settings: BeltSettings,
    clock: Arc<dyn Clock>,
    queue: SampleQueue,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    opened: bool,
    started_at: Option<f64>,
}

impl AcquisitionBridge {
    pub fn new(source: Box<dyn SampleSource>, settings: BeltSettings) -> Self {
        let queue = SampleQueue::new(settings.queue_capacity);
        Self {
            source: Arc::new(Mutex::new(source)),
            settings,
            clock: Arc::new(MonotonicClock::new()),
            queue,
            shared: Arc::new(Shared::idle()),
            reader: None,
            opened: false,
            started_at: None,
        }
    }

    /// Timestamps come from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the device and launches the reader thread.
    ///
    /// A device that cannot be opened, configured or started yields
    /// [`AcquisitionError::ConnectionFailure`]. Starting a running bridge
    /// is an error; a bridge that faulted or was stopped may be restarted.
    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.is_running() {
            return Err(AcquisitionError::AlreadyStarted);
        }
        self.settings.validate()?;
        // A faulted run still owns an open device and a finished thread.
        self.stop();

        {
            let mut source = lock(&self.source);
            // An abandoned reader may still owe the previous run a close;
            // settle it here so it can never close the device opened below.
            self.shared.release_once(source.as_mut());
            if let Err(err) = open_device(source.as_mut(), &self.settings) {
                error!("Belt connection via {} failed: {err}", self.settings.transport);
                release_device(source.as_mut());
                return Err(AcquisitionError::ConnectionFailure {
                    transport: self.settings.transport,
                    source: err,
                });
            }
        }

        // Fresh state per run: an abandoned reader keeps the old one.
        self.queue = SampleQueue::new(self.settings.queue_capacity);
        self.shared = Arc::new(Shared::default());
        self.shared.alive.store(true, Ordering::Release);
        self.opened = true;
        self.started_at = Some(self.clock.now());

        let source = Arc::clone(&self.source);
        let queue = self.queue.clone();
        let shared = Arc::clone(&self.shared);
        let clock = Arc::clone(&self.clock);
        let period = Duration::from_millis(self.settings.period_ms);

        let spawned = thread::Builder::new()
            .name("belt-reader".to_string())
            .spawn(move || read_loop(source, queue, shared, clock, period));

        match spawned {
            Ok(handle) => {
                self.reader = Some(handle);
                info!(
                    "Acquisition started via {} at {} ms",
                    self.settings.transport, self.settings.period_ms
                );
                Ok(())
            }
            Err(err) => {
                self.shared.alive.store(false, Ordering::Release);
                self.opened = false;
                self.shared.release_once(lock(&self.source).as_mut());
                Err(AcquisitionError::Spawn(err))
            }
        }
    }

    /// Most recent sample since the previous `get_latest`/`get_all`;
    /// older pending samples are discarded.
    pub fn get_latest(&self) -> Option<Sample> {
        self.queue.take_latest()
    }

    /// Every sample since the previous `get_latest`/`get_all`, oldest first.
    pub fn get_all(&self) -> Vec<Sample> {
        self.queue.drain()
    }

    /// Signals the reader, waits up to [`BeltSettings::join_timeout`], then
    /// stops and closes the device. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);

        if let Some(handle) = self.reader.take() {
            let deadline = Instant::now() + self.settings.join_timeout();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Belt reader thread panicked");
                }
            } else {
                warn!(
                    "Belt reader did not exit within {:?}; abandoning it",
                    self.settings.join_timeout()
                );
                self.shared.release_on_exit.store(true, Ordering::Release);
            }
        }

        if !self.opened {
            return;
        }
        self.opened = false;

        match self.source.try_lock() {
            Ok(mut source) => self.shared.release_once(source.as_mut()),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                self.shared.release_once(poisoned.into_inner().as_mut())
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                debug!("Belt device busy in a read; the reader will close it");
            }
        }
        self.shared.alive.store(false, Ordering::Release);
        info!(
            "Acquisition stopped after {} reads ({} gaps, {} overflowed)",
            self.read_count(),
            self.gap_count(),
            self.overflow_count()
        );
    }

    /// True while the reader is alive and no fault has been recorded.
    pub fn is_running(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire) && !self.shared.has_fault()
    }

    /// Message of the fault that ended the last run, if any.
    pub fn last_fault(&self) -> Option<String> {
        lock(&self.shared.fault).clone()
    }

    pub fn read_count(&self) -> u64 {
        self.shared.reads.load(Ordering::Relaxed)
    }

    pub fn gap_count(&self) -> u64 {
        self.shared.gaps.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.queue.overflow_count()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn settings(&self) -> &BeltSettings {
        &self.settings
    }

    /// Bridge clock reading taken just before the reader was launched.
    pub fn started_at(&self) -> Option<f64> {
        self.started_at
    }

    /// Starts acquisition for the lifetime of the returned guard; dropping
    /// the guard stops it on every exit path.
    pub fn scoped(&mut self) -> Result<ScopedAcquisition<'_>, AcquisitionError> {
        self.start()?;
        Ok(self.guard())
    }

    /// Ties an already started bridge to a guard that stops it on drop.
    pub fn guard(&mut self) -> ScopedAcquisition<'_> {
        ScopedAcquisition { bridge: self }
    }
}

impl Drop for AcquisitionBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Guard returned by [`AcquisitionBridge::scoped`].
pub struct ScopedAcquisition<'a> {
    bridge: &'a mut AcquisitionBridge,
}

impl Deref for ScopedAcquisition<'_> {
    type Target = AcquisitionBridge;

    fn deref(&self) -> &Self::Target {
        self.bridge
    }
}

impl DerefMut for ScopedAcquisition<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.bridge
    }
}

impl Drop for ScopedAcquisition<'_> {
    fn drop(&mut self) {
        self.bridge.stop();
    }
}

fn read_loop(
    source: SharedSource,
    queue: SampleQueue,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    period: Duration,
) {
    debug!("Belt reader running, period {period:?}");
    let mut gap_streak = 0u64;

    while !shared.stop.load(Ordering::Acquire) {
        let result = lock(&source).read();
        let timestamp = clock.now();
        if shared.stop.load(Ordering::Acquire) {
            debug!("Stop requested during a read; discarding it");
            break;
        }

        match result {
            Ok(Some(values)) if !values.is_empty() => {
                queue.push(Sample::new(timestamp, values[0]));
                shared.reads.fetch_add(1, Ordering::Relaxed);
                if gap_streak >= GAP_WARN_STREAK {
                    info!("Belt data resumed after {gap_streak} empty reads");
                }
                gap_streak = 0;
            }
            Ok(_) => {
                shared.gaps.fetch_add(1, Ordering::Relaxed);
                gap_streak += 1;
                trace!("Empty belt read at {timestamp:.3}s");
                if gap_streak == GAP_WARN_STREAK {
                    warn!("No belt data for {gap_streak} consecutive reads");
                }
            }
            Err(err) => {
                error!("Belt device fault, acquisition ended: {err}");
                *lock(&shared.fault) = Some(err.to_string());
                break;
            }
        }
    }

    if shared.release_on_exit.load(Ordering::Acquire) {
        shared.release_once(lock(&source).as_mut());
    }
    shared.alive.store(false, Ordering::Release);
    debug!("Belt reader exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_when_full() {
        let queue = SampleQueue::new(3);
        for i in 0..5 {
            queue.push(Sample::new(i as f64, i as f64));
        }
        assert_eq!(queue.overflow_count(), 2);
        let values: Vec<f64> = queue.drain().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn take_latest_discards_older() {
        let queue = SampleQueue::new(8);
        queue.push(Sample::new(0.1, 1.0));
        queue.push(Sample::new(0.2, 2.0));
        assert_eq!(queue.take_latest(), Some(Sample::new(0.2, 2.0)));
        assert_eq!(queue.take_latest(), None);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn settings_validation() {
        let settings = BeltSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.join_timeout(), Duration::from_millis(1200));

        let fast = BeltSettings {
            period_ms: 5,
            ..BeltSettings::default()
        };
        assert!(matches!(fast.validate(), Err(AcquisitionError::InvalidSettings(_))));

        let silent = BeltSettings {
            channels: vec![],
            ..BeltSettings::default()
        };
        assert!(silent.validate().is_err());
    }

    #[test]
    fn fallback_settings_drop_device_selector() {
        let usb = BeltSettings::default().over(Transport::Usb);
        assert_eq!(usb.transport, Transport::Usb);
        assert_eq!(usb.device, None);
        assert_eq!(usb.period_ms, 100);
    }
}
