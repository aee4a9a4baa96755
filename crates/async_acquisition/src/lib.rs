//! Tokio flavour of belt acquisition.
//!
//! The blocking device read runs on the blocking pool and feeds a bounded
//! mpsc channel; the consumer polls it without blocking or awaits the next
//! sample.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use acquisition::{
    fallback_settings, open_device, release_device, AcquisitionError, BeltSettings, SampleSource,
};
use common::{Clock, MonotonicClock, Sample, Transport};
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{self, JoinHandle};
use tokio::time::timeout;

type SharedSource = Arc<Mutex<Box<dyn SampleSource>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-run state shared with one reader task.
#[derive(Default)]
struct Counters {
    stop: AtomicBool,
    reads: AtomicU64,
    gaps: AtomicU64,
    dropped: AtomicU64,
    fault: Mutex<Option<String>>,
    /// Set when `stop` gave up on the reader; it then closes the device itself.
    release_on_exit: AtomicBool,
    released: AtomicBool,
}

impl Counters {
    fn idle() -> Self {
        Self {
            released: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Releases the device at most once per `start`.
    fn release_once(&self, source: &mut dyn SampleSource) {
        if !self.released.swap(true, Ordering::AcqRel) {
            release_device(source);
            debug!("Belt device released");
        }
    }

    /// Closes the device now unless a read holds it, in which case the
    /// reader is told to close it when that read returns.
    fn release_or_defer(&self, source: &SharedSource) {
        self.release_on_exit.store(true, Ordering::Release);
        match source.try_lock() {
            Ok(mut source) => self.release_once(source.as_mut()),
            Err(TryLockError::Poisoned(poisoned)) => self.release_once(poisoned.into_inner().as_mut()),
            Err(TryLockError::WouldBlock) => {
                debug!("Belt device busy in a read; the reader will close it");
            }
        }
    }
}

pub struct AsyncAcquisition {
    source: SharedSource,
    settings: BeltSettings,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    rx: Option<mpsc::Receiver<Sample>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AsyncAcquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncAcquisition")
            .field("streaming", &self.rx.is_some())
            .field("worker", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

impl AsyncAcquisition {
    pub fn new(source: Box<dyn SampleSource>, settings: BeltSettings) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            settings,
            clock: Arc::new(MonotonicClock::new()),
            counters: Arc::new(Counters::idle()),
            rx: None,
            worker: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the device on the blocking pool, then spawns the reader.
    pub async fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.is_running() {
            return Err(AcquisitionError::AlreadyStarted);
        }
        self.settings.validate()?;
        self.stop().await;

        let source = Arc::clone(&self.source);
        let settings = self.settings.clone();
        let previous = Arc::clone(&self.counters);
        let opened = task::spawn_blocking(move || {
            let mut source = lock(&source);
            // Settle a close still owed by an abandoned reader before reopening.
            previous.release_once(source.as_mut());
            let result = open_device(source.as_mut(), &settings);
            if result.is_err() {
                release_device(source.as_mut());
            }
            result
        })
        .await
        .map_err(|err| AcquisitionError::Spawn(io::Error::other(err)))?;

        if let Err(err) = opened {
            error!("Belt connection via {} failed: {err}", self.settings.transport);
            return Err(AcquisitionError::ConnectionFailure {
                transport: self.settings.transport,
                source: err,
            });
        }

        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let source = Arc::clone(&self.source);
        let clock = Arc::clone(&self.clock);
        let worker_counters = Arc::clone(&counters);

        self.worker = Some(task::spawn_blocking(move || {
            read_loop(source, tx, worker_counters, clock)
        }));
        self.counters = counters;
        self.rx = Some(rx);
        info!(
            "Async acquisition started via {} at {} ms",
            self.settings.transport, self.settings.period_ms
        );
        Ok(())
    }

    /// Newest pending sample; older ones are discarded.
    pub fn get_latest(&mut self) -> Option<Sample> {
        let rx = self.rx.as_mut()?;
        let mut latest = None;
        while let Ok(sample) = rx.try_recv() {
            latest = Some(sample);
        }
        latest
    }

    /// Every pending sample, oldest first.
    pub fn get_all(&mut self) -> Vec<Sample> {
        let mut samples = Vec::new();
        if let Some(rx) = self.rx.as_mut() {
            while let Ok(sample) = rx.try_recv() {
                samples.push(sample);
            }
        }
        samples
    }

    /// Waits for the next sample; `None` once the reader has exited and
    /// everything pending was consumed.
    pub async fn next_sample(&mut self) -> Option<Sample> {
        self.rx.as_mut()?.recv().await
    }

    /// Signals the reader, waits for it up to the settings' join timeout,
    /// then closes the device. Safe to repeat.
    pub async fn stop(&mut self) {
        self.counters.stop.store(true, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return;
        };

        let limit = self.settings.join_timeout();
        match timeout(limit, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Belt reader task failed: {err}"),
            Err(_) => warn!("Belt reader did not exit within {limit:?}; abandoning it"),
        }
        self.counters.release_or_defer(&self.source);
        info!(
            "Async acquisition stopped after {} reads ({} gaps, {} dropped)",
            self.read_count(),
            self.gap_count(),
            self.dropped_count()
        );
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
            && lock(&self.counters.fault).is_none()
    }

    pub fn last_fault(&self) -> Option<String> {
        lock(&self.counters.fault).clone()
    }

    pub fn read_count(&self) -> u64 {
        self.counters.reads.load(Ordering::Relaxed)
    }

    pub fn gap_count(&self) -> u64 {
        self.counters.gaps.load(Ordering::Relaxed)
    }

    /// Samples discarded because the channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> &BeltSettings {
        &self.settings
    }
}

impl Drop for AsyncAcquisition {
    fn drop(&mut self) {
        self.counters.stop.store(true, Ordering::Release);
        if self.worker.is_some() {
            self.counters.release_or_defer(&self.source);
        }
    }
}

/// Async counterpart of [`acquisition::connect_with_fallback`], sharing its
/// fallback policy.
pub async fn connect_with_fallback<F>(
    settings: &BeltSettings,
    fallback_to_usb: bool,
    clock: Arc<dyn Clock>,
    mut make_source: F,
) -> Result<AsyncAcquisition, AcquisitionError>
where
    F: FnMut(Transport) -> Box<dyn SampleSource>,
{
    let mut acquisition = AsyncAcquisition::new(make_source(settings.transport), settings.clone())
        .with_clock(Arc::clone(&clock));

    match acquisition.start().await {
        Ok(()) => Ok(acquisition),
        Err(err) => {
            let Some(retry) = fallback_settings(settings, fallback_to_usb, &err) else {
                return Err(err);
            };
            let mut acquisition =
                AsyncAcquisition::new(make_source(retry.transport), retry).with_clock(clock);
            acquisition.start().await?;
            Ok(acquisition)
        }
    }
}

fn read_loop(
    source: SharedSource,
    tx: mpsc::Sender<Sample>,
    counters: Arc<Counters>,
    clock: Arc<dyn Clock>,
) {
    while !counters.stop.load(Ordering::Acquire) {
        let result = lock(&source).read();
        let timestamp = clock.now();
        if counters.stop.load(Ordering::Acquire) {
            break;
        }

        match result {
            Ok(Some(values)) if !values.is_empty() => {
                counters.reads.fetch_add(1, Ordering::Relaxed);
                match tx.try_send(Sample::new(timestamp, values[0])) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Sample receiver dropped; reader exiting");
                        break;
                    }
                }
            }
            Ok(_) => {
                counters.gaps.fetch_add(1, Ordering::Relaxed);
                trace!("Empty belt read at {timestamp:.3}s");
            }
            Err(err) => {
                error!("Belt device fault, acquisition ended: {err}");
                *lock(&counters.fault) = Some(err.to_string());
                break;
            }
        }
    }

    if counters.release_on_exit.load(Ordering::Acquire) {
        counters.release_once(lock(&source).as_mut());
    }
    debug!("Belt reader task exited");
}
